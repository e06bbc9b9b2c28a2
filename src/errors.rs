use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy for browse, read and materialize operations.
///
/// Per-element read failures are absorbed into `None` slots by the project
/// fan-out and never surface as a call-level error; browse and materialize
/// failures propagate.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote endpoint is unreachable or rejected the credentials.
    /// Recoverable; callers should surface a retry-capable state.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A requested global index is outside `[0, total)`. Caller error,
    /// fails fast.
    #[error("index {index} out of range (total data count: {total})")]
    IndexOutOfRange { index: usize, total: usize },

    /// A remote fetch failed for one element or node.
    #[error("fetch failed for {uri}: {reason}")]
    Fetch { uri: String, reason: String },

    /// A local write failed during materialization. Aborts the remaining
    /// batch; remediation differs from a fetch failure.
    #[error("materialize write failed for {path:?}: {source}")]
    MaterializeWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid project description: {0}")]
    Description(#[from] serde_json::Error),

    #[error("{0}")]
    Unsupported(String),
}
