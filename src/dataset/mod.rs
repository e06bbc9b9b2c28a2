//! Dataset variants: one directory of image files or one remote array node,
//! each contributing a contiguous run of the project's global index space.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::process::{Export, ProcessOptions};
use crate::tiled::Block;

mod file;
mod tiled;

pub use file::{expand_formats, FileDataset, FORMATS};
pub use tiled::TiledDataset;

/// The result of reading one element.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Decoded in-memory image.
    Image(DynamicImage),
    /// Base64 data URI.
    Encoded(String),
    /// Untouched numeric block (materialization path).
    Raw(Block),
}

impl Payload {
    pub fn as_encoded(&self) -> Option<&str> {
        match self {
            Payload::Encoded(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&DynamicImage> {
        match self {
            Payload::Image(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Block> {
        match self {
            Payload::Raw(b) => Some(b),
            _ => None,
        }
    }
}

/// Options for a multi-index read.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub export: Export,
    pub resize: bool,
    pub log: bool,
    /// (low, high) percentile window; (0, 100) means plain min-max.
    pub percentiles: (f32, f32),
    /// Stride the trailing spatial axes on the remote backend. Browse
    /// contexts only, never full-fidelity export.
    pub downsample: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            export: Export::Base64,
            resize: true,
            log: false,
            percentiles: (0.0, 100.0),
            downsample: false,
        }
    }
}

impl ReadOptions {
    pub fn process(&self) -> ProcessOptions {
        ProcessOptions {
            log: self.log,
            resize: self.resize,
            export: self.export,
            percentiles: self.percentiles,
        }
    }
}

/// One source in a data project. Tagged union over the two backends; the
/// project dispatches on its declared kind, never on runtime inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatasetType {
    File(FileDataset),
    Tiled(TiledDataset),
}

impl DatasetType {
    pub fn uri(&self) -> &str {
        match self {
            DatasetType::File(d) => &d.uri,
            DatasetType::Tiled(d) => &d.uri,
        }
    }

    /// Total element count of this source plus all its predecessors.
    pub fn cumulative_data_count(&self) -> usize {
        match self {
            DatasetType::File(d) => d.cumulative_data_count,
            DatasetType::Tiled(d) => d.cumulative_data_count,
        }
    }

    /// Local index of an element URI within this source, when it belongs
    /// here.
    pub fn get_uri_index(&self, uri: &str) -> Option<usize> {
        match self {
            DatasetType::File(d) => d.get_uri_index(uri),
            DatasetType::Tiled(d) => d.get_uri_index(uri),
        }
    }
}
