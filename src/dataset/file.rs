//! Filesystem-backed datasets: one directory with a fixed, sorted file
//! listing resolved at browse time.

use std::path::{Path, PathBuf};

use futures::stream::{FuturesUnordered, StreamExt};
use image::{DynamicImage, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::dataset::{Payload, ReadOptions};
use crate::errors::Error;
use crate::process::{encode_data_uri, Export, THUMBNAIL_SIZE};

/// Allowed file extensions (lower-cased before comparison).
pub const FORMATS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff", "txt", "csv"];

/// Internal/cache directories excluded from scans.
const EXCLUDED_DIRS: &[&str] = &["cache", "tiled_local_copy"];

/// Expand a browse format into the extension allow-list it stands for.
/// `*` selects every supported format; `jpg` and `tif` pull in their
/// spelling variants.
pub fn expand_formats(format: &str) -> Vec<String> {
    let ext = format
        .trim_start_matches("**/*")
        .trim_start_matches('*')
        .trim_start_matches('.')
        .to_ascii_lowercase();

    match ext.as_str() {
        "" => FORMATS.iter().map(|f| f.to_string()).collect(),
        "jpg" | "jpeg" => vec!["jpg".into(), "jpeg".into()],
        "tif" | "tiff" => vec!["tif".into(), "tiff".into()],
        other => vec![other.to_string()],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDataset {
    /// Directory path, relative to the project root.
    pub uri: String,
    /// Element count of this dataset plus all prior datasets in the
    /// project's ordered list.
    #[serde(default)]
    pub cumulative_data_count: usize,
    /// Relative file names within the directory, fixed at browse time.
    #[serde(default)]
    pub filenames: Vec<String>,
}

impl FileDataset {
    /// Browse the selected sub-directories (or the root itself when none are
    /// selected) and produce one dataset per directory, with cumulative
    /// counts assigned in selection order.
    pub fn browse(
        root: &Path,
        extensions: &[String],
        selected_sub_uris: &[String],
    ) -> Result<Vec<FileDataset>, Error> {
        let selected: Vec<String> = if selected_sub_uris.is_empty() {
            vec![String::new()]
        } else {
            selected_sub_uris.to_vec()
        };

        let mut datasets = Vec::with_capacity(selected.len());
        let mut cumulative = 0;

        for sub_uri in selected {
            let dir = root.join(&sub_uri);
            if !dir.is_dir() {
                debug!("skipping {:?}: not a directory", dir);
                continue;
            }

            let filenames = scan_directory(&dir, extensions);
            cumulative += filenames.len();
            datasets.push(FileDataset {
                uri: sub_uri,
                cumulative_data_count: cumulative,
                filenames,
            });
        }

        Ok(datasets)
    }

    /// Resolved element URIs for the given local indices. Out-of-range
    /// indices yield `None`: the listing is fixed at browse time and may go
    /// stale if the directory mutates underneath it (lenient by design).
    pub fn uris(&self, root_uri: &str, indices: &[usize]) -> Vec<Option<String>> {
        indices
            .iter()
            .map(|&i| {
                self.filenames
                    .get(i)
                    .map(|name| join_uri(&[root_uri, &self.uri, name]))
            })
            .collect()
    }

    /// Read and post-process the elements at the given local indices,
    /// returning payloads and URIs aligned with the input. One blocking
    /// task per file, reassembled in input order.
    pub async fn read(
        &self,
        root_uri: &str,
        indices: &[usize],
        opts: &ReadOptions,
    ) -> Result<(Vec<Option<Payload>>, Vec<Option<String>>), Error> {
        let uris = self.uris(root_uri, indices);

        let mut tasks = FuturesUnordered::new();
        for (slot, &i) in indices.iter().enumerate() {
            let name = match self.filenames.get(i) {
                Some(name) => name,
                None => {
                    debug!(
                        "index {} beyond listing of {} ({} files), skipping",
                        i,
                        self.uri,
                        self.filenames.len()
                    );
                    continue;
                }
            };

            let path: PathBuf = Path::new(root_uri).join(&self.uri).join(name);
            let opts = *opts;
            tasks.push(tokio::task::spawn_blocking(move || {
                (slot, read_data_point(&path, &opts))
            }));
        }

        let mut payloads: Vec<Option<Payload>> = vec![None; indices.len()];
        while let Some(joined) = tasks.next().await {
            let (slot, result) = joined.map_err(|e| Error::Unsupported(e.to_string()))?;
            payloads[slot] = Some(result?);
        }

        Ok((payloads, uris))
    }

    /// Local index of an element URI. Matched against the full
    /// `{dataset}/{filename}` tail so nested filenames resolve even for a
    /// root-browsed dataset with an empty uri.
    pub fn get_uri_index(&self, uri: &str) -> Option<usize> {
        self.filenames.iter().position(|name| {
            let tail = join_uri(&[self.uri.as_str(), name.as_str()]);
            uri == tail || uri.ends_with(&format!("/{}", tail))
        })
    }
}

/// Decode one image file and export it per the requested options.
fn read_data_point(path: &Path, opts: &ReadOptions) -> Result<Payload, Error> {
    let mut img = image::open(path)?;

    if opts.log {
        img = log_image(&img);
    }

    if opts.export == Export::Image {
        return Ok(Payload::Image(img));
    }

    if opts.resize {
        img = img.resize(
            THUMBNAIL_SIZE,
            THUMBNAIL_SIZE,
            image::imageops::FilterType::Lanczos3,
        );
    }

    Ok(Payload::Encoded(encode_data_uri(
        &img,
        ImageOutputFormat::Jpeg(85),
        "image/jpeg",
    )?))
}

/// `ln(x + 1)` over the decoded pixels, rescaled to 8-bit by the min-max of
/// this single image.
fn log_image(img: &DynamicImage) -> DynamicImage {
    let gray = img.to_luma32f();
    let logged: Vec<f32> = gray.pixels().map(|p| (p.0[0] + 1.0).ln()).collect();

    let lo = logged.iter().cloned().fold(f32::INFINITY, f32::min);
    let hi = logged.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = if hi > lo { hi - lo } else { 1.0 };

    let bytes: Vec<u8> = logged
        .iter()
        .map(|&v| ((v - lo) / range * 255.0) as u8)
        .collect();

    match image::GrayImage::from_raw(gray.width(), gray.height(), bytes) {
        Some(buf) => DynamicImage::ImageLuma8(buf),
        None => img.clone(),
    }
}

/// Recursively enumerate matching files under `dir`, excluding hidden
/// entries and internal cache directories. Names are sorted so the mapping
/// between file order and local index is stable.
fn scan_directory(dir: &Path, extensions: &[String]) -> Vec<String> {
    let mut filenames: Vec<String> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|s| {
                    entry.depth() == 0
                        || (!s.starts_with('.') && !EXCLUDED_DIRS.contains(&s))
                })
                .unwrap_or(false)
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|want| want == &ext.to_ascii_lowercase()))
                .unwrap_or(false)
        })
        .filter_map(|e| {
            e.path()
                .strip_prefix(dir)
                .ok()
                .map(|rel| rel.to_string_lossy().to_string())
        })
        .collect();

    filenames.sort();
    filenames
}

fn join_uri(segments: &[&str]) -> String {
    segments
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| s.trim_end_matches('/'))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in &["b.png", "a.png", "c.tiff", "notes.txt", "skip.dat"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("tiled_local_copy")).unwrap();
        fs::write(dir.path().join("tiled_local_copy/cached.png"), b"x").unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join(".hidden/secret.png"), b"x").unwrap();
        dir
    }

    #[test]
    fn scan_is_sorted_and_filtered() {
        let dir = fixture();
        let exts: Vec<String> = FORMATS.iter().map(|f| f.to_string()).collect();
        let names = scan_directory(dir.path(), &exts);
        assert_eq!(names, vec!["a.png", "b.png", "c.tiff", "notes.txt"]);
    }

    #[test]
    fn format_expansion() {
        assert_eq!(expand_formats("**/*.jpg"), vec!["jpg", "jpeg"]);
        assert_eq!(expand_formats(".tif"), vec!["tif", "tiff"]);
        assert_eq!(expand_formats("png"), vec!["png"]);
        assert_eq!(expand_formats("*").len(), FORMATS.len());
    }

    #[test]
    fn browse_assigns_cumulative_counts() {
        let dir = fixture();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/d.png"), b"x").unwrap();

        let exts: Vec<String> = vec!["png".into()];
        let datasets = FileDataset::browse(
            dir.path(),
            &exts,
            &[String::new(), "sub".to_string()],
        )
        .unwrap();

        assert_eq!(datasets.len(), 2);
        // Root scan recurses into sub/ as well.
        assert_eq!(datasets[0].cumulative_data_count, 3);
        assert_eq!(
            datasets[1].cumulative_data_count,
            datasets[0].cumulative_data_count + 1
        );
        assert_eq!(datasets[1].filenames, vec!["d.png"]);
    }

    #[test]
    fn uri_index_round_trip() {
        let ds = FileDataset {
            uri: "scans".into(),
            cumulative_data_count: 2,
            filenames: vec!["a.png".into(), "b.png".into()],
        };
        let uris = ds.uris("/data", &[0, 1, 5]);
        assert_eq!(uris[0].as_deref(), Some("/data/scans/a.png"));
        assert_eq!(uris[2], None);
        assert_eq!(ds.get_uri_index("/data/scans/b.png"), Some(1));
    }

    #[test]
    fn uri_index_resolves_nested_files_of_a_root_dataset() {
        let ds = FileDataset {
            uri: String::new(),
            cumulative_data_count: 3,
            filenames: vec!["a.png".into(), "sub/d.png".into(), "sub/deep/e.png".into()],
        };
        let uris = ds.uris("/data", &[1, 2]);
        assert_eq!(uris[0].as_deref(), Some("/data/sub/d.png"));

        assert_eq!(ds.get_uri_index("/data/sub/d.png"), Some(1));
        assert_eq!(ds.get_uri_index("/data/sub/deep/e.png"), Some(2));
        assert_eq!(ds.get_uri_index("/data/a.png"), Some(0));
        assert_eq!(ds.get_uri_index("/data/other/d.png"), None);
    }
}
