//! # Data projects
//!
//! A [`DataProject`] owns an ordered list of datasets backed by one backend
//! kind and presents them as a single flat index space. Global indices are
//! resolved to their owning dataset by binary search over the cumulative
//! data counts; multi-index reads fan out one task per dataset and scatter
//! the results back into the caller's original order.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{StreamExt, TryStreamExt};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dataset::{DatasetType, FileDataset, Payload, ReadOptions, TiledDataset};
use crate::errors::Error;
use crate::process::Export;
use crate::tiled::{Block, HttpTiledClient, TiledClient};

/// Cache directory for materialized remote elements, below the target root.
pub const LOCAL_COPY_DIR: &str = "tiled_local_copy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    File,
    Tiled,
}

impl std::str::FromStr for DataKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<DataKind, Error> {
        match s {
            "file" => Ok(DataKind::File),
            "tiled" => Ok(DataKind::Tiled),
            other => Err(Error::Unsupported(format!("unknown data type: {}", other))),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DataProject {
    /// Base location all datasets are relative to: a directory root or the
    /// tiled service endpoint.
    pub root_uri: String,
    pub data_type: DataKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Insertion order is global index order; `cumulative_data_count` is
    /// non-decreasing along this list.
    #[serde(default)]
    pub datasets: Vec<DatasetType>,
    /// Pre-built client handle; absent means one is constructed on demand
    /// from `root_uri` and `api_key`.
    #[serde(skip)]
    client: Option<Arc<dyn TiledClient>>,
}

impl fmt::Debug for DataProject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataProject <{:?} {} ({} datasets, {} elements)>",
            self.data_type,
            self.root_uri,
            self.datasets.len(),
            self.total()
        )
    }
}

/// Local indices owned by one dataset, with the output slots they map back
/// to.
struct Partition {
    dataset: usize,
    locals: Vec<usize>,
    slots: Vec<usize>,
}

impl DataProject {
    pub fn new(data_type: DataKind, root_uri: &str, api_key: Option<String>) -> DataProject {
        DataProject {
            root_uri: root_uri.to_string(),
            data_type,
            api_key,
            project_id: None,
            datasets: Vec::new(),
            client: None,
        }
    }

    /// Inject a pre-built tiled client, bypassing per-call construction.
    pub fn with_client(mut self, client: Arc<dyn TiledClient>) -> DataProject {
        self.client = Some(client);
        self
    }

    /// Total number of addressable elements across all datasets.
    pub fn total(&self) -> usize {
        self.datasets
            .last()
            .map(|d| d.cumulative_data_count())
            .unwrap_or(0)
    }

    pub fn to_dict(&self) -> Result<serde_json::Value, Error> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_dict(dict: &serde_json::Value) -> Result<DataProject, Error> {
        Ok(serde_json::from_value(dict.clone())?)
    }

    /// Persist the project description as JSON at an explicit location.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Reload a project description saved with [`DataProject::save`].
    pub fn load(path: &Path) -> Result<DataProject, Error> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    fn client(&self) -> Arc<dyn TiledClient> {
        match &self.client {
            Some(client) => Arc::clone(client),
            None => Arc::new(HttpTiledClient::new(&self.root_uri, self.api_key.clone())),
        }
    }

    /// Discover candidate datasets under the project root. The result is a
    /// listing; assign it to `datasets` to make it the project's source
    /// list.
    ///
    /// For file projects `template` is a format filter (see
    /// [`crate::dataset::expand_formats`]); for tiled projects it is a
    /// sub-path query tested below each child node.
    pub async fn browse(
        &self,
        template: &str,
        selected_sub_uris: &[String],
    ) -> Result<Vec<DatasetType>, Error> {
        match self.data_type {
            DataKind::File => {
                let extensions = crate::dataset::expand_formats(template);
                Ok(FileDataset::browse(
                    Path::new(&self.root_uri),
                    &extensions,
                    selected_sub_uris,
                )?
                .into_iter()
                .map(DatasetType::File)
                .collect())
            }
            DataKind::Tiled => self.browse_tiled(template, selected_sub_uris).await,
        }
    }

    async fn browse_tiled(
        &self,
        sub_uri_template: &str,
        selected_sub_uris: &[String],
    ) -> Result<Vec<DatasetType>, Error> {
        let client = self.client();

        if !selected_sub_uris.is_empty() {
            // Expand container nodes into their immediate children.
            let mut nodes = Vec::new();
            for sub_uri in selected_sub_uris {
                if client.is_array(sub_uri).await? {
                    nodes.push(sub_uri.clone());
                } else {
                    for child in client.children(sub_uri).await? {
                        nodes.push(format!("{}/{}", sub_uri.trim_end_matches('/'), child));
                    }
                }
            }

            // Query sizes concurrently; the counts must line up with node
            // order, so completion is collected in order.
            let counts: Vec<usize> = futures::stream::iter(nodes.iter().map(|node| {
                let client = Arc::clone(&client);
                async move {
                    client
                        .shape(node)
                        .await
                        .map(|shape| TiledDataset::count_for_shape(&shape))
                }
            }))
            .buffered(num_cpus::get())
            .try_collect()
            .await?;

            let mut cumulative = 0;
            return Ok(nodes
                .into_iter()
                .zip(counts)
                .map(|(uri, count)| {
                    cumulative += count;
                    DatasetType::Tiled(TiledDataset {
                        uri,
                        cumulative_data_count: cumulative,
                    })
                })
                .collect());
        }

        // Listing browse: enumerate immediate children of the root and keep
        // those whose template sub-path resolves. Each check returns its own
        // result and the matches are merged after the concurrency barrier;
        // their order is not stable across runs.
        let template = sub_uri_template.trim_matches('/');
        let children = client.children("").await?;

        let matches: Vec<Option<String>> = futures::stream::iter(children.into_iter().map(|node| {
            let client = Arc::clone(&client);
            let path = if template.is_empty() {
                node
            } else {
                format!("{}/{}", node, template)
            };
            async move {
                match client.contains(&path).await {
                    Ok(true) => Some(path),
                    Ok(false) => None,
                    Err(e) => {
                        debug!("skipping node {}: {}", path, e);
                        None
                    }
                }
            }
        }))
        .buffer_unordered(num_cpus::get())
        .collect()
        .await;

        Ok(matches
            .into_iter()
            .flatten()
            .map(|uri| {
                DatasetType::Tiled(TiledDataset {
                    uri,
                    cumulative_data_count: 0,
                })
            })
            .collect())
    }

    /// Resolve one global index to its owning `(dataset, local index)` pair.
    ///
    /// Bisect-right boundary: a global index equal to a cumulative count
    /// belongs to the *next* dataset.
    pub fn resolve(&self, global: usize) -> Result<(usize, usize), Error> {
        let total = self.total();
        if global >= total {
            return Err(Error::IndexOutOfRange {
                index: global,
                total,
            });
        }

        let cums: Vec<usize> = self
            .datasets
            .iter()
            .map(|d| d.cumulative_data_count())
            .collect();
        let dataset = cums.partition_point(|&c| c <= global);
        let prior = if dataset == 0 { 0 } else { cums[dataset - 1] };
        Ok((dataset, global - prior))
    }

    /// Partition global indices by owning dataset, keeping the slot of each
    /// index in the caller's original order so results can be scattered
    /// back.
    fn partition(&self, indices: &[usize]) -> Result<Vec<Partition>, Error> {
        let mut partitions: Vec<Partition> = Vec::new();

        for slot in (0..indices.len()).sorted_by_key(|&p| indices[p]) {
            let (dataset, local) = self.resolve(indices[slot])?;
            match partitions.last_mut() {
                Some(part) if part.dataset == dataset => {
                    part.locals.push(local);
                    part.slots.push(slot);
                }
                _ => partitions.push(Partition {
                    dataset,
                    locals: vec![local],
                    slots: vec![slot],
                }),
            }
        }

        Ok(partitions)
    }

    /// Read elements at arbitrary global indices, in parallel across
    /// datasets, returning payloads and URIs aligned index-for-index with
    /// the input.
    ///
    /// A failing dataset never aborts its siblings: its slots stay `None`
    /// and the failure is logged with enough context to identify it.
    pub async fn read(
        &self,
        indices: &[usize],
        opts: &ReadOptions,
    ) -> Result<(Vec<Option<Payload>>, Vec<Option<String>>), Error> {
        if indices.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let partitions = self.partition(indices)?;
        let client = match self.data_type {
            DataKind::Tiled => Some(self.client()),
            DataKind::File => None,
        };

        let results: Vec<(Partition, Result<_, Error>)> =
            futures::stream::iter(partitions.into_iter().map(|part| {
                let client = client.clone();
                async move {
                    let result = match &self.datasets[part.dataset] {
                        DatasetType::File(ds) => {
                            ds.read(&self.root_uri, &part.locals, opts).await
                        }
                        DatasetType::Tiled(ds) => match client {
                            Some(client) => ds
                                .read(client.as_ref(), &part.locals, opts)
                                .await
                                .map(|(payloads, uris)| {
                                    (
                                        payloads.into_iter().map(Some).collect(),
                                        uris.into_iter().map(Some).collect(),
                                    )
                                }),
                            None => Err(Error::Unsupported(
                                "tiled dataset in a file-backed project".into(),
                            )),
                        },
                    };
                    (part, result)
                }
            }))
            .buffer_unordered(num_cpus::get())
            .collect()
            .await;

        let mut payloads: Vec<Option<Payload>> = vec![None; indices.len()];
        let mut uris: Vec<Option<String>> = vec![None; indices.len()];

        for (part, result) in results {
            match result {
                Ok((part_payloads, part_uris)) => {
                    for ((&slot, payload), uri) in
                        part.slots.iter().zip(part_payloads).zip(part_uris)
                    {
                        payloads[slot] = payload;
                        uris[slot] = uri;
                    }
                }
                Err(e) => {
                    warn!(
                        "read failed for {} (local indices {:?}): {}",
                        self.datasets[part.dataset].uri(),
                        part.locals,
                        e
                    );
                }
            }
        }

        Ok((payloads, uris))
    }

    /// Resolve element URIs only, skipping content fetch and decode
    /// entirely. Used for cheap existence and addressing checks.
    pub async fn uris(&self, indices: &[usize]) -> Result<Vec<Option<String>>, Error> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let partitions = self.partition(indices)?;
        let client = match self.data_type {
            DataKind::Tiled => Some(self.client()),
            DataKind::File => None,
        };

        let mut uris: Vec<Option<String>> = vec![None; indices.len()];
        for part in partitions {
            let part_uris = match &self.datasets[part.dataset] {
                DatasetType::File(ds) => ds.uris(&self.root_uri, &part.locals),
                DatasetType::Tiled(ds) => match &client {
                    Some(client) => ds
                        .uris(client.as_ref(), &part.locals)
                        .await?
                        .into_iter()
                        .map(Some)
                        .collect(),
                    None => {
                        return Err(Error::Unsupported(
                            "tiled dataset in a file-backed project".into(),
                        ))
                    }
                },
            };
            for (&slot, uri) in part.slots.iter().zip(part_uris) {
                uris[slot] = uri;
            }
        }

        Ok(uris)
    }

    /// Global index of an element URI, when it belongs to this project.
    pub fn get_uri_index(&self, uri: &str) -> Option<usize> {
        let mut prior = 0;
        for dataset in &self.datasets {
            if let Some(local) = dataset.get_uri_index(uri) {
                return Some(prior + local);
            }
            prior = dataset.cumulative_data_count();
        }
        None
    }

    /// Materialize remote elements into `{root_dir}/tiled_local_copy/`,
    /// one dtype-preserving tiff per element, named by the sha256 of its
    /// canonical remote URI. Already-present files are skipped, so repeated
    /// calls fetch nothing new; the returned paths cover every requested
    /// index, cache hits and misses alike, in input order.
    pub async fn materialize(
        &self,
        root_dir: &Path,
        indices: &[usize],
    ) -> Result<Vec<PathBuf>, Error> {
        if self.data_type != DataKind::Tiled {
            return Err(Error::Unsupported(
                "materialization requires a tiled-backed project".into(),
            ));
        }
        if indices.is_empty() {
            return Ok(Vec::new());
        }

        let uris: Vec<String> = self
            .uris(indices)
            .await?
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Unsupported("unresolvable element uri".into()))?;

        // Directory creation happens once, before any write task starts.
        let dir = root_dir.join(LOCAL_COPY_DIR);
        std::fs::create_dir_all(&dir)?;

        let paths: Vec<PathBuf> = uris
            .iter()
            .map(|uri| dir.join(format!("{}.tif", sha256_hex(uri))))
            .collect();

        let missing: Vec<usize> = (0..indices.len()).filter(|&p| !paths[p].exists()).collect();
        if missing.is_empty() {
            debug!("all {} elements already materialized", indices.len());
            return Ok(paths);
        }

        info!(
            "materializing {} of {} elements into {:?}",
            missing.len(),
            indices.len(),
            dir
        );

        let fetch: Vec<usize> = missing.iter().map(|&p| indices[p]).collect();
        let opts = ReadOptions {
            export: Export::Raw,
            resize: false,
            log: false,
            percentiles: (0.0, 100.0),
            downsample: false,
        };
        let (payloads, _) = self.read(&fetch, &opts).await?;

        let writes = missing.iter().zip(payloads).map(|(&p, payload)| {
            let path = paths[p].clone();
            let uri = uris[p].clone();
            async move {
                let block = match payload {
                    Some(Payload::Raw(block)) => block,
                    _ => {
                        return Err(Error::Fetch {
                            uri,
                            reason: "no data returned".into(),
                        })
                    }
                };
                tokio::task::spawn_blocking(move || write_block_tiff(&path, &block))
                    .await
                    .map_err(|e| Error::Unsupported(e.to_string()))?
            }
        });
        futures::future::try_join_all(writes).await?;

        Ok(paths)
    }
}

/// Stable content address: hex-encoded sha256 of the canonical remote URI.
pub fn sha256_hex(uri: &str) -> String {
    hex::encode(Sha256::digest(uri.as_bytes()))
}

/// Write one element to disk without dtype coercion; materialized data is
/// meant for downstream numeric reuse, not just display.
fn write_block_tiff(path: &Path, block: &Block) -> Result<(), Error> {
    use tiff::encoder::{colortype, TiffEncoder};

    let block = block.clone().squeeze();
    let shape = block.shape().to_vec();
    if shape.len() != 2 {
        return Err(Error::Unsupported(format!(
            "cannot write {:?} {} block as a 2-D tiff",
            shape,
            block.dtype()
        )));
    }
    let (h, w) = (shape[0] as u32, shape[1] as u32);

    let io_err = |e: std::io::Error| Error::MaterializeWrite {
        path: path.to_path_buf(),
        source: e,
    };
    let tiff_err = |e: tiff::TiffError| Error::MaterializeWrite {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
    };

    let file = std::fs::File::create(path).map_err(io_err)?;
    let mut encoder = TiffEncoder::new(std::io::BufWriter::new(file)).map_err(tiff_err)?;

    match &block {
        Block::U8(a) => encoder
            .write_image::<colortype::Gray8>(w, h, &a.iter().cloned().collect::<Vec<_>>())
            .map_err(tiff_err),
        Block::U16(a) => encoder
            .write_image::<colortype::Gray16>(w, h, &a.iter().cloned().collect::<Vec<_>>())
            .map_err(tiff_err),
        Block::F32(a) => encoder
            .write_image::<colortype::Gray32Float>(w, h, &a.iter().cloned().collect::<Vec<_>>())
            .map_err(tiff_err),
        Block::F64(a) => encoder
            .write_image::<colortype::Gray64Float>(w, h, &a.iter().cloned().collect::<Vec<_>>())
            .map_err(tiff_err),
    }
}
