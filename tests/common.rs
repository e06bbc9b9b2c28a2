use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{ArrayD, IxDyn};

use lightbox::dataset::{DatasetType, TiledDataset};
use lightbox::errors::Error;
use lightbox::project::{DataKind, DataProject};
use lightbox::tiled::{Block, TiledClient};

pub const MOCK_URI: &str = "http://tiled.test";

pub fn test_log() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("lightbox=debug"),
    )
    .is_test(true)
    .try_init();
}

/// In-memory array store. Nodes are addressed by exact path; container
/// nodes exist implicitly as path prefixes.
pub struct MockTiledClient {
    nodes: HashMap<String, Block>,
    fail: HashSet<String>,
    pub fetches: AtomicUsize,
}

impl MockTiledClient {
    pub fn new() -> MockTiledClient {
        MockTiledClient {
            nodes: HashMap::new(),
            fail: HashSet::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_node(mut self, path: &str, block: Block) -> MockTiledClient {
        self.nodes.insert(path.to_string(), block);
        self
    }

    /// Make every access to `path` fail as if the backend dropped it.
    pub fn failing(mut self, path: &str) -> MockTiledClient {
        self.fail.insert(path.to_string());
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check(&self, path: &str) -> Result<(), Error> {
        if self.fail.contains(path) {
            return Err(Error::BackendUnavailable(format!("{} is gone", path)));
        }
        Ok(())
    }
}

#[async_trait]
impl TiledClient for MockTiledClient {
    fn base_uri(&self) -> &str {
        MOCK_URI
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, Error> {
        self.check(path)?;
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path.trim_matches('/'))
        };

        let mut names: Vec<String> = self
            .nodes
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap().to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn shape(&self, path: &str) -> Result<Vec<usize>, Error> {
        self.check(path)?;
        self.nodes
            .get(path)
            .map(|b| b.shape().to_vec())
            .ok_or_else(|| Error::Fetch {
                uri: path.to_string(),
                reason: "no such node".into(),
            })
    }

    async fn is_array(&self, path: &str) -> Result<bool, Error> {
        self.check(path)?;
        Ok(self.nodes.contains_key(path))
    }

    async fn contains(&self, path: &str) -> Result<bool, Error> {
        let prefix = format!("{}/", path.trim_matches('/'));
        Ok(self.nodes.contains_key(path) || self.nodes.keys().any(|k| k.starts_with(&prefix)))
    }

    async fn read_block(
        &self,
        path: &str,
        indices: Option<&[usize]>,
        stride: Option<usize>,
    ) -> Result<Block, Error> {
        self.check(path)?;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let block = self.nodes.get(path).ok_or_else(|| Error::Fetch {
            uri: path.to_string(),
            reason: "no such node".into(),
        })?;

        let block = match indices {
            Some(indices) => block.select_outer(indices),
            None => block.clone(),
        };
        Ok(match stride {
            Some(step) => block.stride_spatial(step),
            None => block,
        })
    }
}

/// Rank-3 float block whose value encodes (element, row, col), offset by
/// `base` so elements stay distinguishable across nodes.
pub fn gradient_block(base: f32, n: usize, h: usize, w: usize) -> Block {
    Block::F32(ArrayD::from_shape_fn(IxDyn(&[n, h, w]), |d| {
        base + (d[0] * h * w + d[1] * w + d[2]) as f32
    }))
}

/// Tiled project over pre-counted nodes, backed by the given mock.
pub fn tiled_project(client: Arc<MockTiledClient>, nodes: &[(&str, usize)]) -> DataProject {
    let mut project = DataProject::new(DataKind::Tiled, MOCK_URI, None).with_client(client);
    let mut cumulative = 0;
    for &(uri, count) in nodes {
        cumulative += count;
        project.datasets.push(DatasetType::Tiled(TiledDataset {
            uri: uri.to_string(),
            cumulative_data_count: cumulative,
        }));
    }
    project
}

/// Directory of small gray PNGs, one shade per file.
pub fn image_dir(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (i, name) in names.iter().enumerate() {
        let shade = (i as u8).wrapping_mul(40);
        let img = image::GrayImage::from_pixel(16, 16, image::Luma([shade]));
        img.save(dir.path().join(name)).unwrap();
    }
    dir
}
