//! Black-box transport to the tiled array-store service.
//!
//! The service is only relied upon for three things: enumerating child
//! nodes, reporting an array's shape, and returning array slices. The
//! [`TiledClient`] trait captures that boundary; [`HttpTiledClient`] is the
//! production implementation and tests substitute their own.

use async_trait::async_trait;
use ndarray::{Array2, ArrayD, Axis, Slice};
use serde::Deserialize;

use crate::errors::Error;
use crate::process::Plane;

/// Stride applied to the trailing two spatial axes when downsampling for
/// thumbnail/browse contexts.
pub const DOWNSAMPLE_STRIDE: usize = 10;

/// A dtype-tagged numeric block. Materialization depends on the original
/// dtype surviving the round trip, so no coercion happens here.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! per_dtype {
    ($block:expr, $a:ident => $body:expr) => {
        match $block {
            Block::U8($a) => Block::U8($body),
            Block::U16($a) => Block::U16($body),
            Block::F32($a) => Block::F32($body),
            Block::F64($a) => Block::F64($body),
        }
    };
}

impl Block {
    pub fn shape(&self) -> &[usize] {
        match self {
            Block::U8(a) => a.shape(),
            Block::U16(a) => a.shape(),
            Block::F32(a) => a.shape(),
            Block::F64(a) => a.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Block::U8(_) => "uint8",
            Block::U16(_) => "uint16",
            Block::F32(_) => "float32",
            Block::F64(_) => "float64",
        }
    }

    /// Wrap a rank <= 2 block as a singleton batch.
    pub fn singleton(self) -> Block {
        per_dtype!(self, a => a.insert_axis(Axis(0)))
    }

    /// Select elements along the leading axis.
    pub fn select_outer(&self, indices: &[usize]) -> Block {
        per_dtype!(self, a => a.select(Axis(0), indices))
    }

    /// Stride the trailing two spatial axes.
    pub fn stride_spatial(&self, step: usize) -> Block {
        let nd = self.ndim();
        if nd < 2 || step <= 1 {
            return self.clone();
        }
        per_dtype!(self, a => a
            .slice_each_axis(|ax| {
                if ax.axis.index() >= nd - 2 {
                    Slice::new(0, None, step as isize)
                } else {
                    Slice::new(0, None, 1)
                }
            })
            .to_owned())
    }

    /// Drop a singleton channel axis on rank-4 blocks (batch, 1, h, w).
    pub fn squeeze_channel(self) -> Block {
        if self.ndim() == 4 && self.shape()[1] == 1 {
            per_dtype!(self, a => a.remove_axis(Axis(1)))
        } else {
            self
        }
    }

    /// Drop singleton axes until the block is at most 2-D.
    pub fn squeeze(mut self) -> Block {
        loop {
            let shape = self.shape().to_vec();
            if shape.len() <= 2 {
                return self;
            }
            match shape.iter().position(|&d| d == 1) {
                Some(ax) => self = per_dtype!(self, a => a.remove_axis(Axis(ax))),
                None => return self,
            }
        }
    }

    /// Split a batch into per-element blocks along the leading axis.
    pub fn split_outer(&self) -> Vec<Block> {
        (0..self.shape()[0])
            .map(|i| per_dtype!(self, a => a.index_axis(Axis(0), i).to_owned()))
            .collect()
    }

    /// View the batch as 2-D processing planes. Fails when elements are not
    /// two-dimensional (e.g. a non-singleton channel axis).
    pub fn planes(&self) -> Result<Vec<Plane>, Error> {
        if self.ndim() != 3 {
            return Err(Error::Unsupported(format!(
                "cannot interpret {:?} {} block as image planes",
                self.shape(),
                self.dtype()
            )));
        }

        let mut planes = Vec::with_capacity(self.shape()[0]);
        for i in 0..self.shape()[0] {
            let plane = match self {
                Block::U8(a) => Plane::U8(plane_2d(a.index_axis(Axis(0), i).to_owned())?),
                Block::U16(a) => Plane::F32(plane_2d(a.index_axis(Axis(0), i).mapv(|v| v as f32))?),
                Block::F32(a) => Plane::F32(plane_2d(a.index_axis(Axis(0), i).to_owned())?),
                Block::F64(a) => Plane::F32(plane_2d(a.index_axis(Axis(0), i).mapv(|v| v as f32))?),
            };
            planes.push(plane);
        }
        Ok(planes)
    }
}

fn plane_2d<T>(a: ArrayD<T>) -> Result<Array2<T>, Error> {
    a.into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| Error::Unsupported(format!("expected a 2-D plane: {}", e)))
}

/// Client boundary to the array store.
#[async_trait]
pub trait TiledClient: Send + Sync {
    /// Base URI of the service; element URIs are derived from it.
    fn base_uri(&self) -> &str;

    /// Names of the immediate child nodes under `path`.
    async fn children(&self, path: &str) -> Result<Vec<String>, Error>;

    /// Shape of the array node at `path`.
    async fn shape(&self, path: &str) -> Result<Vec<usize>, Error>;

    /// Whether `path` addresses an array node (as opposed to a container).
    async fn is_array(&self, path: &str) -> Result<bool, Error>;

    /// Whether any node exists at `path`.
    async fn contains(&self, path: &str) -> Result<bool, Error>;

    /// Fetch elements of the node at `path`, selected by `indices` along the
    /// leading axis (the whole array when `None`), optionally striding the
    /// trailing two spatial axes.
    async fn read_block(
        &self,
        path: &str,
        indices: Option<&[usize]>,
        stride: Option<usize>,
    ) -> Result<Block, Error>;
}

/// Canonical metadata URI of a node.
pub fn node_uri(base_uri: &str, path: &str) -> String {
    format!(
        "{}/api/v1/metadata/{}",
        base_uri.trim_end_matches('/'),
        path.trim_matches('/')
    )
}

#[derive(Debug, Deserialize)]
struct MetadataDocument {
    data: MetadataData,
}

#[derive(Debug, Deserialize)]
struct MetadataData {
    attributes: MetadataAttributes,
}

#[derive(Debug, Deserialize)]
struct MetadataAttributes {
    structure_family: String,
    #[serde(default)]
    structure: Option<ArrayStructure>,
}

#[derive(Debug, Deserialize)]
struct ArrayStructure {
    shape: Vec<usize>,
    data_type: String,
}

#[derive(Debug, Deserialize)]
struct SearchDocument {
    data: Vec<SearchEntry>,
}

#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: String,
}

/// HTTP implementation of [`TiledClient`].
pub struct HttpTiledClient {
    uri: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTiledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HttpTiledClient <{}>", self.uri)
    }
}

impl HttpTiledClient {
    pub fn new(uri: &str, api_key: Option<String>) -> HttpTiledClient {
        HttpTiledClient {
            uri: uri.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Apikey {}", key)),
            None => req,
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, Error> {
        let resp = self
            .request(url)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::BackendUnavailable(format!(
                "credentials rejected by {}",
                self.uri
            )));
        }
        if !resp.status().is_success() {
            return Err(Error::Fetch {
                uri: url.to_string(),
                reason: format!("status {}", resp.status()),
            });
        }
        Ok(resp)
    }

    async fn metadata(&self, path: &str) -> Result<MetadataAttributes, Error> {
        let url = node_uri(&self.uri, path);
        let doc: MetadataDocument = self.get(&url).await?.json().await.map_err(|e| Error::Fetch {
            uri: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(doc.data.attributes)
    }

    /// Fetch one slab as raw little-endian bytes and decode per dtype.
    async fn fetch_slab(
        &self,
        path: &str,
        slice_expr: &str,
        shape: Vec<usize>,
        dtype: &str,
    ) -> Result<Block, Error> {
        let mut url = format!(
            "{}/api/v1/array/full/{}?format=application/octet-stream",
            self.uri,
            path.trim_matches('/')
        );
        if !slice_expr.is_empty() {
            url.push_str(&format!("&slice={}", slice_expr));
        }

        let bytes = self.get(&url).await?.bytes().await.map_err(|e| Error::Fetch {
            uri: url.clone(),
            reason: e.to_string(),
        })?;

        decode_block(&bytes, shape, dtype).ok_or_else(|| Error::Fetch {
            uri: url,
            reason: format!("payload does not match shape/dtype ({})", dtype),
        })
    }
}

/// Decode a little-endian scalar buffer into a dtype-tagged block.
fn decode_block(bytes: &[u8], shape: Vec<usize>, dtype: &str) -> Option<Block> {
    let n: usize = shape.iter().product();

    fn scalars<T, F: Fn(&[u8]) -> T>(bytes: &[u8], width: usize, n: usize, f: F) -> Option<Vec<T>> {
        if bytes.len() != n * width {
            return None;
        }
        Some(bytes.chunks_exact(width).map(f).collect())
    }

    match dtype {
        "uint8" => {
            let v = scalars(bytes, 1, n, |c| c[0])?;
            ArrayD::from_shape_vec(shape, v).ok().map(Block::U8)
        }
        "uint16" => {
            let v = scalars(bytes, 2, n, |c| u16::from_le_bytes([c[0], c[1]]))?;
            ArrayD::from_shape_vec(shape, v).ok().map(Block::U16)
        }
        "float32" => {
            let v = scalars(bytes, 4, n, |c| {
                f32::from_le_bytes([c[0], c[1], c[2], c[3]])
            })?;
            ArrayD::from_shape_vec(shape, v).ok().map(Block::F32)
        }
        "float64" => {
            let v = scalars(bytes, 8, n, |c| {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            })?;
            ArrayD::from_shape_vec(shape, v).ok().map(Block::F64)
        }
        _ => None,
    }
}

/// Shape of a slab after striding the trailing two axes.
fn strided_shape(shape: &[usize], stride: usize) -> Vec<usize> {
    let nd = shape.len();
    shape
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            if nd >= 2 && i >= nd - 2 && stride > 1 {
                (d + stride - 1) / stride
            } else {
                d
            }
        })
        .collect()
}

#[async_trait]
impl TiledClient for HttpTiledClient {
    fn base_uri(&self) -> &str {
        &self.uri
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, Error> {
        let url = format!(
            "{}/api/v1/search/{}",
            self.uri,
            path.trim_matches('/')
        );
        let doc: SearchDocument = self.get(&url).await?.json().await.map_err(|e| Error::Fetch {
            uri: url.clone(),
            reason: e.to_string(),
        })?;
        Ok(doc.data.into_iter().map(|e| e.id).collect())
    }

    async fn shape(&self, path: &str) -> Result<Vec<usize>, Error> {
        let attrs = self.metadata(path).await?;
        attrs
            .structure
            .map(|s| s.shape)
            .ok_or_else(|| Error::Fetch {
                uri: node_uri(&self.uri, path),
                reason: "node has no array structure".into(),
            })
    }

    async fn is_array(&self, path: &str) -> Result<bool, Error> {
        Ok(self.metadata(path).await?.structure_family == "array")
    }

    async fn contains(&self, path: &str) -> Result<bool, Error> {
        let url = node_uri(&self.uri, path);
        let resp = self
            .request(&url)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    async fn read_block(
        &self,
        path: &str,
        indices: Option<&[usize]>,
        stride: Option<usize>,
    ) -> Result<Block, Error> {
        let structure = self
            .metadata(path)
            .await?
            .structure
            .ok_or_else(|| Error::Fetch {
                uri: node_uri(&self.uri, path),
                reason: "node has no array structure".into(),
            })?;

        let stride = stride.unwrap_or(1);
        let rank = structure.shape.len();

        match indices {
            // One request per element, stacked along a fresh leading axis.
            Some(indices) => {
                // Stride only touches the trailing two spatial axes; any
                // axis in between (e.g. channel) passes through unsliced.
                let mut expr_tail = String::new();
                for ax in 1..rank {
                    if ax >= rank.saturating_sub(2) && stride > 1 {
                        expr_tail.push_str(&format!(",::{}", stride));
                    } else {
                        expr_tail.push_str(",:");
                    }
                }
                let tail = strided_shape(&structure.shape[1..], stride);

                let mut elements = Vec::with_capacity(indices.len());
                for &i in indices {
                    let expr = format!("{}{}", i, expr_tail);
                    elements.push(
                        self.fetch_slab(path, &expr, tail.clone(), &structure.data_type)
                            .await?
                            .singleton(),
                    );
                }
                concat_outer(elements).ok_or_else(|| Error::Fetch {
                    uri: node_uri(&self.uri, path),
                    reason: "inconsistent element shapes across slices".into(),
                })
            }
            None => {
                let expr = if rank >= 2 && stride > 1 {
                    format!("::{0},::{0}", stride)
                } else {
                    String::new()
                };
                let shape = strided_shape(&structure.shape, stride);
                self.fetch_slab(path, &expr, shape, &structure.data_type).await
            }
        }
    }
}

/// Concatenate singleton batches along the leading axis.
fn concat_outer(blocks: Vec<Block>) -> Option<Block> {
    fn cat<T: Clone>(arrays: Vec<ArrayD<T>>) -> Option<ArrayD<T>> {
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        ndarray::concatenate(Axis(0), &views).ok()
    }

    let mut it = blocks.into_iter();
    match it.next()? {
        Block::U8(first) => {
            let mut v = vec![first];
            for b in it {
                match b {
                    Block::U8(a) => v.push(a),
                    _ => return None,
                }
            }
            cat(v).map(Block::U8)
        }
        Block::U16(first) => {
            let mut v = vec![first];
            for b in it {
                match b {
                    Block::U16(a) => v.push(a),
                    _ => return None,
                }
            }
            cat(v).map(Block::U16)
        }
        Block::F32(first) => {
            let mut v = vec![first];
            for b in it {
                match b {
                    Block::F32(a) => v.push(a),
                    _ => return None,
                }
            }
            cat(v).map(Block::F32)
        }
        Block::F64(first) => {
            let mut v = vec![first];
            for b in it {
                match b {
                    Block::F64(a) => v.push(a),
                    _ => return None,
                }
            }
            cat(v).map(Block::F64)
        }
    }
}
