//! Tiled-backed datasets: one remote array node, elements addressed by
//! slice fragments computed on demand.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dataset::{Payload, ReadOptions};
use crate::errors::Error;
use crate::process::{process_plane, Export};
use crate::tiled::{node_uri, TiledClient, DOWNSAMPLE_STRIDE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiledDataset {
    /// Node path below the service root.
    pub uri: String,
    /// Element count of this dataset plus all prior datasets in the
    /// project's ordered list.
    #[serde(default)]
    pub cumulative_data_count: usize,
}

impl TiledDataset {
    /// Element count contributed by an array of the given shape: scalar and
    /// 2-D arrays hold exactly one element, higher ranks contribute their
    /// leading dimension.
    pub fn count_for_shape(shape: &[usize]) -> usize {
        if shape.len() <= 2 {
            1
        } else {
            shape[0]
        }
    }

    /// Resolved element URIs for the given local indices. Multi-element
    /// nodes get a `?slice={i}` fragment so every element has a globally
    /// unique, independently re-fetchable address.
    pub async fn uris(
        &self,
        client: &dyn TiledClient,
        indices: &[usize],
    ) -> Result<Vec<String>, Error> {
        let shape = client.shape(&self.uri).await?;
        let base = node_uri(client.base_uri(), &self.uri);

        if shape.len() > 2 && shape[0] > 1 {
            let base = base.replace("/metadata/", "/array/full/");
            Ok(indices.iter().map(|i| format!("{}?slice={}", base, i)).collect())
        } else {
            Ok(indices.iter().map(|_| base.clone()).collect())
        }
    }

    /// Fetch and post-process the elements at the given local indices.
    ///
    /// Rank-4 nodes are indexed on (batch, channel), rank-3 on the leading
    /// axis, rank <= 2 is a single implicit element wrapped as a singleton
    /// batch. `Export::Raw` returns untouched per-element blocks.
    pub async fn read(
        &self,
        client: &dyn TiledClient,
        indices: &[usize],
        opts: &ReadOptions,
    ) -> Result<(Vec<Payload>, Vec<String>), Error> {
        let uris = self.uris(client, indices).await?;

        let shape = client.shape(&self.uri).await?;
        let selection = if shape.len() >= 3 { Some(indices) } else { None };
        let stride = if opts.downsample {
            Some(DOWNSAMPLE_STRIDE)
        } else {
            None
        };

        debug!(
            "reading {} [{:?} of {:?}, stride {:?}]",
            self.uri, indices, shape, stride
        );

        let block = client.read_block(&self.uri, selection, stride).await?;
        let block = if block.ndim() <= 2 {
            block.singleton()
        } else {
            block
        };

        let mut payloads: Vec<Payload> = if opts.export == Export::Raw {
            block.split_outer().into_iter().map(Payload::Raw).collect()
        } else {
            let planes = block.squeeze_channel().planes()?;
            let popts = opts.process();
            planes
                .par_iter()
                .map(|plane| process_plane(plane, &popts))
                .collect::<Result<Vec<_>, _>>()?
        };

        // A singleton node serves the same element for every requested index.
        if payloads.len() == 1 && indices.len() > 1 {
            payloads = indices.iter().map(|_| payloads[0].clone()).collect();
        }

        Ok((payloads, uris))
    }

    /// Local index of an element URI; a URI without a slice fragment
    /// addresses the node's only element.
    ///
    /// Ownership is decided on the full path component, so a node name that
    /// happens to be a substring of another node (or of the API path
    /// itself) never captures foreign URIs.
    pub fn get_uri_index(&self, uri: &str) -> Option<usize> {
        let (path, query) = match uri.find('?') {
            Some(at) => (&uri[..at], Some(&uri[at + 1..])),
            None => (uri, None),
        };

        let node = self.uri.trim_matches('/');
        if !path.ends_with(&format!("/array/full/{}", node))
            && !path.ends_with(&format!("/metadata/{}", node))
        {
            return None;
        }

        match query.and_then(|q| q.split("slice=").nth(1)) {
            Some(tail) => tail.parse().ok(),
            None => Some(0),
        }
    }
}
