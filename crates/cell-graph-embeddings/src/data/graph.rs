//! Attributed relational graphs with per-relation edge lists.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Identifier for one biological context (e.g. a cell type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// Identifier for a relation type (labeled edge category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationId(pub u32);

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rel{}", self.0)
    }
}

/// A list of directed edges in local node indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeList {
    pub src: Vec<u32>,
    pub dst: Vec<u32>,
}

impl EdgeList {
    /// Build from (src, dst) pairs.
    pub fn from_pairs(pairs: &[(u32, u32)]) -> Self {
        Self {
            src: pairs.iter().map(|&(s, _)| s).collect(),
            dst: pairs.iter().map(|&(_, d)| d).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    /// Iterate (src, dst) pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.src.iter().copied().zip(self.dst.iter().copied())
    }
}

/// One attributed graph: a node feature matrix plus one edge list per
/// relation type. Used both for per-context graphs and for the meta graph
/// (which has exactly one instance, never a collection).
///
/// Node indices are local to this graph; the feature matrix has one row per
/// node. Both invariants are enforced at construction.
#[derive(Debug, Clone)]
pub struct ContextGraph {
    features: Tensor,
    num_nodes: usize,
    feature_dim: usize,
    edges: BTreeMap<RelationId, EdgeList>,
}

impl ContextGraph {
    /// Build a graph from a row-major feature matrix and per-relation edges.
    /// The feature tensor lives on the host until a batch places it.
    pub fn new(
        features: Vec<f32>,
        num_nodes: usize,
        feature_dim: usize,
        edges: BTreeMap<RelationId, EdgeList>,
    ) -> TrainResult<Self> {
        if features.len() != num_nodes * feature_dim {
            return Err(TrainError::InvalidGraph {
                message: format!(
                    "feature matrix has {} values, expected {} nodes x {} dims",
                    features.len(),
                    num_nodes,
                    feature_dim
                ),
            });
        }
        for (rel, list) in &edges {
            if list.src.len() != list.dst.len() {
                return Err(TrainError::InvalidGraph {
                    message: format!("{}: src/dst length mismatch", rel),
                });
            }
            if let Some(&bad) = list
                .src
                .iter()
                .chain(list.dst.iter())
                .find(|&&n| n as usize >= num_nodes)
            {
                return Err(TrainError::InvalidGraph {
                    message: format!("{}: node index {} out of range (n={})", rel, bad, num_nodes),
                });
            }
        }
        let features = Tensor::from_vec(features, (num_nodes, feature_dim), &Device::Cpu)
            .map_err(|e| TrainError::tensor("feature matrix", e))?;
        Ok(Self {
            features,
            num_nodes,
            feature_dim,
            edges,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Host-resident node feature matrix (N x F).
    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn edges(&self) -> &BTreeMap<RelationId, EdgeList> {
        &self.edges
    }

    /// Edge list for one relation; empty list if the relation is absent.
    pub fn edge_list(&self, rel: RelationId) -> EdgeList {
        self.edges.get(&rel).cloned().unwrap_or_default()
    }
}

/// Build a 2 x E index tensor (u32) from src/dst vectors on the host.
/// Empty inputs yield a 2 x 0 tensor, never an error.
pub(crate) fn edge_index_tensor(src: &[u32], dst: &[u32]) -> TrainResult<Tensor> {
    debug_assert_eq!(src.len(), dst.len());
    let e = src.len();
    let mut data = Vec::with_capacity(2 * e);
    data.extend_from_slice(src);
    data.extend_from_slice(dst);
    if e == 0 {
        return Tensor::zeros((2, 0), DType::U32, &Device::Cpu)
            .map_err(|e| TrainError::tensor("empty edge index", e));
    }
    Tensor::from_vec(data, (2, e), &Device::Cpu)
        .map_err(|e| TrainError::tensor("edge index", e))
}
