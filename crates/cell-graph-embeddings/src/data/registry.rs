//! Read-only registry of parsed input data.
//!
//! The registry is handed to the training session fully populated: raw file
//! parsing and graph ingestion happen upstream. Nothing in the core mutates
//! it.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::data::graph::{ContextGraph, ContextId, RelationId};
use crate::error::{TrainError, TrainResult};

/// Per-context boolean node masks for the center-loss objective.
#[derive(Debug, Clone)]
pub struct NodeMasks {
    pub train: Vec<bool>,
    pub val: Vec<bool>,
    pub test: Vec<bool>,
}

/// All input data for one run: the per-context graph collection, the single
/// meta graph over contexts, relation-name tables for both, and per-node
/// cluster labels used by the center loss.
#[derive(Debug, Clone)]
pub struct DatasetRegistry {
    contexts: BTreeMap<ContextId, ContextGraph>,
    context_names: BTreeMap<ContextId, String>,
    meta: ContextGraph,
    /// Which meta-graph node represents each context. The meta graph may
    /// carry additional nodes (e.g. tissues) with no context of their own.
    meta_index: BTreeMap<ContextId, u32>,
    relations: BTreeMap<RelationId, String>,
    meta_relations: BTreeMap<RelationId, String>,
    cluster_labels: BTreeMap<ContextId, Vec<u32>>,
}

impl DatasetRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        contexts: BTreeMap<ContextId, ContextGraph>,
        context_names: BTreeMap<ContextId, String>,
        meta: ContextGraph,
        meta_index: BTreeMap<ContextId, u32>,
        relations: BTreeMap<RelationId, String>,
        meta_relations: BTreeMap<RelationId, String>,
        cluster_labels: BTreeMap<ContextId, Vec<u32>>,
    ) -> TrainResult<Self> {
        if contexts.is_empty() {
            return Err(TrainError::InvalidGraph {
                message: "registry needs at least one context graph".into(),
            });
        }
        let feature_dim = contexts.values().next().map(|g| g.feature_dim()).unwrap_or(0);
        for (ctx, graph) in &contexts {
            if graph.feature_dim() != feature_dim {
                return Err(TrainError::InvalidGraph {
                    message: format!(
                        "{}: feature dim {} differs from shared dim {}",
                        ctx,
                        graph.feature_dim(),
                        feature_dim
                    ),
                });
            }
            let idx = meta_index.get(ctx).ok_or_else(|| TrainError::InvalidGraph {
                message: format!("{}: missing meta-graph node mapping", ctx),
            })?;
            if *idx as usize >= meta.num_nodes() {
                return Err(TrainError::InvalidGraph {
                    message: format!("{}: meta node index {} out of range", ctx, idx),
                });
            }
            if let Some(labels) = cluster_labels.get(ctx) {
                if labels.len() != graph.num_nodes() {
                    return Err(TrainError::InvalidGraph {
                        message: format!(
                            "{}: {} cluster labels for {} nodes",
                            ctx,
                            labels.len(),
                            graph.num_nodes()
                        ),
                    });
                }
            }
        }
        Ok(Self {
            contexts,
            context_names,
            meta,
            meta_index,
            relations,
            meta_relations,
            cluster_labels,
        })
    }

    pub fn contexts(&self) -> &BTreeMap<ContextId, ContextGraph> {
        &self.contexts
    }

    pub fn context_name(&self, ctx: ContextId) -> &str {
        self.context_names
            .get(&ctx)
            .map(String::as_str)
            .unwrap_or("unknown")
    }

    pub fn meta(&self) -> &ContextGraph {
        &self.meta
    }

    pub fn meta_index(&self) -> &BTreeMap<ContextId, u32> {
        &self.meta_index
    }

    /// Relation-name table for the context graphs.
    pub fn relations(&self) -> &BTreeMap<RelationId, String> {
        &self.relations
    }

    /// Relation-name table for the meta graph.
    pub fn meta_relations(&self) -> &BTreeMap<RelationId, String> {
        &self.meta_relations
    }

    pub fn cluster_labels(&self, ctx: ContextId) -> Option<&[u32]> {
        self.cluster_labels.get(&ctx).map(Vec::as_slice)
    }

    /// Number of distinct cluster classes across all contexts.
    pub fn num_classes(&self) -> usize {
        self.cluster_labels
            .values()
            .flat_map(|l| l.iter())
            .map(|&c| c as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Seeded per-context train/val/test node masks. Deterministic for a
    /// given seed so repeated calls partition identically.
    pub fn node_masks(&self, seed: u64, train_frac: f32, val_frac: f32) -> BTreeMap<ContextId, NodeMasks> {
        let mut out = BTreeMap::new();
        for (&ctx, graph) in &self.contexts {
            let n = graph.num_nodes();
            let mut order: Vec<usize> = (0..n).collect();
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed ^ ((ctx.0 as u64) << 32));
            order.shuffle(&mut rng);
            let n_train = (n as f32 * train_frac).round() as usize;
            let n_val = (n as f32 * val_frac).round() as usize;
            let mut masks = NodeMasks {
                train: vec![false; n],
                val: vec![false; n],
                test: vec![false; n],
            };
            for (rank, &node) in order.iter().enumerate() {
                if rank < n_train {
                    masks.train[node] = true;
                } else if rank < n_train + n_val {
                    masks.val[node] = true;
                } else {
                    masks.test[node] = true;
                }
            }
            out.insert(ctx, masks);
        }
        out
    }
}
