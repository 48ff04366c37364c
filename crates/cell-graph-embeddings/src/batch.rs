//! Phase batch construction for both graph collections.
//!
//! [`generate_batch`] serves the per-context collection and
//! [`generate_meta_batch`] the single meta graph; both run the same
//! per-graph builder, so the two collections see identical split, device
//! placement and key-set behavior. Device placement is a pure transform:
//! builders and `to_device`/`detach_to_host` return new handles and never
//! mutate the registry.
//!
//! Guarantee: a batch's `relation_edges` keys always equal the relation
//! table's keys, with empty-but-present entries for relations that have no
//! edges in the requested phase, so downstream code can iterate relation
//! types uniformly.

use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::LoaderKind;
use crate::data::graph::edge_index_tensor;
use crate::data::{ContextGraph, ContextId, RelationId};
use crate::error::{TrainError, TrainResult};
use crate::split::{EdgeSplitter, Phase, RelationSplit};

/// Splitter context id used for the meta graph, which is not a member of
/// the context collection.
pub const META_CONTEXT: ContextId = ContextId(u32::MAX);

/// Positive and negative edge tensors for one relation in one phase,
/// device-resident. Validated at construction: both tensors are 2 x E.
#[derive(Debug, Clone)]
pub struct RelationEdges {
    pub pos: Tensor,
    pub neg: Tensor,
}

impl RelationEdges {
    fn from_split(split: RelationSplit, device: &Device) -> TrainResult<Self> {
        Self {
            pos: split.pos,
            neg: split.neg,
        }
        .to_device(device)
    }

    /// Number of positive edges.
    pub fn num_pos(&self) -> usize {
        self.pos.dims()[1]
    }

    /// Pure device placement: returns new handles, leaves `self` untouched.
    pub fn to_device(&self, device: &Device) -> TrainResult<Self> {
        Ok(Self {
            pos: self
                .pos
                .to_device(device)
                .map_err(|e| TrainError::tensor("edge placement", e))?,
            neg: self
                .neg
                .to_device(device)
                .map_err(|e| TrainError::tensor("edge placement", e))?,
        })
    }

    /// Detached host copy, for cross-epoch accumulation without pinning
    /// device memory.
    pub fn detach_to_host(&self) -> TrainResult<Self> {
        Ok(Self {
            pos: self
                .pos
                .detach()
                .to_device(&Device::Cpu)
                .map_err(|e| TrainError::tensor("edge host copy", e))?,
            neg: self
                .neg
                .detach()
                .to_device(&Device::Cpu)
                .map_err(|e| TrainError::tensor("edge host copy", e))?,
        })
    }

    /// Concatenate two splits of the same relation along the edge dimension.
    pub fn concat(&self, other: &Self) -> TrainResult<Self> {
        Ok(Self {
            pos: Tensor::cat(&[&self.pos, &other.pos], 1)
                .map_err(|e| TrainError::tensor("edge concat", e))?,
            neg: Tensor::cat(&[&self.neg, &other.neg], 1)
                .map_err(|e| TrainError::tensor("edge concat", e))?,
        })
    }
}

/// Per-relation edge map for one graph.
pub type RelationEdgeMap = BTreeMap<RelationId, RelationEdges>;

/// A minibatch of seed nodes plus their sampled neighborhood.
#[derive(Debug, Clone)]
pub struct NodeBatch {
    /// Sorted, deduplicated local node ids.
    pub nodes: Vec<u32>,
}

/// Batching handle produced by the generator.
#[derive(Debug, Clone)]
pub enum BatchLoader {
    /// Whole graph in one step.
    Full,
    /// Iterable neighbor-sampled minibatches.
    Neighbor(Vec<NodeBatch>),
}

/// One graph's batch for one phase: loader handle, device-resident node
/// features, and this phase's relation edge map.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    pub loader: BatchLoader,
    pub features: Tensor,
    pub relation_edges: RelationEdgeMap,
}

impl GraphBatch {
    /// Number of minibatches the loader yields (1 for full-graph).
    pub fn num_minibatches(&self) -> usize {
        match &self.loader {
            BatchLoader::Full => 1,
            BatchLoader::Neighbor(batches) => batches.len().max(1),
        }
    }

    /// Materialize minibatch `idx` as a full-batch `GraphBatch` over the
    /// subgraph induced by its node set, with edges reindexed to subgraph
    /// coordinates. Returns the batch and the subgraph→original node map.
    /// For full-graph loaders this is the identity.
    pub fn restrict(&self, idx: usize) -> TrainResult<(GraphBatch, Vec<u32>)> {
        let batch = match &self.loader {
            BatchLoader::Neighbor(batches) if !batches.is_empty() => &batches[idx % batches.len()],
            // Full loaders, and neighbor loaders over graphs with no nodes
            // to seed from, pass the whole graph through.
            _ => {
                let n = self.features.dims()[0] as u32;
                return Ok((
                    GraphBatch {
                        loader: BatchLoader::Full,
                        features: self.features.clone(),
                        relation_edges: self.relation_edges.clone(),
                    },
                    (0..n).collect(),
                ));
            }
        };

        let remap: HashMap<u32, u32> = batch
            .nodes
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new as u32))
            .collect();

        let index = Tensor::from_vec(batch.nodes.clone(), batch.nodes.len(), &Device::Cpu)
            .and_then(|t| t.to_device(self.features.device()))
            .map_err(|e| TrainError::tensor("subgraph index", e))?;
        let features = self
            .features
            .index_select(&index, 0)
            .map_err(|e| TrainError::tensor("subgraph features", e))?;

        let mut relation_edges = RelationEdgeMap::new();
        for (&rel, edges) in &self.relation_edges {
            relation_edges.insert(
                rel,
                RelationEdges {
                    pos: restrict_edges(&edges.pos, &remap, self.features.device())?,
                    neg: restrict_edges(&edges.neg, &remap, self.features.device())?,
                },
            );
        }

        Ok((
            GraphBatch {
                loader: BatchLoader::Full,
                features,
                relation_edges,
            },
            batch.nodes.clone(),
        ))
    }
}

/// Keep only edges with both endpoints in the subgraph, reindexed.
fn restrict_edges(
    edges: &Tensor,
    remap: &HashMap<u32, u32>,
    device: &Device,
) -> TrainResult<Tensor> {
    if edges.dims()[1] == 0 {
        return edge_index_tensor(&[], &[])?
            .to_device(device)
            .map_err(|e| TrainError::tensor("edge restrict placement", e));
    }
    let rows = edges
        .to_device(&Device::Cpu)
        .and_then(|t| t.to_vec2::<u32>())
        .map_err(|e| TrainError::tensor("edge restrict read", e))?;
    let mut src = Vec::new();
    let mut dst = Vec::new();
    for (s, d) in rows[0].iter().zip(rows[1].iter()) {
        if let (Some(&ns), Some(&nd)) = (remap.get(s), remap.get(d)) {
            src.push(ns);
            dst.push(nd);
        }
    }
    edge_index_tensor(&src, &dst)?
        .to_device(device)
        .map_err(|e| TrainError::tensor("edge restrict placement", e))
}

/// Batch of every context graph for one phase.
#[derive(Debug, Clone)]
pub struct PhaseBatch {
    pub entries: BTreeMap<ContextId, GraphBatch>,
}

impl PhaseBatch {
    /// Maximum minibatch count across contexts; contexts with fewer batches
    /// wrap around so every step sees all contexts.
    pub fn num_minibatches(&self) -> usize {
        self.entries
            .values()
            .map(GraphBatch::num_minibatches)
            .max()
            .unwrap_or(1)
    }

    /// Restrict every context to its minibatch `idx`. Also returns the
    /// per-context subgraph→original node maps.
    pub fn restrict(
        &self,
        idx: usize,
    ) -> TrainResult<(PhaseBatch, BTreeMap<ContextId, Vec<u32>>)> {
        let mut entries = BTreeMap::new();
        let mut node_maps = BTreeMap::new();
        for (&ctx, batch) in &self.entries {
            let (restricted, nodes) = batch.restrict(idx)?;
            entries.insert(ctx, restricted);
            node_maps.insert(ctx, nodes);
        }
        Ok((PhaseBatch { entries }, node_maps))
    }

    /// Detached host copies of every context's relation edge map.
    pub fn detach_edges_to_host(&self) -> TrainResult<BTreeMap<ContextId, RelationEdgeMap>> {
        let mut out = BTreeMap::new();
        for (&ctx, batch) in &self.entries {
            let mut edges = RelationEdgeMap::new();
            for (&rel, e) in &batch.relation_edges {
                edges.insert(rel, e.detach_to_host()?);
            }
            out.insert(ctx, edges);
        }
        Ok(out)
    }
}

/// Build one graph's batch: split every relation for `phase`, place feature
/// and edge tensors on `device`, construct the loader.
#[allow(clippy::too_many_arguments)]
fn build_graph_batch(
    graph: &ContextGraph,
    ctx: ContextId,
    relations: &BTreeMap<RelationId, String>,
    splitter: &EdgeSplitter,
    phase: Phase,
    batch_size: usize,
    device: &Device,
    loader_kind: LoaderKind,
    sample_seed: u64,
) -> TrainResult<GraphBatch> {
    let mut relation_edges = RelationEdgeMap::new();
    for &rel in relations.keys() {
        let split = splitter.split(graph, ctx, rel, phase)?;
        relation_edges.insert(rel, RelationEdges::from_split(split, device)?);
    }

    let features = graph
        .features()
        .to_device(device)
        .map_err(|e| TrainError::tensor("feature placement", e))?;

    let loader = match loader_kind {
        LoaderKind::FullGraph => BatchLoader::Full,
        LoaderKind::Neighbor { num_neighbors } => BatchLoader::Neighbor(sample_node_batches(
            graph,
            batch_size,
            num_neighbors,
            sample_seed ^ ((ctx.0 as u64) << 17),
        )),
    };

    Ok(GraphBatch {
        loader,
        features,
        relation_edges,
    })
}

/// One-hop neighbor sampling: shuffle all nodes, chunk into seed batches,
/// extend each chunk with up to `num_neighbors` sampled neighbors per seed.
fn sample_node_batches(
    graph: &ContextGraph,
    batch_size: usize,
    num_neighbors: usize,
    seed: u64,
) -> Vec<NodeBatch> {
    let n = graph.num_nodes();
    let mut adjacency: Vec<Vec<u32>> = vec![Vec::new(); n];
    for list in graph.edges().values() {
        for (s, d) in list.pairs() {
            adjacency[s as usize].push(d);
            adjacency[d as usize].push(s);
        }
    }

    let mut order: Vec<u32> = (0..n as u32).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    order
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let mut nodes: HashSet<u32> = chunk.iter().copied().collect();
            for &node in chunk {
                let neighbors = &adjacency[node as usize];
                if neighbors.len() <= num_neighbors {
                    nodes.extend(neighbors.iter().copied());
                } else {
                    for _ in 0..num_neighbors {
                        nodes.insert(neighbors[rng.gen_range(0..neighbors.len())]);
                    }
                }
            }
            let mut nodes: Vec<u32> = nodes.into_iter().collect();
            nodes.sort_unstable();
            NodeBatch { nodes }
        })
        .collect()
}

/// Generate the per-context phase batch for the whole collection.
#[allow(clippy::too_many_arguments)]
pub fn generate_batch(
    contexts: &BTreeMap<ContextId, ContextGraph>,
    relations: &BTreeMap<RelationId, String>,
    splitter: &EdgeSplitter,
    phase: Phase,
    batch_size: usize,
    device: &Device,
    loader_kind: LoaderKind,
    sample_seed: u64,
) -> TrainResult<PhaseBatch> {
    let mut entries = BTreeMap::new();
    for (&ctx, graph) in contexts {
        entries.insert(
            ctx,
            build_graph_batch(
                graph,
                ctx,
                relations,
                splitter,
                phase,
                batch_size,
                device,
                loader_kind,
                sample_seed,
            )?,
        );
    }
    Ok(PhaseBatch { entries })
}

/// Generate the single meta-graph batch. The meta graph is never
/// minibatched; its loader is always full-graph.
pub fn generate_meta_batch(
    meta: &ContextGraph,
    meta_relations: &BTreeMap<RelationId, String>,
    splitter: &EdgeSplitter,
    phase: Phase,
    device: &Device,
) -> TrainResult<GraphBatch> {
    build_graph_batch(
        meta,
        META_CONTEXT,
        meta_relations,
        splitter,
        phase,
        0,
        device,
        LoaderKind::FullGraph,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EdgeList;

    fn toy_contexts() -> (BTreeMap<ContextId, ContextGraph>, BTreeMap<RelationId, String>) {
        let mut contexts = BTreeMap::new();
        for i in 0..2u32 {
            let mut edges = BTreeMap::new();
            edges.insert(
                RelationId(0),
                EdgeList::from_pairs(&[(0, 1), (1, 2), (2, 3), (3, 4), (4, 0)]),
            );
            // RelationId(1) intentionally absent from the graphs.
            contexts.insert(
                ContextId(i),
                ContextGraph::new(vec![0.1; 5 * 2], 5, 2, edges).unwrap(),
            );
        }
        let mut relations = BTreeMap::new();
        relations.insert(RelationId(0), "interacts".to_string());
        relations.insert(RelationId(1), "regulates".to_string());
        (contexts, relations)
    }

    #[test]
    fn test_relation_keys_match_table_for_every_phase() {
        let (contexts, relations) = toy_contexts();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        for phase in [Phase::Train, Phase::Val, Phase::Test, Phase::All] {
            let batch = generate_batch(
                &contexts,
                &relations,
                &splitter,
                phase,
                2,
                &Device::Cpu,
                LoaderKind::FullGraph,
                0,
            )
            .unwrap();
            for graph_batch in batch.entries.values() {
                let keys: Vec<RelationId> =
                    graph_batch.relation_edges.keys().copied().collect();
                let expected: Vec<RelationId> = relations.keys().copied().collect();
                assert_eq!(keys, expected, "{}: key-set invariant", phase.as_str());
                // The edgeless relation is present but empty.
                assert_eq!(
                    graph_batch.relation_edges[&RelationId(1)].num_pos(),
                    0
                );
            }
        }
    }

    #[test]
    fn test_meta_batch_is_single_full_graph() {
        let (contexts, relations) = toy_contexts();
        let meta = contexts[&ContextId(0)].clone();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let batch =
            generate_meta_batch(&meta, &relations, &splitter, Phase::Train, &Device::Cpu).unwrap();
        assert!(matches!(batch.loader, BatchLoader::Full));
        assert_eq!(batch.num_minibatches(), 1);
        assert_eq!(batch.features.dims(), &[5, 2]);
    }

    #[test]
    fn test_neighbor_loader_covers_all_seeds() {
        let (contexts, relations) = toy_contexts();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let batch = generate_batch(
            &contexts,
            &relations,
            &splitter,
            Phase::Train,
            2,
            &Device::Cpu,
            LoaderKind::Neighbor { num_neighbors: 2 },
            99,
        )
        .unwrap();
        for graph_batch in batch.entries.values() {
            let BatchLoader::Neighbor(batches) = &graph_batch.loader else {
                panic!("expected neighbor loader");
            };
            let mut seen: HashSet<u32> = HashSet::new();
            for b in batches {
                seen.extend(b.nodes.iter().copied());
            }
            assert_eq!(seen.len(), 5, "every node appears in some batch");
        }
    }

    #[test]
    fn test_restrict_reindexes_into_subgraph_range() {
        let (contexts, relations) = toy_contexts();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let batch = generate_batch(
            &contexts,
            &relations,
            &splitter,
            Phase::Train,
            2,
            &Device::Cpu,
            LoaderKind::Neighbor { num_neighbors: 2 },
            99,
        )
        .unwrap();
        let (restricted, node_maps) = batch.restrict(0).unwrap();
        for (ctx, graph_batch) in &restricted.entries {
            let n = node_maps[ctx].len();
            assert_eq!(graph_batch.features.dims()[0], n);
            for edges in graph_batch.relation_edges.values() {
                if edges.num_pos() == 0 {
                    continue;
                }
                let rows = edges.pos.to_vec2::<u32>().unwrap();
                for &v in rows[0].iter().chain(rows[1].iter()) {
                    assert!((v as usize) < n, "edge endpoint outside subgraph");
                }
            }
        }
    }

    #[test]
    fn test_neighbor_restrict_handles_empty_graph() {
        let mut contexts = BTreeMap::new();
        let mut edges = BTreeMap::new();
        edges.insert(RelationId(0), EdgeList::from_pairs(&[]));
        contexts.insert(
            ContextId(0),
            ContextGraph::new(Vec::new(), 0, 2, edges).unwrap(),
        );
        let mut relations = BTreeMap::new();
        relations.insert(RelationId(0), "interacts".to_string());
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let batch = generate_batch(
            &contexts,
            &relations,
            &splitter,
            Phase::Train,
            2,
            &Device::Cpu,
            LoaderKind::Neighbor { num_neighbors: 2 },
            0,
        )
        .unwrap();
        assert_eq!(batch.num_minibatches(), 1);
        let (restricted, node_maps) = batch.restrict(0).unwrap();
        assert_eq!(restricted.entries[&ContextId(0)].features.dims()[0], 0);
        assert!(node_maps[&ContextId(0)].is_empty());
    }

    #[test]
    fn test_full_restrict_is_identity() {
        let (contexts, relations) = toy_contexts();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let batch = generate_batch(
            &contexts,
            &relations,
            &splitter,
            Phase::All,
            2,
            &Device::Cpu,
            LoaderKind::FullGraph,
            0,
        )
        .unwrap();
        let (restricted, node_maps) = batch.restrict(0).unwrap();
        assert_eq!(
            restricted.entries[&ContextId(0)].features.dims(),
            batch.entries[&ContextId(0)].features.dims()
        );
        assert_eq!(node_maps[&ContextId(0)], (0..5).collect::<Vec<u32>>());
    }

    #[test]
    fn test_concat_joins_edge_dimension() {
        let (contexts, relations) = toy_contexts();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let train = generate_batch(
            &contexts, &relations, &splitter, Phase::Train, 2, &Device::Cpu,
            LoaderKind::FullGraph, 0,
        )
        .unwrap();
        let val = generate_batch(
            &contexts, &relations, &splitter, Phase::Val, 2, &Device::Cpu,
            LoaderKind::FullGraph, 0,
        )
        .unwrap();
        let t = &train.entries[&ContextId(0)].relation_edges[&RelationId(0)];
        let v = &val.entries[&ContextId(0)].relation_edges[&RelationId(0)];
        let joined = t.concat(v).unwrap();
        assert_eq!(joined.num_pos(), t.num_pos() + v.num_pos());
    }
}
