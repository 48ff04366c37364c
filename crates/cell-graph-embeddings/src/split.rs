//! Edge splitting and negative sampling, per relation type.
//!
//! Each relation's positive edges are partitioned into train/val/test by one
//! seeded permutation per (context, relation), so the three phases are
//! disjoint, exhaustive, and identical on every call within a run. The
//! finalizer relies on this: it recombines train and validation tensors
//! later and assumes they are still the halves created here.
//!
//! Negatives are drawn from the complement of the relation's FULL positive
//! edge set, never just the phase subset, so a true edge from another phase
//! can never leak in as a negative.

use std::collections::HashSet;

use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data::graph::edge_index_tensor;
use crate::data::{ContextGraph, ContextId, RelationId};
use crate::error::TrainResult;

/// Dataset phase selecting which edge subset a batch carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Val,
    Test,
    All,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Val => "val",
            Phase::Test => "test",
            Phase::All => "all",
        }
    }

    fn salt(&self) -> u64 {
        match self {
            Phase::Train => 1,
            Phase::Val => 2,
            Phase::Test => 3,
            Phase::All => 4,
        }
    }
}

/// One relation's split for one phase: positive and sampled negative edge
/// index tensors, both 2 x E on the host. |pos| == |neg| except when the
/// sampler had to degrade on a near-complete graph.
#[derive(Debug, Clone)]
pub struct RelationSplit {
    pub pos: Tensor,
    pub neg: Tensor,
}

/// Deterministic splitter + negative sampler.
#[derive(Debug, Clone)]
pub struct EdgeSplitter {
    seed: u64,
    train_frac: f32,
    val_frac: f32,
}

impl EdgeSplitter {
    pub fn new(seed: u64, train_frac: f32, val_frac: f32) -> Self {
        Self {
            seed,
            train_frac,
            val_frac,
        }
    }

    /// Split one relation of one graph for the given phase.
    ///
    /// `All` returns every positive edge unmodified. Relations with no
    /// edges yield empty 2 x 0 tensors.
    pub fn split(
        &self,
        graph: &ContextGraph,
        ctx: ContextId,
        rel: RelationId,
        phase: Phase,
    ) -> TrainResult<RelationSplit> {
        let list = graph.edge_list(rel);
        let e = list.len();

        let selected: Vec<usize> = if matches!(phase, Phase::All) {
            (0..e).collect()
        } else {
            // One permutation per (ctx, rel); phases slice it disjointly.
            let mut order: Vec<usize> = (0..e).collect();
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.stream_seed(ctx, rel, 0));
            order.shuffle(&mut rng);
            let n_train = (e as f32 * self.train_frac).round() as usize;
            let n_val = (e as f32 * self.val_frac).round() as usize;
            let n_train = n_train.min(e);
            let n_val = n_val.min(e - n_train);
            match phase {
                Phase::Train => order[..n_train].to_vec(),
                Phase::Val => order[n_train..n_train + n_val].to_vec(),
                Phase::Test => order[n_train + n_val..].to_vec(),
                Phase::All => unreachable!(),
            }
        };

        let src: Vec<u32> = selected.iter().map(|&i| list.src[i]).collect();
        let dst: Vec<u32> = selected.iter().map(|&i| list.dst[i]).collect();

        let positives: HashSet<(u32, u32)> = list.pairs().collect();
        let (neg_src, neg_dst) = self.sample_negatives(
            graph.num_nodes(),
            &positives,
            src.len(),
            self.stream_seed(ctx, rel, phase.salt()),
        );

        Ok(RelationSplit {
            pos: edge_index_tensor(&src, &dst)?,
            neg: edge_index_tensor(&neg_src, &neg_dst)?,
        })
    }

    /// Rejection-sample `count` edges from the complement of `positives`.
    ///
    /// Bounded: if the complement is too small (graph near complete), the
    /// found negatives are cycled to reach `count` with a warning; if no
    /// non-edge exists at all, the result is empty.
    fn sample_negatives(
        &self,
        num_nodes: usize,
        positives: &HashSet<(u32, u32)>,
        count: usize,
        seed: u64,
    ) -> (Vec<u32>, Vec<u32>) {
        if count == 0 || num_nodes < 2 {
            return (Vec::new(), Vec::new());
        }
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut seen: HashSet<(u32, u32)> = HashSet::with_capacity(count);
        let mut src = Vec::with_capacity(count);
        let mut dst = Vec::with_capacity(count);
        let max_attempts = 20 * count + 100;
        let mut attempts = 0;
        while src.len() < count && attempts < max_attempts {
            attempts += 1;
            let s = rng.gen_range(0..num_nodes as u32);
            let d = rng.gen_range(0..num_nodes as u32);
            if s == d || positives.contains(&(s, d)) || seen.contains(&(s, d)) {
                continue;
            }
            seen.insert((s, d));
            src.push(s);
            dst.push(d);
        }
        if src.len() < count {
            if src.is_empty() {
                tracing::warn!(
                    "negative sampling found no non-edges among {} nodes; returning empty set",
                    num_nodes
                );
            } else {
                tracing::warn!(
                    "negative sampling exhausted after {} attempts ({}/{} found); reusing samples",
                    attempts,
                    src.len(),
                    count
                );
                let found = src.len();
                for i in found..count {
                    src.push(src[i % found]);
                    dst.push(dst[i % found]);
                }
            }
        }
        (src, dst)
    }

    fn stream_seed(&self, ctx: ContextId, rel: RelationId, salt: u64) -> u64 {
        self.seed
            ^ (ctx.0 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (rel.0 as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
            ^ salt.wrapping_mul(0x94D0_49BB_1331_11EB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::EdgeList;
    use std::collections::BTreeMap;

    fn graph_with_edges(pairs: &[(u32, u32)], n: usize) -> ContextGraph {
        let mut edges = BTreeMap::new();
        edges.insert(RelationId(0), EdgeList::from_pairs(pairs));
        ContextGraph::new(vec![0.0; n * 2], n, 2, edges).unwrap()
    }

    fn pairs_of(t: &Tensor) -> Vec<(u32, u32)> {
        if t.dims()[1] == 0 {
            return Vec::new();
        }
        let rows = t.to_vec2::<u32>().unwrap();
        rows[0].iter().copied().zip(rows[1].iter().copied()).collect()
    }

    fn ten_edge_graph() -> ContextGraph {
        let pairs: Vec<(u32, u32)> = (0..5u32)
            .flat_map(|s| (0..5u32).map(move |d| (s, d)))
            .filter(|&(s, d)| s != d)
            .take(10)
            .collect();
        graph_with_edges(&pairs, 5)
    }

    #[test]
    fn test_phases_partition_all_edges() {
        let graph = ten_edge_graph();
        let splitter = EdgeSplitter::new(3, 0.8, 0.1);
        let ctx = ContextId(0);
        let rel = RelationId(0);

        let mut recombined: Vec<(u32, u32)> = Vec::new();
        for phase in [Phase::Train, Phase::Val, Phase::Test] {
            let split = splitter.split(&graph, ctx, rel, phase).unwrap();
            recombined.extend(pairs_of(&split.pos));
        }
        let all = splitter.split(&graph, ctx, rel, Phase::All).unwrap();
        let mut expected = pairs_of(&all.pos);
        recombined.sort_unstable();
        expected.sort_unstable();
        assert_eq!(recombined, expected, "train+val+test must equal all");
    }

    #[test]
    fn test_train_val_concat_law() {
        // The finalizer concatenates train and val tensors; together with
        // test they must reproduce the full edge set, modulo ordering.
        let graph = ten_edge_graph();
        let splitter = EdgeSplitter::new(11, 0.8, 0.1);
        let train = splitter.split(&graph, ContextId(1), RelationId(0), Phase::Train).unwrap();
        let val = splitter.split(&graph, ContextId(1), RelationId(0), Phase::Val).unwrap();
        let test = splitter.split(&graph, ContextId(1), RelationId(0), Phase::Test).unwrap();
        let all = splitter.split(&graph, ContextId(1), RelationId(0), Phase::All).unwrap();

        let joined = Tensor::cat(&[&train.pos, &val.pos], 1).unwrap();
        let mut union = pairs_of(&joined);
        union.extend(pairs_of(&test.pos));
        union.sort_unstable();
        let mut expected = pairs_of(&all.pos);
        expected.sort_unstable();
        assert_eq!(union, expected);
    }

    #[test]
    fn test_negative_counts_match_and_avoid_positives() {
        let graph = ten_edge_graph();
        let splitter = EdgeSplitter::new(3, 0.8, 0.1);
        let all_pos: HashSet<(u32, u32)> =
            graph.edge_list(RelationId(0)).pairs().collect();

        for phase in [Phase::Train, Phase::Val, Phase::Test, Phase::All] {
            let split = splitter.split(&graph, ContextId(0), RelationId(0), phase).unwrap();
            assert_eq!(
                split.pos.dims()[1],
                split.neg.dims()[1],
                "{}: |neg| must equal |pos|",
                phase.as_str()
            );
            for pair in pairs_of(&split.neg) {
                assert!(
                    !all_pos.contains(&pair),
                    "{}: negative {:?} is a true edge",
                    phase.as_str(),
                    pair
                );
            }
        }
    }

    #[test]
    fn test_same_seed_reproduces_splits() {
        let graph = ten_edge_graph();
        let a = EdgeSplitter::new(42, 0.8, 0.1);
        let b = EdgeSplitter::new(42, 0.8, 0.1);
        for phase in [Phase::Train, Phase::Val, Phase::Test] {
            let sa = a.split(&graph, ContextId(2), RelationId(0), phase).unwrap();
            let sb = b.split(&graph, ContextId(2), RelationId(0), phase).unwrap();
            assert_eq!(pairs_of(&sa.pos), pairs_of(&sb.pos));
            assert_eq!(pairs_of(&sa.neg), pairs_of(&sb.neg));
        }
    }

    #[test]
    fn test_different_seed_changes_splits() {
        let graph = ten_edge_graph();
        let a = EdgeSplitter::new(1, 0.8, 0.1);
        let b = EdgeSplitter::new(2, 0.8, 0.1);
        let sa = a.split(&graph, ContextId(0), RelationId(0), Phase::Train).unwrap();
        let sb = b.split(&graph, ContextId(0), RelationId(0), Phase::Train).unwrap();
        // Positives may coincide by chance on tiny graphs; negatives with a
        // different stream should not be identical as well.
        assert!(pairs_of(&sa.pos) != pairs_of(&sb.pos) || pairs_of(&sa.neg) != pairs_of(&sb.neg));
    }

    #[test]
    fn test_zero_edge_relation_yields_empty_tensors() {
        let graph = graph_with_edges(&[], 4);
        let splitter = EdgeSplitter::new(3, 0.8, 0.1);
        let split = splitter.split(&graph, ContextId(0), RelationId(0), Phase::Train).unwrap();
        assert_eq!(split.pos.dims(), &[2, 0]);
        assert_eq!(split.neg.dims(), &[2, 0]);
    }

    #[test]
    fn test_all_phase_preserves_order() {
        let pairs = [(0u32, 1u32), (1, 2), (2, 3)];
        let graph = graph_with_edges(&pairs, 4);
        let splitter = EdgeSplitter::new(3, 0.8, 0.1);
        let split = splitter.split(&graph, ContextId(0), RelationId(0), Phase::All).unwrap();
        assert_eq!(pairs_of(&split.pos), pairs.to_vec());
    }

    #[test]
    fn test_dense_graph_degrades_instead_of_hanging() {
        // 2 nodes, both directed non-self pairs are positive: no negative
        // exists. The sampler must return (possibly empty) rather than loop.
        let graph = graph_with_edges(&[(0, 1), (1, 0)], 2);
        let splitter = EdgeSplitter::new(3, 0.8, 0.1);
        let split = splitter.split(&graph, ContextId(0), RelationId(0), Phase::All).unwrap();
        assert_eq!(split.pos.dims()[1], 2);
        assert_eq!(split.neg.dims()[1], 0);
    }
}
