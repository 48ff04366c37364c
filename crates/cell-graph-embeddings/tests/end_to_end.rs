//! Full pipeline over a small synthetic dataset: train, select, finalize.

use std::collections::BTreeMap;

use candle_core::Device;

use cell_graph_embeddings::config::{LoaderKind, TrainConfig};
use cell_graph_embeddings::data::{
    ContextGraph, ContextId, DatasetRegistry, EdgeList, RelationId,
};
use cell_graph_embeddings::metrics::TracingSink;
use cell_graph_embeddings::train::TrainingSession;

fn ring_registry() -> DatasetRegistry {
    let rel = RelationId(0);
    let nodes = 5usize;
    let mut contexts = BTreeMap::new();
    let mut names = BTreeMap::new();
    let mut meta_index = BTreeMap::new();
    let mut labels = BTreeMap::new();
    for i in 0..2u32 {
        // Ring plus chords: 10 positive edges over 5 nodes.
        let mut pairs = Vec::new();
        for n in 0..nodes as u32 {
            pairs.push((n, (n + 1) % nodes as u32));
            pairs.push((n, (n + 2) % nodes as u32));
        }
        let mut edges = BTreeMap::new();
        edges.insert(rel, EdgeList::from_pairs(&pairs));
        let features: Vec<f32> = (0..nodes * 4).map(|v| (v as f32 * 0.2).sin()).collect();
        contexts.insert(
            ContextId(i),
            ContextGraph::new(features, nodes, 4, edges).unwrap(),
        );
        names.insert(ContextId(i), format!("ring-{}", i));
        meta_index.insert(ContextId(i), i);
        labels.insert(ContextId(i), (0..nodes).map(|n| (n % 2) as u32).collect());
    }
    let mut meta_edges = BTreeMap::new();
    meta_edges.insert(rel, EdgeList::from_pairs(&[(0, 1)]));
    let meta = ContextGraph::new(vec![0.3; 2 * 3], 2, 3, meta_edges).unwrap();
    let mut relations = BTreeMap::new();
    relations.insert(rel, "interacts".to_string());
    let mut meta_relations = BTreeMap::new();
    meta_relations.insert(rel, "adjacent".to_string());
    DatasetRegistry::new(contexts, names, meta, meta_index, relations, meta_relations, labels)
        .unwrap()
}

fn config(dir: &std::path::Path) -> TrainConfig {
    let mut config = TrainConfig {
        epochs: 2,
        batch_size: 8,
        loader: LoaderKind::FullGraph,
        seed: 3,
        train_frac: 0.6,
        val_frac: 0.2,
        output_dir: dir.join("run"),
        ..Default::default()
    };
    config.hyperparams.hidden = 8;
    config.hyperparams.output = 4;
    config.hyperparams.dropout = 0.0;
    config
}

#[test]
fn full_run_produces_embeddings_and_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut session =
        TrainingSession::new(ring_registry(), config(dir.path()), &Device::Cpu).unwrap();
    let mut sink = TracingSink;

    let history = session.run(&mut sink).unwrap();
    assert_eq!(history.epochs.len(), 2);
    for record in &history.epochs {
        assert!(record.train_loss.is_finite());
    }

    let artifacts = session.finalize(&mut sink).unwrap();
    // One embedding row per node, All-phase over the full graphs.
    assert_eq!(artifacts.context_embeddings[&ContextId(0)].dims(), &[5, 4]);
    assert_eq!(artifacts.context_embeddings[&ContextId(1)].dims(), &[5, 4]);
    assert_eq!(artifacts.meta_embeddings.dims(), &[2, 4]);

    let out = dir.path().join("run");
    assert!(out.join("embeddings.safetensors").exists());
    assert!(out.join("best_model.safetensors").exists());
    assert!(out.join("history.json").exists());
    assert!(out.join("metrics.log").exists());
}

#[test]
fn best_score_history_is_non_decreasing_beyond_eps() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.epochs = 4;
    let mut session = TrainingSession::new(ring_registry(), cfg, &Device::Cpu).unwrap();
    let mut sink = TracingSink;
    session.run(&mut sink).unwrap();

    // Each accepted epoch may lower the best by at most eps; a rejected
    // epoch leaves it unchanged. Track the rule over the recorded history.
    let eps = 1e-3;
    let mut best = f64::NEG_INFINITY;
    for record in &session.history().epochs {
        if record.improved {
            assert!(
                best <= record.val_score + eps,
                "accepted score {} against best {}",
                record.val_score,
                best
            );
            best = record.val_score;
        }
    }
    assert!(best.is_finite(), "at least one epoch must be accepted");
}

#[test]
fn neighbor_loader_trains_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.loader = LoaderKind::Neighbor { num_neighbors: 3 };
    cfg.batch_size = 4;
    let mut session = TrainingSession::new(ring_registry(), cfg, &Device::Cpu).unwrap();
    let mut sink = TracingSink;
    let record = session.train_epoch(0, &mut sink).unwrap();
    assert!(record.train_loss.is_finite());
}

#[test]
fn same_seed_reproduces_identical_embeddings() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let run = |dir: &std::path::Path| {
        let mut session =
            TrainingSession::new(ring_registry(), config(dir), &Device::Cpu).unwrap();
        let mut sink = TracingSink;
        session.run(&mut sink).unwrap();
        session
            .finalize(&mut sink)
            .unwrap()
            .context_embeddings[&ContextId(0)]
            .to_vec2::<f32>()
            .unwrap()
    };
    assert_eq!(run(dir_a.path()), run(dir_b.path()));
}
