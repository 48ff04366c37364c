//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use candle_core::Device;

use crate::config::{Hyperparams, LoaderKind, TrainConfig};
use crate::data::{ContextGraph, ContextId, DatasetRegistry, EdgeList, RelationId};
use crate::model::RelationalModel;

/// Two 6-node contexts with one relation type, a 3-node meta graph, and
/// two cluster classes.
pub(crate) fn toy_registry() -> DatasetRegistry {
    let rel = RelationId(0);
    let mut contexts = BTreeMap::new();
    let mut names = BTreeMap::new();
    let mut meta_index = BTreeMap::new();
    let mut labels = BTreeMap::new();
    for i in 0..2u32 {
        let mut edges = BTreeMap::new();
        edges.insert(
            rel,
            EdgeList::from_pairs(&[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0), (0, 2), (1, 3), (2, 4), (3, 5)]),
        );
        let features: Vec<f32> = (0..6 * 3).map(|v| (v as f32 * 0.1).sin()).collect();
        contexts.insert(ContextId(i), ContextGraph::new(features, 6, 3, edges).unwrap());
        names.insert(ContextId(i), format!("context-{}", i));
        meta_index.insert(ContextId(i), i);
        labels.insert(ContextId(i), vec![0, 0, 0, 1, 1, 1]);
    }
    let mut meta_edges = BTreeMap::new();
    meta_edges.insert(rel, EdgeList::from_pairs(&[(0, 1), (1, 2)]));
    let meta = ContextGraph::new(vec![1.0; 3 * 4], 3, 4, meta_edges).unwrap();
    let mut relations = BTreeMap::new();
    relations.insert(rel, "interacts".to_string());
    let mut meta_relations = BTreeMap::new();
    meta_relations.insert(rel, "adjacent".to_string());
    DatasetRegistry::new(contexts, names, meta, meta_index, relations, meta_relations, labels)
        .unwrap()
}

pub(crate) fn toy_hyperparams() -> Hyperparams {
    Hyperparams {
        hidden: 8,
        output: 4,
        dropout: 0.0,
        ..Default::default()
    }
}

pub(crate) fn toy_config() -> TrainConfig {
    TrainConfig {
        epochs: 2,
        batch_size: 4,
        loader: LoaderKind::FullGraph,
        seed: 3,
        train_frac: 0.6,
        val_frac: 0.2,
        hyperparams: toy_hyperparams(),
        ..Default::default()
    }
}

pub(crate) fn toy_trained_model() -> RelationalModel {
    RelationalModel::from_registry(&toy_registry(), &toy_hyperparams(), &Device::Cpu, 3).unwrap()
}
