//! Inference driver shared by validation, test and final evaluation.
//!
//! Message passing and scoring take different edge sets: the caller picks
//! which edges the forward pass propagates over (train edges during
//! validation, train plus val during test) and which split's positive and
//! negative pairs get scored. Outputs are detached host values; nothing
//! here touches gradients or model state.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::batch::{GraphBatch, PhaseBatch};
use crate::data::{ContextId, RelationId};
use crate::error::{TrainError, TrainResult};
use crate::model::{ModelOutput, SharedModel};

/// Host-side logits for one relation's scored edges.
#[derive(Debug, Clone, Default)]
pub struct RelationScores {
    pub pos: Vec<f32>,
    pub neg: Vec<f32>,
}

/// Everything one inference pass produces.
#[derive(Debug)]
pub struct PhasePredictions {
    pub context_scores: BTreeMap<ContextId, BTreeMap<RelationId, RelationScores>>,
    pub meta_scores: BTreeMap<RelationId, RelationScores>,
    /// Detached embeddings from the message-passing forward.
    pub output: ModelOutput,
}

fn host_logits(model: &dyn SharedModel, embeddings: &Tensor, edges: &Tensor) -> TrainResult<Vec<f32>> {
    model
        .score(embeddings, edges)?
        .detach()
        .to_device(&Device::Cpu)
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| TrainError::tensor("logit host copy", e))
}

fn detach_output(output: ModelOutput) -> TrainResult<ModelOutput> {
    let mut context_embeddings = BTreeMap::new();
    for (ctx, emb) in output.context_embeddings {
        context_embeddings.insert(ctx, emb.detach());
    }
    Ok(ModelOutput {
        context_embeddings,
        meta_embeddings: output.meta_embeddings.detach(),
    })
}

/// Run one inference pass: forward over the message edges, then score the
/// scored batches' positive and negative pairs.
pub fn predict(
    model: &dyn SharedModel,
    message_contexts: &PhaseBatch,
    message_meta: &GraphBatch,
    scored_contexts: &PhaseBatch,
    scored_meta: &GraphBatch,
) -> TrainResult<PhasePredictions> {
    let output = model.forward(message_contexts, message_meta, false)?;

    let mut context_scores = BTreeMap::new();
    for (&ctx, batch) in &scored_contexts.entries {
        let embeddings =
            output
                .context_embeddings
                .get(&ctx)
                .ok_or_else(|| TrainError::InvalidGraph {
                    message: format!("{}: scored batch has no message-edge counterpart", ctx),
                })?;
        let mut per_relation = BTreeMap::new();
        for (&rel, edges) in &batch.relation_edges {
            per_relation.insert(
                rel,
                RelationScores {
                    pos: host_logits(model, embeddings, &edges.pos)?,
                    neg: host_logits(model, embeddings, &edges.neg)?,
                },
            );
        }
        context_scores.insert(ctx, per_relation);
    }

    let mut meta_scores = BTreeMap::new();
    for (&rel, edges) in &scored_meta.relation_edges {
        meta_scores.insert(
            rel,
            RelationScores {
                pos: host_logits(model, &output.meta_embeddings, &edges.pos)?,
                neg: host_logits(model, &output.meta_embeddings, &edges.neg)?,
            },
        );
    }

    Ok(PhasePredictions {
        context_scores,
        meta_scores,
        output: detach_output(output)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{generate_batch, generate_meta_batch};
    use crate::config::LoaderKind;
    use crate::split::{EdgeSplitter, Phase};
    use crate::testutil::{toy_registry, toy_trained_model};

    #[test]
    fn test_val_scores_use_train_message_edges() {
        let registry = toy_registry();
        let model = toy_trained_model();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let device = Device::Cpu;

        let train = generate_batch(
            registry.contexts(), registry.relations(), &splitter, Phase::Train,
            8, &device, LoaderKind::FullGraph, 0,
        )
        .unwrap();
        let train_meta = generate_meta_batch(
            registry.meta(), registry.meta_relations(), &splitter, Phase::Train, &device,
        )
        .unwrap();
        let val = generate_batch(
            registry.contexts(), registry.relations(), &splitter, Phase::Val,
            8, &device, LoaderKind::FullGraph, 0,
        )
        .unwrap();
        let val_meta = generate_meta_batch(
            registry.meta(), registry.meta_relations(), &splitter, Phase::Val, &device,
        )
        .unwrap();

        let preds = predict(&model, &train, &train_meta, &val, &val_meta).unwrap();
        for (ctx, per_rel) in &preds.context_scores {
            for (rel, scores) in per_rel {
                let edges = &val.entries[ctx].relation_edges[rel];
                assert_eq!(scores.pos.len(), edges.num_pos());
                assert_eq!(scores.neg.len(), edges.neg.dims()[1]);
            }
        }
        assert_eq!(preds.output.context_embeddings.len(), 2);
    }

    #[test]
    fn test_predict_is_deterministic() {
        let registry = toy_registry();
        let model = toy_trained_model();
        let splitter = EdgeSplitter::new(3, 0.6, 0.2);
        let device = Device::Cpu;
        let batch = generate_batch(
            registry.contexts(), registry.relations(), &splitter, Phase::All,
            8, &device, LoaderKind::FullGraph, 0,
        )
        .unwrap();
        let meta = generate_meta_batch(
            registry.meta(), registry.meta_relations(), &splitter, Phase::All, &device,
        )
        .unwrap();
        let a = predict(&model, &batch, &meta, &batch, &meta).unwrap();
        let b = predict(&model, &batch, &meta, &batch, &meta).unwrap();
        let ctx = ContextId(0);
        let rel = RelationId(0);
        assert_eq!(a.context_scores[&ctx][&rel].pos, b.context_scores[&ctx][&rel].pos);
        assert_eq!(a.meta_scores[&rel].pos, b.meta_scores[&rel].pos);
    }
}
