//! The training session: one object owning everything a run needs.
//!
//! A session holds the registry, splitter, model, optimizer, auxiliary
//! loss, best-model selector and per-epoch history. Each epoch it builds
//! fresh train batches, steps the optimizer per minibatch over the joint
//! link-prediction loss of both graph collections, evaluates on the
//! validation split using train-phase message edges, and hands the
//! validation score to the selector. Host copies of the train and val
//! edge splits are retained for the finalizer.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::loss::binary_cross_entropy_with_logit;
use serde::Serialize;

use crate::batch::{
    generate_batch, generate_meta_batch, GraphBatch, PhaseBatch, RelationEdgeMap,
};
use crate::config::TrainConfig;
use crate::data::{ContextId, DatasetRegistry, NodeMasks, RelationId};
use crate::error::{TrainError, TrainResult};
use crate::metrics::{ClusteringMetrics, LinkMetrics, MetricsSink};
use crate::model::{ParamSnapshot, RelationalModel, SharedModel};
use crate::split::{EdgeSplitter, Phase};
use crate::train::center_loss::CenterLoss;
use crate::train::checkpoint::BestModelSelector;
use crate::train::optimizer::{AdamW, AdamWConfig};
use crate::train::predict::{predict, PhasePredictions};

/// One epoch's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train: LinkMetrics,
    pub val: LinkMetrics,
    /// Clustering quality of this epoch's validation context embeddings.
    pub val_clustering: ClusteringMetrics,
    /// Mean validation accuracy across contexts and the meta graph; the
    /// score the best-model rule sees.
    pub val_score: f64,
    pub improved: bool,
}

/// Append-only record of a run.
#[derive(Debug, Default, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

/// Retained host copies of one phase's edge splits.
#[derive(Debug, Clone)]
pub(crate) struct PhaseEdges {
    pub contexts: BTreeMap<ContextId, RelationEdgeMap>,
    pub meta: RelationEdgeMap,
}

pub struct TrainingSession {
    pub(crate) config: TrainConfig,
    pub(crate) registry: DatasetRegistry,
    pub(crate) splitter: EdgeSplitter,
    pub(crate) model: RelationalModel,
    optimizer: AdamW,
    center_loss: Option<CenterLoss>,
    pub(crate) selector: BestModelSelector,
    masks: BTreeMap<ContextId, NodeMasks>,
    history: TrainingHistory,
    /// Latest host copy of the train/val edge splits, refreshed each
    /// epoch and consumed by the finalizer.
    pub(crate) train_edges: Option<PhaseEdges>,
    pub(crate) val_edges: Option<PhaseEdges>,
}

impl TrainingSession {
    pub fn new(
        registry: DatasetRegistry,
        config: TrainConfig,
        device: &Device,
    ) -> TrainResult<Self> {
        config.validate()?;
        let hp = &config.hyperparams;
        let model = RelationalModel::from_registry(&registry, hp, device, config.seed)?;

        let center_loss = if hp.use_center_loss && registry.num_classes() > 0 {
            Some(CenterLoss::new(
                registry.num_classes(),
                hp.output,
                device,
                config.seed,
            )?)
        } else {
            None
        };

        let mut vars = model.trainable_vars();
        if let Some(cl) = &center_loss {
            vars.push(cl.centers_var());
        }
        let optimizer = AdamW::for_vars(
            AdamWConfig {
                lr: hp.lr,
                weight_decay: hp.weight_decay,
                ..Default::default()
            },
            vars,
        )?;

        std::fs::create_dir_all(&config.output_dir)?;
        let selector = BestModelSelector::new(config.eps)
            .with_save_path(config.output_dir.join("best_model.safetensors"));

        let masks = registry.node_masks(config.seed, config.train_frac, config.val_frac);
        let splitter = EdgeSplitter::new(config.seed, config.train_frac, config.val_frac);

        Ok(Self {
            config,
            registry,
            splitter,
            model,
            optimizer,
            center_loss,
            selector,
            masks,
            history: TrainingHistory::default(),
            train_edges: None,
            val_edges: None,
        })
    }

    /// Load a saved snapshot and restore it into the live model, so a run
    /// continues from previously trained parameters. A snapshot whose
    /// shapes do not match the current architecture fails here, before any
    /// epoch runs.
    pub fn resume_from(&mut self, path: impl AsRef<std::path::Path>) -> TrainResult<()> {
        let snapshot = ParamSnapshot::load(&path)?;
        self.model.restore(&snapshot)?;
        tracing::info!(path = %path.as_ref().display(), "resumed model parameters");
        Ok(())
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn model(&self) -> &RelationalModel {
        &self.model
    }

    pub fn best_score(&self) -> f64 {
        self.selector.best_score()
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.selector.best_epoch()
    }

    fn phase_batch(&self, phase: Phase, epoch: usize) -> TrainResult<(PhaseBatch, GraphBatch)> {
        let device = self.model.device().clone();
        let contexts = generate_batch(
            self.registry.contexts(),
            self.registry.relations(),
            &self.splitter,
            phase,
            self.config.batch_size,
            &device,
            self.config.loader,
            self.config.seed.wrapping_add(epoch as u64),
        )?;
        let meta = generate_meta_batch(
            self.registry.meta(),
            self.registry.meta_relations(),
            &self.splitter,
            phase,
            &device,
        )?;
        Ok((contexts, meta))
    }

    /// Joint link loss over every relation of every graph in the batch:
    /// binary cross entropy with positives labeled 1 and sampled negatives
    /// labeled 0. None when the batch carries no edges at all.
    fn link_loss(
        &self,
        contexts: &PhaseBatch,
        meta: &GraphBatch,
        embeddings: &BTreeMap<ContextId, Tensor>,
        meta_embeddings: &Tensor,
    ) -> TrainResult<Option<Tensor>> {
        let device = self.model.device().clone();
        let mut logit_parts: Vec<Tensor> = Vec::new();
        let mut target_parts: Vec<Tensor> = Vec::new();

        let mut push_edges =
            |emb: &Tensor, edges: &RelationEdgeMap| -> TrainResult<()> {
                for relation_edges in edges.values() {
                    for (edge_index, label) in
                        [(&relation_edges.pos, 1.0f64), (&relation_edges.neg, 0.0)]
                    {
                        let count = edge_index.dims()[1];
                        if count == 0 {
                            continue;
                        }
                        logit_parts.push(self.model.score(emb, edge_index)?);
                        let targets = Tensor::full(label, count, &device)
                            .and_then(|t| t.to_dtype(DType::F32))
                            .map_err(|e| TrainError::tensor("loss targets", e))?;
                        target_parts.push(targets);
                    }
                }
                Ok(())
            };

        for (ctx, batch) in &contexts.entries {
            let emb = embeddings.get(ctx).ok_or_else(|| TrainError::InvalidGraph {
                message: format!("{}: missing embeddings in forward output", ctx),
            })?;
            push_edges(emb, &batch.relation_edges)?;
        }
        push_edges(meta_embeddings, &meta.relation_edges)?;

        if logit_parts.is_empty() {
            return Ok(None);
        }
        let logits = Tensor::cat(&logit_parts, 0).map_err(|e| TrainError::tensor("loss cat", e))?;
        let targets =
            Tensor::cat(&target_parts, 0).map_err(|e| TrainError::tensor("target cat", e))?;
        let loss = binary_cross_entropy_with_logit(&logits, &targets)
            .map_err(|e| TrainError::tensor("bce", e))?;
        Ok(Some(loss))
    }

    /// Center-loss term over train-masked nodes, averaged across contexts
    /// that have cluster labels.
    fn center_term(
        &self,
        embeddings: &BTreeMap<ContextId, Tensor>,
        node_maps: &BTreeMap<ContextId, Vec<u32>>,
    ) -> TrainResult<Option<Tensor>> {
        let Some(cl) = &self.center_loss else {
            return Ok(None);
        };
        let mut parts: Vec<Tensor> = Vec::new();
        for (ctx, emb) in embeddings {
            let Some(labels) = self.registry.cluster_labels(*ctx) else {
                continue;
            };
            let Some(masks) = self.masks.get(ctx) else {
                continue;
            };
            let nodes = node_maps.get(ctx).ok_or_else(|| TrainError::InvalidGraph {
                message: format!("{}: missing node map for minibatch", ctx),
            })?;
            let sub_labels: Vec<u32> = nodes.iter().map(|&n| labels[n as usize]).collect();
            let sub_mask: Vec<bool> = nodes.iter().map(|&n| masks.train[n as usize]).collect();
            if let Some(term) = cl.compute(emb, &sub_labels, &sub_mask)? {
                parts.push(term);
            }
        }
        if parts.is_empty() {
            return Ok(None);
        }
        let stacked =
            Tensor::stack(&parts, 0).map_err(|e| TrainError::tensor("center stack", e))?;
        let mean = stacked
            .mean_all()
            .map_err(|e| TrainError::tensor("center mean", e))?;
        Ok(Some(mean))
    }

    /// Run one epoch: optimize over train minibatches, evaluate train and
    /// val metrics, update the best-model selector, append to history.
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        sink: &mut dyn MetricsSink,
    ) -> TrainResult<&EpochRecord> {
        let (train_batch, train_meta) = self.phase_batch(Phase::Train, epoch)?;

        let mut loss_sum = 0.0f64;
        let mut steps = 0usize;
        for i in 0..train_batch.num_minibatches() {
            let (minibatch, node_maps) = train_batch.restrict(i)?;
            let output = self.model.forward(&minibatch, &train_meta, true)?;

            let Some(link) = self.link_loss(
                &minibatch,
                &train_meta,
                &output.context_embeddings,
                &output.meta_embeddings,
            )?
            else {
                continue;
            };
            let total = match self.center_term(&output.context_embeddings, &node_maps)? {
                Some(center) => {
                    let weighted = center
                        .affine(self.config.hyperparams.lambda_center, 0.0)
                        .map_err(|e| TrainError::tensor("center weight", e))?;
                    (link + weighted).map_err(|e| TrainError::tensor("loss sum", e))?
                }
                None => link,
            };

            self.optimizer.step(&total)?;
            loss_sum += total
                .detach()
                .to_scalar::<f32>()
                .map_err(|e| TrainError::tensor("loss scalar", e))? as f64;
            steps += 1;
        }
        let train_loss = if steps > 0 { loss_sum / steps as f64 } else { f64::NAN };

        // Retain host copies for the finalizer's edge unions.
        self.train_edges = Some(PhaseEdges {
            contexts: train_batch.detach_edges_to_host()?,
            meta: detach_graph_edges(&train_meta)?,
        });

        // Train metrics from an inference pass over the full train batch.
        let train_preds = predict(
            &self.model,
            &train_batch,
            &train_meta,
            &train_batch,
            &train_meta,
        )?;
        let (train_summary, train_per_context) = summarize(&train_preds);

        // Validation: message passing over train edges, scoring val pairs.
        let (val_batch, val_meta) = self.phase_batch(Phase::Val, epoch)?;
        let val_preds = predict(&self.model, &train_batch, &train_meta, &val_batch, &val_meta)?;
        let (val_summary, val_per_context) = summarize(&val_preds);
        self.val_edges = Some(PhaseEdges {
            contexts: val_batch.detach_edges_to_host()?,
            meta: detach_graph_edges(&val_meta)?,
        });

        // Unsupervised clustering quality of this epoch's validation
        // embeddings, reported alongside the link metrics.
        let val_clustering = self.clustering_metrics(&val_preds.output.context_embeddings)?;

        let val_score = mean_graph_accuracy(&val_preds).unwrap_or(f64::NAN);
        let improved = self.selector.observe(epoch, val_score, &self.model)?;

        sink.report_epoch(epoch, "train", &train_summary, &train_per_context);
        sink.report_epoch(epoch, "val", &val_summary, &val_per_context);
        sink.report_clustering(&val_clustering);
        tracing::info!(
            epoch,
            train_loss,
            val_score,
            improved,
            best = self.selector.best_score(),
            "epoch complete"
        );

        self.history.epochs.push(EpochRecord {
            epoch,
            train_loss,
            train: train_summary,
            val: val_summary,
            val_clustering,
            val_score,
            improved,
        });
        Ok(self.history.epochs.last().unwrap())
    }

    /// Train for the configured number of epochs.
    pub fn run(&mut self, sink: &mut dyn MetricsSink) -> TrainResult<&TrainingHistory> {
        for epoch in 0..self.config.epochs {
            self.train_epoch(epoch, sink)?;
        }
        Ok(&self.history)
    }
}

pub(crate) fn detach_graph_edges(batch: &GraphBatch) -> TrainResult<RelationEdgeMap> {
    let mut out = RelationEdgeMap::new();
    for (&rel, edges) in &batch.relation_edges {
        out.insert(rel, edges.detach_to_host()?);
    }
    Ok(out)
}

/// Concat summary plus per-context, per-relation breakdown.
pub(crate) fn summarize(
    preds: &PhasePredictions,
) -> (LinkMetrics, BTreeMap<ContextId, BTreeMap<RelationId, LinkMetrics>>) {
    let mut all_pos: Vec<f32> = Vec::new();
    let mut all_neg: Vec<f32> = Vec::new();
    let mut per_context = BTreeMap::new();
    for (&ctx, per_rel) in &preds.context_scores {
        let mut breakdown = BTreeMap::new();
        for (&rel, scores) in per_rel {
            all_pos.extend_from_slice(&scores.pos);
            all_neg.extend_from_slice(&scores.neg);
            breakdown.insert(rel, LinkMetrics::compute(&scores.pos, &scores.neg));
        }
        per_context.insert(ctx, breakdown);
    }
    for scores in preds.meta_scores.values() {
        all_pos.extend_from_slice(&scores.pos);
        all_neg.extend_from_slice(&scores.neg);
    }
    (LinkMetrics::compute(&all_pos, &all_neg), per_context)
}

/// Mean accuracy across graphs: one summary per context plus one for the
/// meta graph, NaN entries skipped.
pub(crate) fn mean_graph_accuracy(preds: &PhasePredictions) -> Option<f64> {
    let mut summaries: Vec<LinkMetrics> = Vec::new();
    for per_rel in preds.context_scores.values() {
        let mut pos = Vec::new();
        let mut neg = Vec::new();
        for scores in per_rel.values() {
            pos.extend_from_slice(&scores.pos);
            neg.extend_from_slice(&scores.neg);
        }
        summaries.push(LinkMetrics::compute(&pos, &neg));
    }
    let mut meta_pos = Vec::new();
    let mut meta_neg = Vec::new();
    for scores in preds.meta_scores.values() {
        meta_pos.extend_from_slice(&scores.pos);
        meta_neg.extend_from_slice(&scores.neg);
    }
    summaries.push(LinkMetrics::compute(&meta_pos, &meta_neg));
    LinkMetrics::mean_accuracy(summaries.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingSink;
    use crate::testutil::{toy_config, toy_registry};

    fn session() -> (tempfile::TempDir, TrainingSession) {
        let mut config = toy_config();
        let dir = tempfile::tempdir().unwrap();
        config.output_dir = dir.path().join("run");
        let session = TrainingSession::new(toy_registry(), config, &Device::Cpu).unwrap();
        (dir, session)
    }

    #[test]
    fn test_epoch_advances_optimizer_and_history() {
        let (_dir, mut session) = session();
        let mut sink = RecordingSink::default();
        let record = session.train_epoch(0, &mut sink).unwrap();
        assert_eq!(record.epoch, 0);
        assert!(record.train_loss.is_finite());
        assert!(session.optimizer.global_step() > 0);
        assert_eq!(session.history().epochs.len(), 1);
        // Both phases reported.
        assert_eq!(sink.epochs.len(), 2);
    }

    #[test]
    fn test_first_epoch_sets_best_model() {
        let (_dir, mut session) = session();
        let mut sink = RecordingSink::default();
        let record = session.train_epoch(0, &mut sink).unwrap();
        assert!(record.improved, "first finite score must be accepted");
        assert!(session.selector.best_snapshot().is_some());
    }

    #[test]
    fn test_edge_accumulators_hold_host_copies() {
        let (_dir, mut session) = session();
        let mut sink = RecordingSink::default();
        session.train_epoch(0, &mut sink).unwrap();
        let train = session.train_edges.as_ref().unwrap();
        let val = session.val_edges.as_ref().unwrap();
        assert_eq!(train.contexts.len(), 2);
        assert_eq!(val.contexts.len(), 2);
        for edges in train.contexts.values().flat_map(|m| m.values()) {
            assert!(edges.pos.device().is_cpu());
        }
        assert!(!train.meta.is_empty());
    }

    #[test]
    fn test_run_trains_all_epochs() {
        let (_dir, mut session) = session();
        let mut sink = RecordingSink::default();
        let history = session.run(&mut sink).unwrap();
        assert_eq!(history.epochs.len(), 2);
    }

    #[test]
    fn test_resume_restores_saved_parameters() {
        let (_dir, mut session) = session();
        let mut sink = RecordingSink::default();
        session.train_epoch(0, &mut sink).unwrap();
        let path = session.config.output_dir.join("best_model.safetensors");

        let mut config = toy_config();
        let dir2 = tempfile::tempdir().unwrap();
        config.output_dir = dir2.path().join("run");
        let mut fresh = TrainingSession::new(toy_registry(), config, &Device::Cpu).unwrap();
        fresh.resume_from(&path).unwrap();

        let best = session.selector.best_snapshot().unwrap();
        let resumed = fresh.model.snapshot().unwrap();
        assert_eq!(
            best.get("couple").unwrap().to_vec2::<f32>().unwrap(),
            resumed.get("couple").unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_resume_with_mismatched_dims_fails_before_training() {
        let (_dir, mut session) = session();
        let mut sink = RecordingSink::default();
        session.train_epoch(0, &mut sink).unwrap();
        let path = session.config.output_dir.join("best_model.safetensors");

        let mut config = toy_config();
        config.hyperparams.hidden = 16;
        config.hyperparams.output = 6;
        let dir2 = tempfile::tempdir().unwrap();
        config.output_dir = dir2.path().join("run");
        let mut wider = TrainingSession::new(toy_registry(), config, &Device::Cpu).unwrap();
        let err = wider.resume_from(&path);
        assert!(matches!(err, Err(TrainError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_center_loss_session_trains() {
        let mut config = toy_config();
        config.hyperparams.use_center_loss = true;
        let dir = tempfile::tempdir().unwrap();
        config.output_dir = dir.path().join("run");
        let mut session = TrainingSession::new(toy_registry(), config, &Device::Cpu).unwrap();
        let mut sink = RecordingSink::default();
        let record = session.train_epoch(0, &mut sink).unwrap();
        assert!(record.train_loss.is_finite());
    }
}
