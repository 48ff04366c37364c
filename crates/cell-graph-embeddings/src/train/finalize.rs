//! End-of-run finalization: best-model restore, test evaluation, and
//! full-graph embedding export.
//!
//! Test scoring propagates messages over the union of the train and val
//! edge splits, so the evaluated model sees every edge that was available
//! during model selection but none of the held-out test pairs. The
//! exported embeddings come from a separate pass over the complete edge
//! set. Everything here runs on the host.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::batch::{
    generate_batch, generate_meta_batch, BatchLoader, GraphBatch, PhaseBatch, RelationEdgeMap,
};
use crate::config::LoaderKind;
use crate::data::{ContextId, RelationId};
use crate::error::{TrainError, TrainResult};
use crate::metrics::{ClusteringMetrics, LinkMetrics, MetricsSink};
use crate::model::SharedModel;
use crate::persist;
use crate::split::Phase;
use crate::train::predict::predict;
use crate::train::session::{
    detach_graph_edges, summarize, PhaseEdges, TrainingSession,
};

/// Everything the finalizer produces, already persisted to the output
/// directory.
#[derive(Debug)]
pub struct RunArtifacts {
    pub test: LinkMetrics,
    pub test_per_context: BTreeMap<ContextId, BTreeMap<RelationId, LinkMetrics>>,
    pub clustering: ClusteringMetrics,
    /// Host-resident final embeddings, one matrix per context.
    pub context_embeddings: BTreeMap<ContextId, Tensor>,
    pub meta_embeddings: Tensor,
    pub best_epoch: Option<usize>,
    pub best_score: f64,
}

impl TrainingSession {
    /// Host copies of one phase's edge splits: the accumulator when an
    /// epoch has populated it, a fresh deterministic split otherwise.
    fn host_edges(&self, phase: Phase) -> TrainResult<PhaseEdges> {
        let accumulated = match phase {
            Phase::Train => self.train_edges.clone(),
            Phase::Val => self.val_edges.clone(),
            _ => None,
        };
        if let Some(edges) = accumulated {
            return Ok(edges);
        }
        let contexts = generate_batch(
            self.registry.contexts(),
            self.registry.relations(),
            &self.splitter,
            phase,
            self.config.batch_size,
            &Device::Cpu,
            LoaderKind::FullGraph,
            self.config.seed,
        )?;
        let meta = generate_meta_batch(
            self.registry.meta(),
            self.registry.meta_relations(),
            &self.splitter,
            phase,
            &Device::Cpu,
        )?;
        Ok(PhaseEdges {
            contexts: contexts.detach_edges_to_host()?,
            meta: detach_graph_edges(&meta)?,
        })
    }

    /// Message batches over the train ∪ val edge union, host-resident.
    fn union_batches(&self) -> TrainResult<(PhaseBatch, GraphBatch)> {
        let train = self.host_edges(Phase::Train)?;
        let val = self.host_edges(Phase::Val)?;

        let union_map = |a: &RelationEdgeMap, b: &RelationEdgeMap| -> TrainResult<RelationEdgeMap> {
            let mut out = RelationEdgeMap::new();
            for (&rel, t) in a {
                let joined = match b.get(&rel) {
                    Some(v) => t.concat(v)?,
                    None => t.clone(),
                };
                out.insert(rel, joined);
            }
            Ok(out)
        };

        let mut entries = BTreeMap::new();
        for (&ctx, graph) in self.registry.contexts() {
            let empty = RelationEdgeMap::new();
            let t = train.contexts.get(&ctx).unwrap_or(&empty);
            let v = val.contexts.get(&ctx).unwrap_or(&empty);
            entries.insert(
                ctx,
                GraphBatch {
                    loader: BatchLoader::Full,
                    features: graph.features().clone(),
                    relation_edges: union_map(t, v)?,
                },
            );
        }
        let meta = GraphBatch {
            loader: BatchLoader::Full,
            features: self.registry.meta().features().clone(),
            relation_edges: union_map(&train.meta, &val.meta)?,
        };
        Ok((PhaseBatch { entries }, meta))
    }

    fn full_phase_batches(&self, phase: Phase) -> TrainResult<(PhaseBatch, GraphBatch)> {
        let contexts = generate_batch(
            self.registry.contexts(),
            self.registry.relations(),
            &self.splitter,
            phase,
            self.config.batch_size,
            &Device::Cpu,
            LoaderKind::FullGraph,
            self.config.seed,
        )?;
        let meta = generate_meta_batch(
            self.registry.meta(),
            self.registry.meta_relations(),
            &self.splitter,
            phase,
            &Device::Cpu,
        )?;
        Ok((contexts, meta))
    }

    /// Restore the best model, evaluate on the test split, export the
    /// final full-graph embeddings, and persist all artifacts.
    pub fn finalize(&mut self, sink: &mut dyn MetricsSink) -> TrainResult<RunArtifacts> {
        match self.selector.best_snapshot().cloned() {
            Some(snapshot) => self.model.restore(&snapshot)?,
            None => {
                tracing::warn!("no best model was recorded, finalizing live parameters");
            }
        }
        self.model.to_device(&Device::Cpu)?;

        // Test evaluation: union message edges, test-split scored pairs.
        let (union_contexts, union_meta) = self.union_batches()?;
        let (test_contexts, test_meta) = self.full_phase_batches(Phase::Test)?;
        let preds = predict(
            &self.model,
            &union_contexts,
            &union_meta,
            &test_contexts,
            &test_meta,
        )?;
        let (test_summary, test_per_context) = summarize(&preds);
        sink.report_epoch(self.config.epochs, "test", &test_summary, &test_per_context);

        // Final embeddings: one deterministic pass over the complete edge
        // set of every graph.
        let (all_contexts, all_meta) = self.full_phase_batches(Phase::All)?;
        let output = self.model.forward(&all_contexts, &all_meta, false)?;
        let mut context_embeddings = BTreeMap::new();
        for (ctx, emb) in output.context_embeddings {
            context_embeddings.insert(ctx, emb.detach());
        }
        let meta_embeddings = output.meta_embeddings.detach();

        let clustering = self.clustering_metrics(&context_embeddings)?;
        sink.report_clustering(&clustering);

        self.persist_artifacts(&context_embeddings, &meta_embeddings, &test_summary, &clustering)?;

        Ok(RunArtifacts {
            test: test_summary,
            test_per_context,
            clustering,
            context_embeddings,
            meta_embeddings,
            best_epoch: self.selector.best_epoch(),
            best_score: self.selector.best_score(),
        })
    }

    /// Clustering over the concatenated context embeddings. Cluster labels
    /// are used when every context carries them; otherwise each node is
    /// labeled with its context so the metric measures context separation.
    pub(crate) fn clustering_metrics(
        &self,
        embeddings: &BTreeMap<ContextId, Tensor>,
    ) -> TrainResult<ClusteringMetrics> {
        let have_labels = self
            .registry
            .contexts()
            .keys()
            .all(|ctx| self.registry.cluster_labels(*ctx).is_some());

        let mut rows: Vec<Vec<f32>> = Vec::new();
        let mut labels: Vec<u32> = Vec::new();
        for (&ctx, emb) in embeddings {
            let host_rows = emb
                .to_vec2::<f32>()
                .map_err(|e| TrainError::tensor("embedding host copy", e))?;
            for (node, row) in host_rows.into_iter().enumerate() {
                rows.push(row);
                if have_labels {
                    labels.push(self.registry.cluster_labels(ctx).unwrap()[node]);
                } else {
                    labels.push(ctx.0);
                }
            }
        }
        Ok(ClusteringMetrics::compute(&rows, &labels))
    }

    fn persist_artifacts(
        &self,
        context_embeddings: &BTreeMap<ContextId, Tensor>,
        meta_embeddings: &Tensor,
        test: &LinkMetrics,
        clustering: &ClusteringMetrics,
    ) -> TrainResult<()> {
        let dir = &self.config.output_dir;
        std::fs::create_dir_all(dir)?;
        persist::save_embeddings(
            dir.join("embeddings.safetensors"),
            context_embeddings,
            meta_embeddings,
        )?;
        persist::save_history(dir.join("history.json"), self.history())?;
        persist::save_metrics_log(dir.join("metrics.log"), self.history(), test, clustering)?;

        let mut labels = BTreeMap::new();
        for &ctx in self.registry.contexts().keys() {
            if let Some(l) = self.registry.cluster_labels(ctx) {
                labels.insert(self.registry.context_name(ctx).to_string(), l.to_vec());
            }
        }
        if !labels.is_empty() {
            persist::save_labels(dir.join("labels.json"), &labels)?;
        }
        tracing::info!(dir = %dir.display(), "run artifacts written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RecordingSink;
    use crate::testutil::{toy_config, toy_registry};

    fn trained_session() -> (tempfile::TempDir, TrainingSession) {
        let mut config = toy_config();
        let dir = tempfile::tempdir().unwrap();
        config.output_dir = dir.path().join("run");
        let mut session = TrainingSession::new(toy_registry(), config, &Device::Cpu).unwrap();
        let mut sink = RecordingSink::default();
        session.run(&mut sink).unwrap();
        (dir, session)
    }

    #[test]
    fn test_finalize_exports_full_embeddings() {
        let (_dir, mut session) = trained_session();
        let mut sink = RecordingSink::default();
        let artifacts = session.finalize(&mut sink).unwrap();
        assert_eq!(artifacts.context_embeddings.len(), 2);
        assert_eq!(artifacts.context_embeddings[&ContextId(0)].dims(), &[6, 4]);
        assert_eq!(artifacts.meta_embeddings.dims(), &[3, 4]);
        assert!(artifacts.best_epoch.is_some());
        assert_eq!(sink.clustering.len(), 1);
    }

    #[test]
    fn test_finalize_writes_artifacts() {
        let (_dir, mut session) = trained_session();
        let out = session.config.output_dir.clone();
        let mut sink = RecordingSink::default();
        session.finalize(&mut sink).unwrap();
        assert!(out.join("embeddings.safetensors").exists());
        assert!(out.join("history.json").exists());
        assert!(out.join("metrics.log").exists());
        assert!(out.join("labels.json").exists());
    }

    #[test]
    fn test_finalize_without_training_falls_back_to_live_model() {
        let mut config = toy_config();
        let dir = tempfile::tempdir().unwrap();
        config.output_dir = dir.path().join("run");
        let mut session = TrainingSession::new(toy_registry(), config, &Device::Cpu).unwrap();
        let mut sink = RecordingSink::default();
        let artifacts = session.finalize(&mut sink).unwrap();
        assert!(artifacts.best_epoch.is_none());
        assert_eq!(artifacts.context_embeddings.len(), 2);
    }

    #[test]
    fn test_union_message_edges_cover_train_and_val() {
        let (_dir, session) = trained_session();
        let (union_contexts, _) = session.union_batches().unwrap();
        let train = session.train_edges.as_ref().unwrap();
        let val = session.val_edges.as_ref().unwrap();
        for (ctx, batch) in &union_contexts.entries {
            for (rel, edges) in &batch.relation_edges {
                let t = train.contexts[ctx][rel].num_pos();
                let v = val.contexts[ctx][rel].num_pos();
                assert_eq!(edges.num_pos(), t + v);
            }
        }
    }
}
