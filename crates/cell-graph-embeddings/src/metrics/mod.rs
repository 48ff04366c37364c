//! Evaluation metrics and the reporting seam.
//!
//! Link-prediction metrics operate on host score slices, clustering
//! metrics on host embedding rows. Both are plain functions; degenerate
//! input yields NaN rather than an error so callers can log and move on.

pub mod clustering;
pub mod link;

use std::collections::BTreeMap;

use crate::data::{ContextId, RelationId};

pub use clustering::{calinski_harabasz, davies_bouldin, ClusteringMetrics};
pub use link::{accuracy, average_precision, f1_score, roc_auc, LinkMetrics};

/// Where per-epoch and final metrics get reported.
///
/// The training session emits through this seam so tests can capture
/// reports instead of scraping logs.
pub trait MetricsSink {
    /// Per-epoch report: phase-level summary plus per-relation breakdown
    /// for every context.
    fn report_epoch(
        &mut self,
        epoch: usize,
        phase: &str,
        summary: &LinkMetrics,
        per_context: &BTreeMap<ContextId, BTreeMap<RelationId, LinkMetrics>>,
    );

    /// Final clustering report over the full-graph embeddings.
    fn report_clustering(&mut self, metrics: &ClusteringMetrics);
}

/// Default sink: structured log lines via tracing.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn report_epoch(
        &mut self,
        epoch: usize,
        phase: &str,
        summary: &LinkMetrics,
        per_context: &BTreeMap<ContextId, BTreeMap<RelationId, LinkMetrics>>,
    ) {
        tracing::info!(
            epoch,
            phase,
            auc = summary.auc,
            ap = summary.average_precision,
            acc = summary.accuracy,
            f1 = summary.f1,
            "epoch metrics"
        );
        for (ctx, relations) in per_context {
            for (rel, m) in relations {
                tracing::debug!(
                    epoch,
                    phase,
                    context = %ctx,
                    relation = %rel,
                    auc = m.auc,
                    acc = m.accuracy,
                    "relation metrics"
                );
            }
        }
    }

    fn report_clustering(&mut self, metrics: &ClusteringMetrics) {
        tracing::info!(
            calinski_harabasz = metrics.calinski_harabasz,
            davies_bouldin = metrics.davies_bouldin,
            "clustering metrics"
        );
    }
}

/// Test-friendly sink that records every report.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub epochs: Vec<(usize, String, LinkMetrics)>,
    pub clustering: Vec<ClusteringMetrics>,
}

impl MetricsSink for RecordingSink {
    fn report_epoch(
        &mut self,
        epoch: usize,
        phase: &str,
        summary: &LinkMetrics,
        _per_context: &BTreeMap<ContextId, BTreeMap<RelationId, LinkMetrics>>,
    ) {
        self.epochs.push((epoch, phase.to_string(), summary.clone()));
    }

    fn report_clustering(&mut self, metrics: &ClusteringMetrics) {
        self.clustering.push(metrics.clone());
    }
}
