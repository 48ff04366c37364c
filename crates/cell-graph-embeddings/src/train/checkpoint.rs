//! Best-model tracking across epochs.
//!
//! The selector watches the per-epoch validation score and keeps a frozen
//! parameter snapshot of the best model seen so far. The acceptance rule
//! is tolerant: a score within `eps` of the current best counts as an
//! improvement, so the kept model tracks late near-ties instead of
//! freezing on the first peak.

use std::path::PathBuf;

use crate::error::TrainResult;
use crate::model::{ParamSnapshot, SharedModel};

pub struct BestModelSelector {
    eps: f64,
    best_score: f64,
    best_epoch: Option<usize>,
    best: Option<ParamSnapshot>,
    save_path: Option<PathBuf>,
}

impl BestModelSelector {
    pub fn new(eps: f64) -> Self {
        Self {
            eps,
            best_score: f64::NEG_INFINITY,
            best_epoch: None,
            best: None,
            save_path: None,
        }
    }

    /// Also persist each accepted snapshot to this path. A failed write is
    /// logged and ignored; the in-memory snapshot is the source of truth.
    pub fn with_save_path(mut self, path: PathBuf) -> Self {
        self.save_path = Some(path);
        self
    }

    /// Observe one epoch's validation score. Returns true when the model
    /// was accepted as the new best. NaN scores are skipped.
    pub fn observe(
        &mut self,
        epoch: usize,
        score: f64,
        model: &dyn SharedModel,
    ) -> TrainResult<bool> {
        if score.is_nan() {
            tracing::warn!(epoch, "validation score is NaN, keeping previous best");
            return Ok(false);
        }
        if self.best_score > score + self.eps {
            return Ok(false);
        }

        self.best = Some(model.snapshot()?);
        self.best_score = score;
        self.best_epoch = Some(epoch);
        tracing::info!(epoch, score, "new best model");

        if let Some(path) = &self.save_path {
            if let Some(snap) = &self.best {
                if let Err(e) = snap.save(path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to persist best snapshot"
                    );
                }
            }
        }
        Ok(true)
    }

    pub fn best_snapshot(&self) -> Option<&ParamSnapshot> {
        self.best.as_ref()
    }

    pub fn best_score(&self) -> f64 {
        self.best_score
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}
