//! Auxiliary center loss pulling same-cluster nodes together.
//!
//! Holds one trainable center per cluster class. The loss is the mean
//! squared distance between each selected node's embedding and its
//! class center. Centers are ordinary parameters; register them with the
//! optimizer alongside the model's.

use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{TrainError, TrainResult};
use crate::model::glorot_var;

pub struct CenterLoss {
    centers: Var,
    num_classes: usize,
}

impl CenterLoss {
    pub fn new(num_classes: usize, dim: usize, device: &Device, seed: u64) -> TrainResult<Self> {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5F5F_5F5F);
        let centers = glorot_var(&mut rng, num_classes.max(1), dim, device)?;
        Ok(Self {
            centers,
            num_classes,
        })
    }

    /// Handle to the trainable centers, for optimizer registration.
    pub fn centers_var(&self) -> Var {
        self.centers.clone()
    }

    /// Mean squared embedding-to-center distance over the rows where
    /// `mask` is set. `labels` and `mask` are row-aligned with
    /// `embeddings`. Returns None when no row is selected, so callers can
    /// skip the term instead of backpropagating through nothing.
    pub fn compute(
        &self,
        embeddings: &Tensor,
        labels: &[u32],
        mask: &[bool],
    ) -> TrainResult<Option<Tensor>> {
        let selected: Vec<(u32, u32)> = labels
            .iter()
            .zip(mask.iter())
            .enumerate()
            .filter(|(_, (_, &m))| m)
            .map(|(row, (&label, _))| (row as u32, label))
            .collect();
        if selected.is_empty() {
            return Ok(None);
        }
        for &(_, label) in &selected {
            if label as usize >= self.num_classes {
                return Err(TrainError::InvalidGraph {
                    message: format!(
                        "cluster label {} out of range ({} classes)",
                        label, self.num_classes
                    ),
                });
            }
        }

        let device = embeddings.device();
        let rows: Vec<u32> = selected.iter().map(|&(r, _)| r).collect();
        let classes: Vec<u32> = selected.iter().map(|&(_, c)| c).collect();
        let row_index = Tensor::from_vec(rows, selected.len(), device)
            .map_err(|e| TrainError::tensor("center row index", e))?;
        let class_index = Tensor::from_vec(classes, selected.len(), device)
            .map_err(|e| TrainError::tensor("center class index", e))?;

        let picked = embeddings
            .index_select(&row_index, 0)
            .map_err(|e| TrainError::tensor("center embedding gather", e))?;
        let targets = self
            .centers
            .as_tensor()
            .index_select(&class_index, 0)
            .map_err(|e| TrainError::tensor("center target gather", e))?;
        let loss = (picked - targets)
            .and_then(|d| d.sqr())
            .and_then(|d| d.mean_all())
            .map_err(|e| TrainError::tensor("center loss", e))?;
        Ok(Some(loss))
    }
}
