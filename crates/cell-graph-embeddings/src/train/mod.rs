//! Training loop, optimization, model selection and finalization.

mod center_loss;
mod checkpoint;
mod finalize;
mod optimizer;
mod predict;
mod session;

pub use center_loss::CenterLoss;
pub use checkpoint::BestModelSelector;
pub use finalize::RunArtifacts;
pub use optimizer::{AdamW, AdamWConfig};
pub use predict::{predict, PhasePredictions, RelationScores};
pub use session::{EpochRecord, TrainingHistory, TrainingSession};
