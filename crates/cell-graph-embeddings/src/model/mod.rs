//! Model abstraction shared by every context.
//!
//! One parameter set serves the whole collection: the same weights run
//! over every context graph and over the meta graph, so gradients from all
//! graphs land in shared state. [`SharedModel`] is the seam the training
//! session, prediction driver and finalizer talk to; [`RelationalModel`]
//! is the concrete per-relation message-passing implementation.

mod relational;
mod snapshot;

use std::collections::BTreeMap;

use candle_core::{Device, Tensor, Var};

use crate::batch::{GraphBatch, PhaseBatch};
use crate::data::ContextId;
use crate::error::TrainResult;

pub use relational::RelationalModel;
pub(crate) use relational::glorot_var;
pub use snapshot::ParamSnapshot;

/// Output of one forward pass: per-context node embeddings plus the meta
/// graph's node embeddings, all on the model's device and carrying
/// gradients when produced in training mode.
#[derive(Debug)]
pub struct ModelOutput {
    pub context_embeddings: BTreeMap<ContextId, Tensor>,
    pub meta_embeddings: Tensor,
}

/// The shared-parameter model seam.
///
/// `forward` consumes whole phase batches so one pass couples the context
/// collection and the meta graph; `score` turns embeddings plus a 2 x E
/// edge index into per-edge logits. Snapshot and restore are value
/// transfers of parameter state, independent of device.
pub trait SharedModel {
    /// Run the model over every context graph and the meta graph. Message
    /// passing uses the positive edges carried by the batches. `training`
    /// enables dropout.
    fn forward(
        &self,
        contexts: &PhaseBatch,
        meta: &GraphBatch,
        training: bool,
    ) -> TrainResult<ModelOutput>;

    /// Per-edge logits: dot product of source and destination embeddings.
    /// An empty edge index yields an empty logit tensor.
    fn score(&self, embeddings: &Tensor, edges: &Tensor) -> TrainResult<Tensor>;

    /// Handles to every trainable parameter, for the optimizer.
    fn trainable_vars(&self) -> Vec<Var>;

    /// Detached host copy of all parameter values.
    fn snapshot(&self) -> TrainResult<ParamSnapshot>;

    /// Overwrite parameter values from a snapshot, placing them on the
    /// model's current device. Fails on any shape mismatch.
    fn restore(&mut self, snapshot: &ParamSnapshot) -> TrainResult<()>;

    /// Move all parameters to `device`. Optimizer state built from the old
    /// handles is invalidated; rebuild the optimizer afterwards.
    fn to_device(&mut self, device: &Device) -> TrainResult<()>;

    /// Device the parameters currently live on.
    fn device(&self) -> &Device;
}
