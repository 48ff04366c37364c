//! Input data model: per-context attributed graphs, the meta graph over
//! contexts, and the registry that holds them.

pub(crate) mod graph;
mod registry;

pub use graph::{ContextGraph, ContextId, EdgeList, RelationId};
pub use registry::{DatasetRegistry, NodeMasks};
