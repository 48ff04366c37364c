//! Shared-model link-prediction training over a collection of relational
//! graphs.
//!
//! One model's parameters are trained jointly across many per-context
//! graphs plus a single meta graph whose nodes stand for the contexts
//! themselves. Each relation type's edges are split deterministically
//! into train, validation and test sets with matched negative samples;
//! training optimizes binary cross entropy over positive and negative
//! pairs of every relation in both collections, validation drives an
//! epsilon-tolerant best-model selection rule, and finalization exports
//! full-graph embeddings computed by the restored best model.
//!
//! Typical use:
//!
//! ```no_run
//! use candle_core::Device;
//! use cell_graph_embeddings::config::TrainConfig;
//! use cell_graph_embeddings::metrics::TracingSink;
//! use cell_graph_embeddings::train::TrainingSession;
//! # fn registry() -> cell_graph_embeddings::data::DatasetRegistry { unimplemented!() }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrainConfig::from_file("train.toml")?;
//! let mut session = TrainingSession::new(registry(), config, &Device::Cpu)?;
//! let mut sink = TracingSink;
//! session.run(&mut sink)?;
//! let artifacts = session.finalize(&mut sink)?;
//! println!("test auc {:.4}", artifacts.test.auc);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod persist;
pub mod split;
pub mod train;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::TrainConfig;
pub use data::DatasetRegistry;
pub use error::{TrainError, TrainResult};
pub use train::TrainingSession;
