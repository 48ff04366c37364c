//! Configuration for the training session.
//!
//! Two layers: [`Hyperparams`] covers the model and objective, and
//! [`TrainConfig`] covers the orchestration (epochs, batching, splits,
//! output locations). Both deserialize from one TOML file:
//!
//! ```toml
//! epochs = 50
//! batch_size = 64
//! seed = 3
//! output_dir = "runs/liver"
//!
//! [loader]
//! kind = "neighbor"
//! num_neighbors = 10
//!
//! [hyperparams]
//! hidden = 64
//! output = 32
//! lr = 0.001
//! ```
//!
//! Invalid config returns an error at load time, never a silent default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// Model and objective hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hyperparams {
    /// Hidden layer width.
    #[serde(default = "default_hidden")]
    pub hidden: usize,
    /// Output embedding dimensionality.
    #[serde(default = "default_output")]
    pub output: usize,
    /// Dropout probability applied in training mode.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Decoupled weight decay coefficient.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Weight of the center loss term in the combined objective.
    #[serde(default = "default_lambda_center")]
    pub lambda_center: f64,
    /// Whether the auxiliary center loss is active at all.
    #[serde(default)]
    pub use_center_loss: bool,
}

fn default_hidden() -> usize {
    64
}
fn default_output() -> usize {
    32
}
fn default_dropout() -> f32 {
    0.2
}
fn default_lr() -> f64 {
    1e-3
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_lambda_center() -> f64 {
    0.1
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            output: default_output(),
            dropout: default_dropout(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            lambda_center: default_lambda_center(),
            use_center_loss: false,
        }
    }
}

/// Batching strategy for the per-context graphs.
///
/// The meta graph is always processed full-batch; neighbor sampling only
/// applies to the context collection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoaderKind {
    /// Whole graph per step, no subsampling.
    FullGraph,
    /// Seeded one-hop neighbor sampling around batches of seed nodes.
    Neighbor {
        /// Neighbors drawn per seed node.
        num_neighbors: usize,
    },
}

impl Default for LoaderKind {
    fn default() -> Self {
        LoaderKind::FullGraph
    }
}

/// Orchestration configuration for a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Seed-node batch size for neighbor-sampled loaders.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batching strategy for the context graphs.
    #[serde(default)]
    pub loader: LoaderKind,
    /// Run seed; every stochastic component derives its stream from this.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Tolerance for the best-model rule: near-ties count as improvements.
    #[serde(default = "default_eps")]
    pub eps: f64,
    /// Fraction of each relation's positive edges assigned to train.
    #[serde(default = "default_train_frac")]
    pub train_frac: f32,
    /// Fraction assigned to validation; the remainder is test.
    #[serde(default = "default_val_frac")]
    pub val_frac: f32,
    /// Directory for checkpoints, embeddings and the metrics log.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Model and objective hyperparameters.
    #[serde(default)]
    pub hyperparams: Hyperparams,
}

fn default_epochs() -> usize {
    100
}
fn default_batch_size() -> usize {
    64
}
fn default_seed() -> u64 {
    3
}
fn default_eps() -> f64 {
    1e-3
}
fn default_train_frac() -> f32 {
    0.8
}
fn default_val_frac() -> f32 {
    0.1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("runs/default")
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            loader: LoaderKind::default(),
            seed: default_seed(),
            eps: default_eps(),
            train_frac: default_train_frac(),
            val_frac: default_val_frac(),
            output_dir: default_output_dir(),
            hyperparams: Hyperparams::default(),
        }
    }
}

impl TrainConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> TrainResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| TrainError::Config {
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        let config: TrainConfig = toml::from_str(&raw).map_err(|e| TrainError::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency. Called by `from_file`; call directly
    /// when building a config in code.
    pub fn validate(&self) -> TrainResult<()> {
        if self.epochs == 0 {
            return Err(TrainError::Config {
                message: "epochs must be at least 1".into(),
            });
        }
        if self.batch_size == 0 {
            return Err(TrainError::Config {
                message: "batch_size must be at least 1".into(),
            });
        }
        if !(self.train_frac > 0.0 && self.train_frac < 1.0) {
            return Err(TrainError::Config {
                message: format!("train_frac must be in (0, 1), got {}", self.train_frac),
            });
        }
        if self.val_frac < 0.0 || self.train_frac + self.val_frac > 1.0 {
            return Err(TrainError::Config {
                message: format!(
                    "train_frac + val_frac must not exceed 1, got {} + {}",
                    self.train_frac, self.val_frac
                ),
            });
        }
        let hp = &self.hyperparams;
        if hp.hidden == 0 || hp.output == 0 {
            return Err(TrainError::Config {
                message: "hidden and output dimensions must be nonzero".into(),
            });
        }
        if !(0.0..1.0).contains(&hp.dropout) {
            return Err(TrainError::Config {
                message: format!("dropout must be in [0, 1), got {}", hp.dropout),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_fractions() {
        let config = TrainConfig {
            train_frac: 0.9,
            val_frac: 0.2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_epochs() {
        let config = TrainConfig {
            epochs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = TrainConfig {
            loader: LoaderKind::Neighbor { num_neighbors: 10 },
            ..Default::default()
        };
        let raw = toml::to_string(&config).unwrap();
        let parsed: TrainConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.loader, LoaderKind::Neighbor { num_neighbors: 10 });
        assert_eq!(parsed.epochs, config.epochs);
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let parsed: TrainConfig = toml::from_str("epochs = 5\n").unwrap();
        assert_eq!(parsed.epochs, 5);
        assert_eq!(parsed.seed, 3);
        assert_eq!(parsed.loader, LoaderKind::FullGraph);
    }
}
