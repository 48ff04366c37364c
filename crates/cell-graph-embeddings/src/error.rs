//! Error type for the training pipeline.
//!
//! Every fallible operation in this crate returns [`TrainResult`]. Tensor
//! failures from candle are wrapped with enough context to locate the
//! failing stage. Invalid state fails fast; nothing is silently defaulted.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type TrainResult<T> = Result<T, TrainError>;

/// Failures surfaced by the training pipeline.
#[derive(Debug, Error)]
pub enum TrainError {
    /// A tensor operation failed on the compute backend.
    #[error("tensor error: {message}")]
    Tensor { message: String },

    /// A tensor was on the wrong device for the operation at hand.
    /// Always fatal: mixing devices would silently corrupt gradients.
    #[error("device mismatch: {message}")]
    DeviceMismatch { message: String },

    /// A graph failed construction-time validation.
    #[error("invalid graph: {message}")]
    InvalidGraph { message: String },

    /// A persisted snapshot does not match the current model parameters.
    #[error("snapshot shape mismatch for '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Snapshot persistence or restoration failed.
    #[error("checkpoint error: {message}")]
    Checkpoint { message: String },

    /// Configuration was missing, unreadable, or inconsistent.
    #[error("config error: {message}")]
    Config { message: String },

    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainError {
    /// Wrap a candle error with a stage label.
    pub fn tensor(stage: &str, e: candle_core::Error) -> Self {
        TrainError::Tensor {
            message: format!("{}: {}", stage, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_mismatch_display() {
        let err = TrainError::ShapeMismatch {
            name: "w_out".into(),
            expected: vec![16, 8],
            actual: vec![16, 4],
        };
        let msg = format!("{}", err);
        assert!(msg.contains("w_out"));
        assert!(msg.contains("[16, 8]"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TrainError = io.into();
        assert!(format!("{}", err).contains("missing"));
    }
}
