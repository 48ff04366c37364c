//! Value-semantics parameter snapshots.
//!
//! A snapshot is a named map of detached host tensors. Capturing one never
//! aliases live parameters, so the training loop can keep updating the
//! model while the best-so-far snapshot stays frozen. Persistence uses the
//! safetensors format.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use candle_core::{Device, Tensor, Var};

use crate::error::{TrainError, TrainResult};

/// Detached host copy of a model's parameter values, keyed by name.
#[derive(Debug, Clone)]
pub struct ParamSnapshot {
    tensors: BTreeMap<String, Tensor>,
}

impl ParamSnapshot {
    /// Copy every named parameter to the host, detached from the graph.
    pub fn capture<'a>(
        params: impl IntoIterator<Item = (&'a str, &'a Var)>,
    ) -> TrainResult<Self> {
        let mut tensors = BTreeMap::new();
        for (name, var) in params {
            let host = var
                .as_tensor()
                .detach()
                .to_device(&Device::Cpu)
                .and_then(|t| t.copy())
                .map_err(|e| TrainError::tensor("snapshot capture", e))?;
            tensors.insert(name.to_string(), host);
        }
        Ok(Self { tensors })
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Write the snapshot's value into each named parameter, placed on
    /// `device`. Every parameter must be present with a matching shape.
    pub fn apply<'a>(
        &self,
        params: impl IntoIterator<Item = (&'a str, &'a Var)>,
        device: &Device,
    ) -> TrainResult<()> {
        for (name, var) in params {
            let stored = self.tensors.get(name).ok_or_else(|| TrainError::Checkpoint {
                message: format!("snapshot missing parameter '{}'", name),
            })?;
            if stored.dims() != var.dims() {
                return Err(TrainError::ShapeMismatch {
                    name: name.to_string(),
                    expected: var.dims().to_vec(),
                    actual: stored.dims().to_vec(),
                });
            }
            let placed = stored
                .to_device(device)
                .map_err(|e| TrainError::tensor("snapshot placement", e))?;
            var.set(&placed)
                .map_err(|e| TrainError::tensor("snapshot apply", e))?;
        }
        Ok(())
    }

    /// Persist to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> TrainResult<()> {
        let map: HashMap<String, Tensor> = self
            .tensors
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        candle_core::safetensors::save(&map, path.as_ref()).map_err(|e| TrainError::Checkpoint {
            message: format!("failed to write {}: {}", path.as_ref().display(), e),
        })
    }

    /// Load a previously saved snapshot onto the host.
    pub fn load(path: impl AsRef<Path>) -> TrainResult<Self> {
        let map = candle_core::safetensors::load(path.as_ref(), &Device::Cpu).map_err(|e| {
            TrainError::Checkpoint {
                message: format!("failed to read {}: {}", path.as_ref().display(), e),
            }
        })?;
        Ok(Self {
            tensors: map.into_iter().collect(),
        })
    }
}
