//! AdamW optimizer for Candle Var tensors.
//!
//! Single parameter group at a constant learning rate, with per-parameter
//! moment estimates, bias correction, gradient clipping and decoupled
//! weight decay. `step` runs the backward pass itself, so the training
//! loop only hands it the loss tensor.

use candle_core::{Tensor, Var};

use crate::error::{TrainError, TrainResult};

/// AdamW optimizer configuration.
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate.
    pub lr: f64,
    /// First moment exponential decay rate.
    pub beta1: f64,
    /// Second moment exponential decay rate.
    pub beta2: f64,
    /// Numerical stability constant.
    pub epsilon: f64,
    /// Decoupled weight decay coefficient.
    pub weight_decay: f64,
    /// Maximum gradient norm for clipping.
    pub max_grad_norm: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 1e-4,
            max_grad_norm: 1.0,
        }
    }
}

/// A tracked parameter with its moment estimates.
struct TrackedParam {
    var: Var,
    /// First moment estimate (mean of gradients).
    m: Tensor,
    /// Second moment estimate (mean of squared gradients).
    v: Tensor,
}

/// AdamW over a set of registered Vars.
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            params: Vec::new(),
            step: 0,
        }
    }

    /// Build an optimizer over a model's trainable variables.
    pub fn for_vars(config: AdamWConfig, vars: Vec<Var>) -> TrainResult<Self> {
        let mut opt = Self::new(config);
        for var in vars {
            opt.add_param(var)?;
        }
        Ok(opt)
    }

    /// Register a trainable parameter.
    pub fn add_param(&mut self, var: Var) -> TrainResult<()> {
        let shape = var.as_tensor().shape().clone();
        let device = var.as_tensor().device().clone();

        let m = Tensor::zeros(&shape, var.as_tensor().dtype(), &device).map_err(map_candle)?;
        let v = Tensor::zeros(&shape, var.as_tensor().dtype(), &device).map_err(map_candle)?;

        self.params.push(TrackedParam { var, m, v });
        Ok(())
    }

    /// Perform one optimization step: backward pass, clipping, moment
    /// updates, parameter update with decoupled weight decay.
    pub fn step(&mut self, loss: &Tensor) -> TrainResult<()> {
        self.step += 1;
        let t = self.step as i32;

        let grads = loss.backward().map_err(map_candle)?;

        // Global gradient norm before any parameter is touched.
        let mut total_sq = 0.0f64;
        for param in &self.params {
            if let Some(grad) = grads.get(param.var.as_tensor()) {
                let sq_sum: f32 = grad
                    .sqr()
                    .map_err(map_candle)?
                    .sum_all()
                    .map_err(map_candle)?
                    .to_scalar()
                    .map_err(map_candle)?;
                total_sq += sq_sum as f64;
            }
        }
        let total_norm = total_sq.sqrt();

        let clip_scale = if total_norm > self.config.max_grad_norm {
            self.config.max_grad_norm / (total_norm + self.config.epsilon)
        } else {
            1.0
        };

        let bc1 = 1.0 - self.config.beta1.powi(t);
        let bc2 = 1.0 - self.config.beta2.powi(t);
        let lr = self.config.lr;

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue, // parameter unused by this loss
            };

            let clipped_grad = if (clip_scale - 1.0).abs() > 1e-9 {
                grad.affine(clip_scale, 0.0).map_err(map_candle)?
            } else {
                grad.clone()
            };

            // m = β1 * m + (1 - β1) * grad. Detached: moments are optimizer
            // state, not part of the autograd graph.
            param.m = param
                .m
                .affine(self.config.beta1, 0.0)
                .map_err(map_candle)?
                .add(
                    &clipped_grad
                        .affine(1.0 - self.config.beta1, 0.0)
                        .map_err(map_candle)?,
                )
                .map_err(map_candle)?
                .detach();

            // v = β2 * v + (1 - β2) * grad^2
            let grad_sq = clipped_grad.sqr().map_err(map_candle)?;
            param.v = param
                .v
                .affine(self.config.beta2, 0.0)
                .map_err(map_candle)?
                .add(&grad_sq.affine(1.0 - self.config.beta2, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(map_candle)?;
            let v_hat = param.v.affine(1.0 / bc2, 0.0).map_err(map_candle)?;

            // -lr * m_hat / (sqrt(v_hat) + eps)
            let v_sqrt = v_hat.sqrt().map_err(map_candle)?;
            let eps_tensor = Tensor::ones_like(&v_sqrt)
                .map_err(map_candle)?
                .affine(self.config.epsilon, 0.0)
                .map_err(map_candle)?;
            let denom = v_sqrt.add(&eps_tensor).map_err(map_candle)?;
            let step_update = m_hat
                .div(&denom)
                .map_err(map_candle)?
                .affine(-lr, 0.0)
                .map_err(map_candle)?;

            // Decoupled weight decay: θ = θ - lr * wd * θ
            let current = param.var.as_tensor().clone();
            let decay = current
                .affine(-lr * self.config.weight_decay, 0.0)
                .map_err(map_candle)?;

            let new_val = current
                .add(&step_update)
                .map_err(map_candle)?
                .add(&decay)
                .map_err(map_candle)?
                .detach();

            param.var.set(&new_val).map_err(map_candle)?;
        }

        Ok(())
    }

    pub fn global_step(&self) -> usize {
        self.step
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

fn map_candle(e: candle_core::Error) -> TrainError {
    TrainError::Tensor {
        message: format!("optimizer: {}", e),
    }
}
