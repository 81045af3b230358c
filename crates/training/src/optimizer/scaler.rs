use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    config::{to_runtime_error, Precision},
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    /// Clamps out-of-range knobs back to usable values.
    fn validated(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        self.max_scale = self.max_scale.max(self.min_scale);
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

/// Persisted dynamic loss-scale position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
}

/// Dynamic loss scaling for reduced-precision runs.
///
/// Under fp32 the scaler is inert: scaling is the identity and no step is
/// ever reported as overflowing.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    dynamic: Option<LossScaleConfig>,
    loss_scale: f32,
    stable_steps: usize,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        match precision {
            Precision::Fp32 => Self {
                dynamic: None,
                loss_scale: 1.0,
                stable_steps: 0,
            },
            Precision::Fp16 | Precision::Bf16 | Precision::Mixed => {
                let config = config.validated();
                Self {
                    loss_scale: config.initial_scale,
                    stable_steps: 0,
                    dynamic: Some(config),
                }
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(loss, self.loss_scale)
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(grad, 1.0 / self.loss_scale)
    }

    fn multiply(&self, tensor: &Tensor, factor: f32) -> Result<Tensor, TrainingError> {
        if self.dynamic.is_none() {
            return Ok(tensor.clone());
        }
        tensor
            .affine(f64::from(factor), 0.0)
            .map_err(to_runtime_error)
    }

    /// True when any gradient holds an inf or NaN.
    pub fn has_overflow<'a, I>(&self, grads: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator<Item = &'a Tensor>,
    {
        if self.dynamic.is_none() {
            return Ok(false);
        }
        for grad in grads {
            if !all_finite(grad)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Books one optimizer step. Returns `(old, new)` when the scale moved.
    pub fn record_step(&mut self, overflow: bool) -> Option<(f32, f32)> {
        let config = self.dynamic.as_ref()?;
        let before = self.loss_scale;
        if overflow {
            self.loss_scale = (before * config.backoff_factor).max(config.min_scale);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= config.growth_interval {
                self.loss_scale = (before * config.growth_factor).min(config.max_scale);
                self.stable_steps = 0;
            }
        }
        (self.loss_scale != before).then_some((before, self.loss_scale))
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            enabled: self.is_enabled(),
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
        }
    }

    /// Restores a saved position. States written under the other precision
    /// mode are ignored.
    pub fn load_state(&mut self, saved: GradientScalerState) {
        let Some(config) = self.dynamic.as_ref() else {
            return;
        };
        if saved.enabled {
            self.loss_scale = saved.loss_scale.clamp(config.min_scale, config.max_scale);
            self.stable_steps = saved.stable_steps;
        }
    }
}

fn all_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    let values = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    Ok(values.iter().all(|v| v.is_finite()))
}
