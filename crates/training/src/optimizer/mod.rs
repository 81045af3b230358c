use std::collections::{BTreeSet, HashMap};

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{DType, Tensor, Var};

use crate::{
    config::{self, to_runtime_error, FreezeConfig},
    TrainingError,
};

const EPS: f64 = 1e-12;

const FIRST_MOMENT_SUFFIX: &str = "exp_avg";
const SECOND_MOMENT_SUFFIX: &str = "exp_avg_sq";
const MASTER_SUFFIX: &str = "master";

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate as f64,
            beta1: value.beta1 as f64,
            beta2: value.beta2 as f64,
            epsilon: value.epsilon as f64,
            weight_decay: value.weight_decay as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
    /// Global gradient-norm bound; `None` disables clipping.
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
    pub freeze: FreezeConfig,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
            clip_global_norm: None,
            weight_decay_exclude: vec![],
            freeze: FreezeConfig::default(),
        }
    }
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        let clip = value.max_gradient_clip_value as f64;
        Self {
            use_master_weights: true,
            clip_global_norm: (clip > 0.0).then_some(clip),
            weight_decay_exclude: value.no_decay.clone(),
            freeze: value.freeze.clone(),
        }
    }
}

/// AdamW over the trainable subset of a model's parameters.
///
/// Slots are kept in the order the model reports its parameters, so every
/// worker flattens gradients into the same layout.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

/// Result of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
    pub clipped: bool,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            if options.freeze.is_frozen(&name) {
                continue;
            }
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let apply_weight_decay =
                should_apply_weight_decay(&name, &options.weight_decay_exclude);

            let master = if options.use_master_weights && dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        if params.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one trainable parameter",
            ));
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Trainable parameters in slot order.
    pub fn parameters(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.params
            .iter()
            .map(|slot| (slot.name.as_str(), &slot.param))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Re-synchronizes fp32 master copies after the model weights were
    /// overwritten from a checkpoint.
    pub fn sync_master_weights(&mut self) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            if let Some(master) = slot.master.as_ref() {
                let fp32 = slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                master.set(&fp32).map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    /// Clips and applies one AdamW update.
    ///
    /// `grads` is indexed like [`Self::parameters`]; `None` leaves the slot
    /// untouched.
    pub fn step(&mut self, grads: Vec<Option<Tensor>>) -> Result<StepReport, TrainingError> {
        if grads.len() != self.params.len() {
            return Err(TrainingError::runtime(format!(
                "optimizer expected {} gradients, received {}",
                self.params.len(),
                grads.len()
            )));
        }

        let mut processed = Vec::new();
        for (index, grad) in grads.into_iter().enumerate() {
            let Some(grad) = grad else { continue };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient { index, grad, norm });
        }

        let total_norm = processed
            .iter()
            .map(|g| g.norm * g.norm)
            .sum::<f64>()
            .sqrt();
        let mut clipped = false;

        if processed.is_empty() {
            return Ok(StepReport {
                grad_norm: 0.0,
                clipped,
            });
        }

        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
                clipped = true;
            }
        }

        self.step += 1;
        self.step_adamw(processed)?;

        Ok(StepReport {
            grad_norm: total_norm,
            clipped,
        })
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = item
                .grad
                .affine(1.0 - cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = match slot.master.as_ref() {
                Some(master) => master.as_tensor().clone(),
                None => slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?,
            };

            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            if let Some(master) = slot.master.as_ref() {
                master.set(&next).map_err(to_runtime_error)?;
            }
            let cast = if slot.dtype == DType::F32 {
                next
            } else {
                next.to_dtype(slot.dtype).map_err(to_runtime_error)?
            };
            slot.param.set(&cast).map_err(to_runtime_error)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> OptimizerState {
        let mut moments = HashMap::with_capacity(self.params.len() * 2);
        for slot in &self.params {
            moments.insert(
                moment_key(&slot.name, FIRST_MOMENT_SUFFIX),
                slot.first_moment.clone(),
            );
            moments.insert(
                moment_key(&slot.name, SECOND_MOMENT_SUFFIX),
                slot.second_moment.clone(),
            );
            if let Some(master) = &slot.master {
                moments.insert(
                    moment_key(&slot.name, MASTER_SUFFIX),
                    master.as_tensor().clone(),
                );
            }
        }
        OptimizerState {
            step: self.step,
            moments,
        }
    }

    pub fn load_state(&mut self, mut state: OptimizerState) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            let dims = slot.param.as_tensor().dims().to_vec();
            let device = slot.param.as_tensor().device().clone();
            let mut take = |suffix: &str| -> Result<Option<Tensor>, TrainingError> {
                let key = moment_key(&slot.name, suffix);
                match state.moments.remove(&key) {
                    None => Ok(None),
                    Some(tensor) => {
                        if tensor.dims() != dims.as_slice() {
                            return Err(TrainingError::checkpoint(format!(
                                "optimizer state shape mismatch for '{}'",
                                key
                            )));
                        }
                        Ok(Some(
                            tensor
                                .to_dtype(DType::F32)
                                .and_then(|t| t.to_device(&device))
                                .map_err(to_runtime_error)?,
                        ))
                    }
                }
            };

            let first = take(FIRST_MOMENT_SUFFIX)?;
            let second = take(SECOND_MOMENT_SUFFIX)?;
            let master = take(MASTER_SUFFIX)?;
            let (Some(first), Some(second)) = (first, second) else {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                )));
            };
            slot.first_moment = first;
            slot.second_moment = second;

            match (&slot.master, master) {
                (Some(current), Some(values)) => {
                    current.set(&values).map_err(to_runtime_error)?;
                    let cast = values.to_dtype(slot.dtype).map_err(to_runtime_error)?;
                    slot.param.set(&cast).map_err(to_runtime_error)?;
                }
                (None, None) => {}
                (Some(_), None) => {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state missing master weights for '{}'",
                        slot.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state contains master weights for '{}' but optimizer is not using them",
                        slot.name
                    )))
                }
            }
        }

        if !state.moments.is_empty() {
            let extra: BTreeSet<_> = state.moments.keys().cloned().collect();
            return Err(TrainingError::checkpoint(format!(
                "optimizer state has entries not present in the model: {:?}",
                extra
            )));
        }

        self.step = state.step;
        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn moment_key(name: &str, suffix: &str) -> String {
    format!("{name}.{suffix}")
}

fn should_apply_weight_decay(name: &str, exclusions: &[String]) -> bool {
    !exclusions
        .iter()
        .any(|pattern| matches_pattern(name, pattern))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    name.ends_with(pattern) || name.contains(pattern)
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

/// Moments (and fp32 master copies) keyed `<param>.exp_avg`,
/// `<param>.exp_avg_sq` and `<param>.master`.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub moments: HashMap<String, Tensor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn var(name: &str, values: &[f32]) -> (String, Var) {
        let tensor = Tensor::from_slice(values, values.len(), &Device::Cpu).unwrap();
        (name.to_string(), Var::from_tensor(&tensor).unwrap())
    }

    fn adamw(lr: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn frozen_parameters_are_not_optimized() {
        let options = TrainerOptimizerOptions {
            freeze: FreezeConfig {
                embeddings: true,
                ..FreezeConfig::default()
            },
            ..TrainerOptimizerOptions::default()
        };
        let optimizer = TrainerOptimizer::new(
            vec![var("shared.embedding", &[1.0]), var("lm_head.bias", &[0.0])],
            adamw(0.1),
            options,
        )
        .unwrap();
        let names: Vec<_> = optimizer.parameters().map(|(name, _)| name.to_string()).collect();
        assert_eq!(names, vec!["lm_head.bias".to_string()]);
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let params = vec![var("w", &[0.0, 0.0])];
        let handle = params[0].1.clone();
        let options = TrainerOptimizerOptions {
            clip_global_norm: Some(1.0),
            ..TrainerOptimizerOptions::default()
        };
        let mut optimizer = TrainerOptimizer::new(params, adamw(0.1), options).unwrap();
        let grad = Tensor::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();

        let report = optimizer.step(vec![Some(grad)]).unwrap();

        assert!((report.grad_norm - 5.0).abs() < 1e-6);
        assert!(report.clipped);
        let values = handle.as_tensor().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v < 0.0));
    }

    #[test]
    fn state_round_trip_is_exact() {
        let params = vec![var("w", &[1.0, 2.0])];
        let mut optimizer =
            TrainerOptimizer::new(params, adamw(0.01), TrainerOptimizerOptions::default()).unwrap();
        let grad = Tensor::new(&[0.5f32, -0.25], &Device::Cpu).unwrap();
        optimizer.step(vec![Some(grad)]).unwrap();
        let state = optimizer.state();

        let mut fresh = TrainerOptimizer::new(
            vec![var("w", &[1.0, 2.0])],
            adamw(0.01),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        fresh.load_state(state.clone()).unwrap();

        assert_eq!(fresh.steps_taken(), 1);
        let restored = fresh.state();
        for (key, tensor) in &state.moments {
            assert_eq!(
                restored.moments[key].to_vec1::<f32>().unwrap(),
                tensor.to_vec1::<f32>().unwrap()
            );
        }
    }

    #[test]
    fn missing_moments_are_rejected() {
        let mut optimizer = TrainerOptimizer::new(
            vec![var("w", &[1.0])],
            adamw(0.01),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let state = OptimizerState {
            step: 3,
            moments: HashMap::new(),
        };
        assert!(optimizer.load_state(state).is_err());
    }
}
