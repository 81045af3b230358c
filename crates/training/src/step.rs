//! Gradient accumulation, loss scaling, all-reduce and the optimizer update.

use candle_core::{DType, Tensor};
use log::info;

use crate::{
    config::to_runtime_error,
    coordination::ProcessGroup,
    optimizer::{GradientScaler, TrainerOptimizer},
    scheduler::LRScheduler,
    TrainingError,
};

/// What one micro-batch did to the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Gradients merged; more micro-batches are needed.
    Accumulating { micro_batches: usize },
    /// An optimizer step boundary was crossed.
    Completed(CompletedStep),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedStep {
    /// Sum of the `loss / k` values of the micro-batches.
    pub loss: f32,
    pub grad_norm: f64,
    pub clipped: bool,
    /// False when non-finite gradients made the update get skipped.
    pub applied: bool,
    pub learning_rate: f64,
    pub loss_scale: f32,
    pub target_tokens: usize,
}

/// Runs `ACCUMULATING → CLIP → UPDATE → SCHEDULE_ADVANCE` for one worker.
///
/// The schedule advances on every boundary, including boundaries whose update
/// was skipped for overflow.
pub struct StepExecutor {
    accumulation_steps: usize,
    micro_batches: usize,
    gradients: Vec<Option<Tensor>>,
    loss_sum: f32,
    target_tokens: usize,
    scaler: GradientScaler,
}

impl StepExecutor {
    pub fn new(accumulation_steps: usize, scaler: GradientScaler) -> Self {
        Self {
            accumulation_steps: accumulation_steps.max(1),
            micro_batches: 0,
            gradients: Vec::new(),
            loss_sum: 0.0,
            target_tokens: 0,
            scaler,
        }
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    /// True between optimizer steps with no micro-batch pending.
    pub fn is_idle(&self) -> bool {
        self.micro_batches == 0
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut GradientScaler {
        &mut self.scaler
    }

    /// Back-propagates one micro-batch loss and, on the k-th call, performs
    /// the synchronized optimizer step.
    pub fn micro_step(
        &mut self,
        loss: &Tensor,
        target_tokens: usize,
        optimizer: &mut TrainerOptimizer,
        scheduler: &mut dyn LRScheduler,
        group: &mut dyn ProcessGroup,
    ) -> Result<StepOutcome, TrainingError> {
        let normalized = loss
            .affine(1.0 / self.accumulation_steps as f64, 0.0)
            .map_err(to_runtime_error)?;
        self.loss_sum += normalized
            .to_dtype(DType::F32)
            .and_then(|l| l.reshape(()))
            .and_then(|l| l.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
        self.target_tokens += target_tokens;

        let scaled = self.scaler.scale(&normalized)?;
        let grads = scaled.backward().map_err(to_runtime_error)?;
        if self.gradients.is_empty() {
            self.gradients = vec![None; optimizer.len()];
        }
        for (slot, (_, var)) in self.gradients.iter_mut().zip(optimizer.parameters()) {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            *slot = Some(match slot.take() {
                Some(existing) => (existing + grad).map_err(to_runtime_error)?,
                None => grad,
            });
        }
        self.micro_batches += 1;

        if self.micro_batches < self.accumulation_steps {
            return Ok(StepOutcome::Accumulating {
                micro_batches: self.micro_batches,
            });
        }
        let completed = self.finish(optimizer, scheduler, group);
        self.reset();
        completed.map(StepOutcome::Completed)
    }

    fn finish(
        &mut self,
        optimizer: &mut TrainerOptimizer,
        scheduler: &mut dyn LRScheduler,
        group: &mut dyn ProcessGroup,
    ) -> Result<CompletedStep, TrainingError> {
        let mut gradients = std::mem::take(&mut self.gradients);
        if group.world_size() > 1 {
            average_across_group(&mut gradients, optimizer, group)?;
        }

        let mut unscaled = Vec::with_capacity(gradients.len());
        for grad in gradients {
            unscaled.push(match grad {
                Some(grad) => Some(self.scaler.unscale(&grad)?),
                None => None,
            });
        }

        let overflow = !self.loss_sum.is_finite()
            || self.scaler.has_overflow(unscaled.iter().flatten())?;
        let report = if overflow {
            None
        } else {
            Some(optimizer.step(unscaled)?)
        };
        let applied = report.is_some();
        if let Some((before, after)) = self.scaler.record_step(overflow) {
            info!("gradient scale changed from {before} to {after}");
        }
        let scale_after = self.scaler.loss_scale();

        let learning_rate = scheduler.step();
        optimizer.set_learning_rate(learning_rate);

        Ok(CompletedStep {
            loss: self.loss_sum,
            grad_norm: report.map_or(0.0, |r| r.grad_norm),
            clipped: report.is_some_and(|r| r.clipped),
            applied,
            learning_rate,
            loss_scale: scale_after,
            target_tokens: self.target_tokens,
        })
    }

    fn reset(&mut self) {
        self.micro_batches = 0;
        self.gradients.clear();
        self.loss_sum = 0.0;
        self.target_tokens = 0;
    }
}

/// Replaces every gradient with its mean over the group. Missing gradients
/// count as zeros so all workers reduce buffers of the same layout.
fn average_across_group(
    gradients: &mut [Option<Tensor>],
    optimizer: &TrainerOptimizer,
    group: &mut dyn ProcessGroup,
) -> Result<(), TrainingError> {
    let shapes: Vec<_> = optimizer
        .parameters()
        .map(|(_, var)| (var.shape().clone(), var.device().clone()))
        .collect();
    let mut flat = Vec::with_capacity(shapes.iter().map(|(s, _)| s.elem_count()).sum());
    for (grad, (shape, _)) in gradients.iter().zip(&shapes) {
        match grad {
            Some(grad) => flat.extend(
                grad.flatten_all()
                    .and_then(|g| g.to_vec1::<f32>())
                    .map_err(to_runtime_error)?,
            ),
            None => flat.extend(std::iter::repeat(0.0f32).take(shape.elem_count())),
        }
    }

    group.all_reduce_mean(&mut flat)?;

    let mut offset = 0;
    for (grad, (shape, device)) in gradients.iter_mut().zip(shapes) {
        let len = shape.elem_count();
        let values = flat[offset..offset + len].to_vec();
        offset += len;
        *grad = Some(Tensor::from_vec(values, shape, &device).map_err(to_runtime_error)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Precision,
        coordination::SoloGroup,
        optimizer::{AdamWConfig, TrainerOptimizerOptions},
        scheduler::{DecayShape, WarmupSchedule},
    };
    use candle_core::{Device, Var};

    fn setup(accumulation: usize) -> (Var, TrainerOptimizer, WarmupSchedule, StepExecutor) {
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, -2.0], &Device::Cpu).unwrap()).unwrap();
        let optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            AdamWConfig {
                learning_rate: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            },
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scheduler = WarmupSchedule::new(DecayShape::Constant, 0.1, 0.0, 0, 100).unwrap();
        let executor = StepExecutor::new(accumulation, GradientScaler::new(Precision::Fp32));
        (var, optimizer, scheduler, executor)
    }

    fn quadratic(var: &Var, target: f32) -> Tensor {
        var.as_tensor()
            .affine(1.0, -(target as f64))
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
    }

    #[test]
    fn accumulates_until_the_boundary() {
        let (var, mut optimizer, mut scheduler, mut executor) = setup(2);
        let mut group = SoloGroup;

        let first = executor
            .micro_step(&quadratic(&var, 0.0), 3, &mut optimizer, &mut scheduler, &mut group)
            .unwrap();
        assert_eq!(first, StepOutcome::Accumulating { micro_batches: 1 });
        assert_eq!(optimizer.steps_taken(), 0);

        let second = executor
            .micro_step(&quadratic(&var, 0.0), 4, &mut optimizer, &mut scheduler, &mut group)
            .unwrap();
        let StepOutcome::Completed(step) = second else {
            panic!("expected a completed step");
        };
        assert!(step.applied);
        assert_eq!(step.target_tokens, 7);
        // Two micro-batches of loss 5, each divided by k = 2.
        assert!((step.loss - 5.0).abs() < 1e-6);
        assert_eq!(optimizer.steps_taken(), 1);
        assert_eq!(scheduler.position(), 1);
        assert!(executor.is_idle());
    }

    #[test]
    fn two_micro_batches_match_one_full_batch() {
        let (var_a, mut opt_a, mut sched_a, mut exec_a) = setup(2);
        let (var_b, mut opt_b, mut sched_b, mut exec_b) = setup(1);
        let mut group = SoloGroup;

        for target in [0.5f32, -1.5] {
            exec_a
                .micro_step(&quadratic(&var_a, target), 1, &mut opt_a, &mut sched_a, &mut group)
                .unwrap();
        }
        let full = (quadratic(&var_b, 0.5) + quadratic(&var_b, -1.5))
            .unwrap()
            .affine(0.5, 0.0)
            .unwrap();
        exec_b
            .micro_step(&full, 2, &mut opt_b, &mut sched_b, &mut group)
            .unwrap();

        let a = var_a.as_tensor().to_vec1::<f32>().unwrap();
        let b = var_b.as_tensor().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn non_finite_loss_skips_the_update_but_advances_the_schedule() {
        let (var, mut optimizer, mut scheduler, mut executor) = setup(1);
        let before = var.as_tensor().to_vec1::<f32>().unwrap();
        let loss = quadratic(&var, 0.0).affine(f64::INFINITY, 0.0).unwrap();

        let StepOutcome::Completed(step) = executor
            .micro_step(&loss, 1, &mut optimizer, &mut scheduler, &mut SoloGroup)
            .unwrap()
        else {
            panic!("expected a completed step");
        };
        assert!(!step.applied);
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), before);
        assert_eq!(scheduler.position(), 1);
    }
}
