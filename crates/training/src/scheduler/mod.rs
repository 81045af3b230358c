use std::f64::consts::PI;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

/// Step-indexed learning-rate schedule.
///
/// The rate is a pure function of the position, so a schedule is restored by
/// its position alone and can be moved forward without taking optimizer steps.
pub trait LRScheduler: Send {
    /// Advances one position and returns the new rate.
    fn step(&mut self) -> f64;

    fn learning_rate(&self) -> f64;

    fn position(&self) -> usize;

    fn set_position(&mut self, position: usize);

    /// Position after which the rate no longer changes.
    fn horizon(&self) -> usize;

    /// Closed-form number of steps until the rate is at or below `target`.
    ///
    /// `None` when the schedule is not invertible or never reaches `target`.
    fn steps_until(&self, target: f64) -> Option<usize>;

    fn state(&self) -> SchedulerState {
        SchedulerState {
            position: self.position(),
            learning_rate: self.learning_rate(),
        }
    }

    fn load_state(&mut self, state: &SchedulerState) {
        self.set_position(state.position);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub position: usize,
    /// Informational; recomputed from `position` on load.
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayShape {
    Constant,
    Linear,
    Cosine,
    Polynomial { power: f64 },
}

/// Linear warmup from zero to `base_lr`, then decay to `min_lr` at `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    shape: DecayShape,
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    position: usize,
}

impl WarmupSchedule {
    pub fn new(
        shape: DecayShape,
        base_lr: f64,
        min_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if min_lr < 0.0 || min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }
        if let DecayShape::Polynomial { power } = shape {
            if power <= 0.0 {
                return Err(TrainingError::initialization(
                    "polynomial schedule requires power > 0",
                ));
            }
        }
        Ok(Self {
            shape,
            base_lr,
            min_lr,
            warmup_steps,
            total_steps: total_steps.max(warmup_steps),
            position: 0,
        })
    }

    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        let shape = match cfg.strategy {
            config::LearningRateSchedule::Constant => DecayShape::Constant,
            config::LearningRateSchedule::LinearDecay => DecayShape::Linear,
            config::LearningRateSchedule::Cosine => DecayShape::Cosine,
            config::LearningRateSchedule::Polynomial => DecayShape::Polynomial {
                power: cfg.power as f64,
            },
        };
        Self::new(
            shape,
            base_lr,
            cfg.min_lr as f64,
            cfg.warmup_steps,
            total_steps,
        )
    }

    fn decay_span(&self) -> usize {
        self.total_steps - self.warmup_steps
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        let span = self.decay_span();
        if self.shape == DecayShape::Constant || span == 0 {
            return match self.shape {
                DecayShape::Constant => self.base_lr,
                _ => self.min_lr,
            };
        }
        let progress = ((step - self.warmup_steps) as f64 / span as f64).clamp(0.0, 1.0);
        let decay = match self.shape {
            DecayShape::Constant => 1.0,
            DecayShape::Linear => 1.0 - progress,
            DecayShape::Cosine => 0.5 * (1.0 + f64::cos(PI * progress)),
            DecayShape::Polynomial { power } => (1.0 - progress).max(0.0).powf(power),
        };
        self.min_lr + (self.base_lr - self.min_lr) * decay
    }

    /// Smallest decay progress in `[0, 1]` whose rate is at or below `target`.
    fn inverse_progress(&self, target: f64) -> Option<f64> {
        let range = self.base_lr - self.min_lr;
        if range <= 0.0 {
            return None;
        }
        let ratio = ((target - self.min_lr) / range).clamp(0.0, 1.0);
        match self.shape {
            DecayShape::Constant => None,
            DecayShape::Linear => Some(1.0 - ratio),
            DecayShape::Cosine => Some((2.0 * ratio - 1.0).acos() / PI),
            DecayShape::Polynomial { power } => Some(1.0 - ratio.powf(1.0 / power)),
        }
    }
}

impl LRScheduler for WarmupSchedule {
    fn step(&mut self) -> f64 {
        self.position = self.position.saturating_add(1);
        self.compute_lr(self.position)
    }

    fn learning_rate(&self) -> f64 {
        self.compute_lr(self.position)
    }

    fn position(&self) -> usize {
        self.position
    }

    fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    fn horizon(&self) -> usize {
        match self.shape {
            DecayShape::Constant => self.warmup_steps,
            _ => self.total_steps,
        }
    }

    fn steps_until(&self, target: f64) -> Option<usize> {
        if self.learning_rate() <= target {
            return Some(0);
        }
        if target < self.min_lr {
            return None;
        }
        let span = self.decay_span();
        let progress = self.inverse_progress(target)?;
        let start = self.position.max(self.warmup_steps);
        let mut candidate =
            (self.warmup_steps + (progress * span as f64).ceil() as usize).max(start);
        // Settle floating-point rounding in the inverse.
        while candidate > start && self.compute_lr(candidate - 1) <= target {
            candidate -= 1;
        }
        while candidate < self.total_steps && self.compute_lr(candidate) > target {
            candidate += 1;
        }
        if self.compute_lr(candidate) > target {
            return None;
        }
        Some(candidate - self.position)
    }
}

/// Outcome of lowering the rate by a factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnnealOutcome {
    pub previous_lr: f64,
    pub learning_rate: f64,
    pub steps_advanced: usize,
    /// The schedule bottomed out before reaching the target.
    pub hit_floor: bool,
}

/// Moves the schedule forward until the rate is at most `previous / factor`.
///
/// Uses the closed-form inverse when the schedule has one and otherwise steps
/// at most `iteration_cap` times.
pub fn anneal(
    scheduler: &mut dyn LRScheduler,
    factor: f64,
    iteration_cap: usize,
) -> AnnealOutcome {
    let previous_lr = scheduler.learning_rate();
    let target = previous_lr / factor;
    let start = scheduler.position();

    let hit_floor = match scheduler.steps_until(target) {
        Some(steps) if steps <= iteration_cap => {
            scheduler.set_position(start + steps);
            false
        }
        _ => {
            let mut iterations = 0;
            while scheduler.learning_rate() > target
                && scheduler.position() < scheduler.horizon()
                && iterations < iteration_cap
            {
                scheduler.step();
                iterations += 1;
            }
            scheduler.learning_rate() > target
        }
    };

    let outcome = AnnealOutcome {
        previous_lr,
        learning_rate: scheduler.learning_rate(),
        steps_advanced: scheduler.position() - start,
        hit_floor,
    };
    if hit_floor {
        warn!(
            "learning rate schedule bottomed out at {:.3e} while annealing towards {:.3e}; \
             the schedule horizon is too short for the configured annealing",
            outcome.learning_rate, target
        );
    }
    outcome
}

/// Steps a fresh schedule until its rate reaches `min_lr`, so training never
/// starts with a zero rate. Returns the number of steps taken.
pub fn fast_forward_to(scheduler: &mut dyn LRScheduler, min_lr: f64, iteration_cap: usize) -> usize {
    let mut steps = 0;
    while scheduler.learning_rate() < min_lr
        && scheduler.position() < scheduler.horizon()
        && steps < iteration_cap
    {
        scheduler.step();
        steps += 1;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(warmup: usize, total: usize) -> WarmupSchedule {
        WarmupSchedule::new(DecayShape::Linear, 1.0, 0.0, warmup, total).unwrap()
    }

    #[test]
    fn warmup_then_linear_decay() {
        let mut schedule = linear(10, 110);
        assert_eq!(schedule.learning_rate(), 0.0);
        schedule.set_position(5);
        assert!((schedule.learning_rate() - 0.5).abs() < 1e-12);
        schedule.set_position(10);
        assert!((schedule.learning_rate() - 1.0).abs() < 1e-12);
        schedule.set_position(60);
        assert!((schedule.learning_rate() - 0.5).abs() < 1e-12);
        schedule.set_position(500);
        assert_eq!(schedule.learning_rate(), 0.0);
    }

    #[test]
    fn closed_form_matches_iteration() {
        let shapes = [
            DecayShape::Linear,
            DecayShape::Cosine,
            DecayShape::Polynomial { power: 2.0 },
        ];
        for shape in shapes {
            let mut schedule = WarmupSchedule::new(shape, 7e-4, 1e-6, 100, 5_000).unwrap();
            schedule.set_position(1_234);
            let target = schedule.learning_rate() / 2.0;
            let predicted = schedule.steps_until(target).unwrap();

            let mut iterated = schedule.clone();
            let mut steps = 0;
            while iterated.learning_rate() > target {
                iterated.step();
                steps += 1;
            }
            assert_eq!(predicted, steps, "{shape:?}");
        }
    }

    #[test]
    fn anneal_halves_the_rate() {
        let mut schedule = linear(0, 1_024);
        schedule.set_position(256);
        let outcome = anneal(&mut schedule, 2.0, 10_000_000);
        assert!(!outcome.hit_floor);
        assert_eq!(outcome.previous_lr, 0.75);
        assert_eq!(outcome.learning_rate, 0.375);
        assert_eq!(outcome.steps_advanced, 384);
        assert_eq!(schedule.position(), 640);
    }

    #[test]
    fn anneal_during_warmup_lands_in_decay() {
        let mut schedule = linear(100, 1_100);
        schedule.set_position(50);
        let outcome = anneal(&mut schedule, 2.0, 10_000_000);
        assert!(outcome.learning_rate <= 0.25);
        assert!(schedule.position() >= 100);
    }

    #[test]
    fn constant_schedule_reports_floor() {
        let mut schedule = WarmupSchedule::new(DecayShape::Constant, 1e-3, 0.0, 0, 10).unwrap();
        assert_eq!(schedule.steps_until(5e-4), None);
        let outcome = anneal(&mut schedule, 2.0, 1_000);
        assert!(outcome.hit_floor);
        assert_eq!(outcome.learning_rate, 1e-3);
    }

    #[test]
    fn fast_forward_leaves_zero_rate() {
        let mut schedule = linear(16_000, 500_000);
        let steps = fast_forward_to(&mut schedule, 1e-7, 10_000_000);
        assert_eq!(steps, 1);
        assert!(schedule.learning_rate() >= 1e-7);
    }

    #[test]
    fn state_restores_position() {
        let mut schedule = linear(10, 100);
        for _ in 0..37 {
            schedule.step();
        }
        let state = schedule.state();
        let mut restored = linear(10, 100);
        restored.load_state(&state);
        assert_eq!(restored.position(), 37);
        assert_eq!(restored.learning_rate(), schedule.learning_rate());
    }
}
