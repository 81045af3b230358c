use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Per-step values written as scalars.
#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub step_loss: f64,
    pub loss_ema: f64,
    pub grad_norm: f64,
    pub tokens: u64,
    pub total_tokens: u64,
}

/// Aggregate over the steps since the previous progress line.
#[derive(Debug, Clone)]
pub struct WindowSummary {
    pub steps: usize,
    pub skipped: usize,
    pub mean_loss: f64,
    pub loss_ema: f64,
    pub mean_grad_norm: f64,
    pub tokens_per_sec: f64,
    pub elapsed: Duration,
}

/// Running training statistics for one worker.
///
/// Skipped updates count as steps but are left out of the window averages.
#[derive(Debug)]
pub struct TrainingMetrics {
    loss_ema: ExponentialMovingAverage,
    total_tokens: u64,
    window_start: Instant,
    window_steps: usize,
    window_skipped: usize,
    window_tokens: u64,
    window_loss: f64,
    window_grad_norm: f64,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self {
            loss_ema: ExponentialMovingAverage::new(0.1),
            total_tokens: 0,
            window_start: Instant::now(),
            window_steps: 0,
            window_skipped: 0,
            window_tokens: 0,
            window_loss: 0.0,
            window_grad_norm: 0.0,
        }
    }

    /// Folds one completed step in. `tokens` counts this worker's target
    /// tokens for the step.
    pub fn record_step(
        &mut self,
        tokens: u64,
        loss: f64,
        grad_norm: f64,
        applied: bool,
    ) -> StepSnapshot {
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.window_steps += 1;
        self.window_tokens = self.window_tokens.saturating_add(tokens);
        if applied {
            self.window_loss += loss;
            self.window_grad_norm += grad_norm;
        } else {
            self.window_skipped += 1;
        }
        let loss_ema = if loss.is_finite() {
            self.loss_ema.update(loss)
        } else {
            self.loss_ema.value().unwrap_or(loss)
        };

        StepSnapshot {
            step_loss: loss,
            loss_ema,
            grad_norm,
            tokens,
            total_tokens: self.total_tokens,
        }
    }

    /// Summarizes the current window and starts a new one.
    pub fn drain_window(&mut self) -> WindowSummary {
        let now = Instant::now();
        let elapsed = now.duration_since(self.window_start);
        let steps = self.window_steps;
        let applied = steps - self.window_skipped;
        let summary = WindowSummary {
            steps,
            skipped: self.window_skipped,
            mean_loss: mean(self.window_loss, applied),
            loss_ema: self.loss_ema.value().unwrap_or(0.0),
            mean_grad_norm: mean(self.window_grad_norm, applied),
            tokens_per_sec: if elapsed > Duration::ZERO {
                self.window_tokens as f64 / elapsed.as_secs_f64()
            } else {
                0.0
            },
            elapsed,
        };

        self.window_start = now;
        self.window_steps = 0;
        self.window_skipped = 0;
        self.window_tokens = 0;
        self.window_loss = 0.0;
        self.window_grad_norm = 0.0;
        summary
    }
}

fn mean(sum: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_starts_at_the_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.value(), None);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
    }

    #[test]
    fn snapshots_accumulate_tokens() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_step(10, 2.0, 1.0, true);
        let snapshot = metrics.record_step(5, 1.0, 0.5, true);
        assert_eq!(snapshot.total_tokens, 15);
        assert_eq!(snapshot.step_loss, 1.0);
        assert!((snapshot.loss_ema - 1.9).abs() < 1e-12);
    }

    #[test]
    fn windows_reset_after_draining() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_step(4, 3.0, 2.0, true);
        metrics.record_step(4, 1.0, 4.0, true);
        let first = metrics.drain_window();
        assert_eq!(first.steps, 2);
        assert_eq!(first.mean_loss, 2.0);
        assert_eq!(first.mean_grad_norm, 3.0);

        let empty = metrics.drain_window();
        assert_eq!(empty.steps, 0);
        assert_eq!(empty.mean_loss, 0.0);
    }

    #[test]
    fn skipped_updates_are_counted_but_not_averaged() {
        let mut metrics = TrainingMetrics::new();
        metrics.record_step(4, 2.0, 1.0, true);
        let skipped = metrics.record_step(4, f64::INFINITY, 0.0, false);
        assert_eq!(skipped.loss_ema, 2.0);

        let window = metrics.drain_window();
        assert_eq!(window.steps, 2);
        assert_eq!(window.skipped, 1);
        assert_eq!(window.mean_loss, 2.0);
        assert_eq!(window.mean_grad_norm, 1.0);
    }
}
