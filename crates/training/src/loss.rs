use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{config::to_runtime_error, TrainingError};

/// Cross entropy with label smoothing over the non-target classes and
/// ignore-index handling.
///
/// Per position: `(1-ε)·NLL(target) + ε/(V-1)·Σ_{v≠target} NLL(v)`, averaged
/// over the positions whose target differs from the ignore index.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    label_smoothing: f64,
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f64) -> Result<Self, TrainingError> {
        if !(0.0..=1.0).contains(&smoothing) {
            return Err(TrainingError::initialization(
                "label smoothing must be in [0, 1] for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = *dims
            .last()
            .ok_or_else(|| TrainingError::runtime("logits tensor missing vocabulary dimension"))?;
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(
                "target tensor must match logits batch/sequence dimensions",
            ));
        }

        if self.label_smoothing > 0.0 && vocab_size < 2 {
            return Err(TrainingError::runtime(
                "label smoothing needs at least two classes",
            ));
        }

        let token_count: usize = token_dims.iter().copied().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .reshape((token_count, vocab_size))
            .map_err(to_runtime_error)?;

        let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

        let targets_on_device = targets.to_device(device).map_err(to_runtime_error)?;
        let targets_flat = targets_on_device
            .reshape((token_count,))
            .map_err(to_runtime_error)?;
        let targets_flat = match targets_flat.dtype() {
            DType::U32 => targets_flat,
            DType::I64 | DType::U8 | DType::F32 => targets_flat
                .to_dtype(DType::U32)
                .map_err(to_runtime_error)?,
            dtype => {
                return Err(TrainingError::runtime(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let valid_mask = if let Some(ignore_index) = self.ignore_index {
            targets_flat
                .ne(ignore_index)
                .map_err(to_runtime_error)?
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
        } else {
            Tensor::ones((token_count,), DType::F32, device).map_err(to_runtime_error)?
        };

        let total_tokens_scalar = valid_mask
            .sum_all()
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)?;
        let total_tokens = total_tokens_scalar.round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }

        let target_indices = targets_flat.unsqueeze(1).map_err(to_runtime_error)?;
        let nll = log_probs
            .gather(&target_indices, 1)
            .map_err(to_runtime_error)?
            .neg()
            .map_err(to_runtime_error)?
            .squeeze(1)
            .map_err(to_runtime_error)?;

        let per_token_loss = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing;
            let total_nll = log_probs
                .sum(1)
                .map_err(to_runtime_error)?
                .neg()
                .map_err(to_runtime_error)?;
            let others = (total_nll - &nll).map_err(to_runtime_error)?;
            let target_term = nll.affine(1.0 - smoothing, 0.0).map_err(to_runtime_error)?;
            let other_term = others
                .affine(smoothing / (vocab_size - 1) as f64, 0.0)
                .map_err(to_runtime_error)?;
            (target_term + other_term).map_err(to_runtime_error)?
        } else {
            nll
        };

        let weighted_loss = (&per_token_loss * &valid_mask).map_err(to_runtime_error)?;
        let loss_sum = weighted_loss.sum_all().map_err(to_runtime_error)?;
        let average_loss = loss_sum
            .affine(1f64 / total_tokens as f64, 0.0)
            .map_err(to_runtime_error)?;

        let average_loss_value = average_loss.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss: average_loss,
            metrics: LossMetrics {
                average_loss: average_loss_value,
                total_tokens,
            },
        })
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
            ignore_index: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits() -> Tensor {
        Tensor::new(
            &[[[2.0f32, 0.5, -1.0, 0.0], [0.1, 0.2, 0.3, 0.4], [1.0, 1.0, 1.0, 1.0]]],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn loss_value(loss: &CrossEntropyLoss, targets: &[u32]) -> f32 {
        let targets = Tensor::from_slice(targets, (1, targets.len()), &Device::Cpu).unwrap();
        loss.compute(&logits(), &targets).unwrap().metrics.average_loss()
    }

    #[test]
    fn zero_smoothing_is_plain_nll_over_non_pad() {
        let loss = CrossEntropyLoss::new().with_ignore_index(Some(0));
        let value = loss_value(&loss, &[1, 3, 0]);

        let log_probs = ops::log_softmax(&logits().squeeze(0).unwrap(), D::Minus1)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let expected = -(log_probs[0][1] + log_probs[1][3]) / 2.0;
        assert!((value - expected).abs() < 1e-6);
    }

    #[test]
    fn full_smoothing_puts_no_mass_on_the_target() {
        let loss = CrossEntropyLoss::new().with_label_smoothing(1.0).unwrap();
        let row = |index: usize, target: u32| {
            let targets = Tensor::new(&[[target]], &Device::Cpu).unwrap();
            let single = logits().narrow(1, index, 1).unwrap();
            loss.compute(&single, &targets).unwrap().metrics.average_loss()
        };

        let log_probs = ops::log_softmax(&logits().squeeze(0).unwrap(), D::Minus1)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let expected: f32 = (1..4).map(|v| -log_probs[0][v]).sum::<f32>() / 3.0;
        assert!((row(0, 0) - expected).abs() < 1e-6);

        // Uniform prediction: every target yields the same loss.
        assert!((row(2, 0) - row(2, 3)).abs() < 1e-6);
    }

    #[test]
    fn smoothing_spreads_over_other_classes() {
        let loss = CrossEntropyLoss::new().with_label_smoothing(0.3).unwrap();
        let value = loss_value(&loss, &[0, 1, 2]);

        let log_probs = ops::log_softmax(&logits().squeeze(0).unwrap(), D::Minus1)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let mut expected = 0.0;
        for (row, target) in [0usize, 1, 2].into_iter().enumerate() {
            let others: f32 = (0..4).filter(|v| *v != target).map(|v| -log_probs[row][v]).sum();
            expected += 0.7 * -log_probs[row][target] + 0.1 * others;
        }
        expected /= 3.0;
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn all_padding_is_an_error() {
        let loss = CrossEntropyLoss::new().with_ignore_index(Some(0));
        let targets = Tensor::new(&[[0u32, 0, 0]], &Device::Cpu).unwrap();
        assert!(loss.compute(&logits(), &targets).is_err());
    }
}
