use candle_core::{DType, Tensor, Var};
use log::info;
use model::Seq2SeqModel;

use crate::{
    config::to_runtime_error, coordination::ProcessGroup, data::BatchSource,
    loss::CrossEntropyLoss, TrainingError,
};

struct FisherEntry {
    var: Var,
    fisher: Tensor,
    anchor: Tensor,
}

/// Diagonal Fisher information and the anchor parameters `θ*`.
pub struct FisherEstimate {
    entries: Vec<FisherEntry>,
    samples: usize,
}

impl FisherEstimate {
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `Σ F_i (θ_i - θ*_i)²` over the tracked parameters.
    pub fn penalty(&self) -> Result<Tensor, TrainingError> {
        let mut total: Option<Tensor> = None;
        for entry in &self.entries {
            let term = entry
                .var
                .as_tensor()
                .to_dtype(DType::F32)
                .and_then(|theta| theta.sub(&entry.anchor))
                .and_then(|delta| delta.sqr())
                .and_then(|delta| delta.mul(&entry.fisher))
                .and_then(|weighted| weighted.sum_all())
                .map_err(to_runtime_error)?;
            total = Some(match total {
                Some(acc) => (acc + term).map_err(to_runtime_error)?,
                None => term,
            });
        }
        match total {
            Some(total) => Ok(total),
            None => Err(TrainingError::runtime("Fisher estimate tracks no parameters")),
        }
    }
}

/// Averages group-reduced squared gradients of the primary loss over
/// `samples` batches, then snapshots the current parameters as anchors.
///
/// Every worker must call this with the same `samples`; each batch runs one
/// all-reduce.
pub fn estimate_fisher(
    model: &dyn Seq2SeqModel,
    parameters: &[(String, Var)],
    loss: &CrossEntropyLoss,
    batches: &mut dyn BatchSource,
    samples: usize,
    group: &mut dyn ProcessGroup,
) -> Result<FisherEstimate, TrainingError> {
    if samples == 0 {
        return Err(TrainingError::initialization(
            "EWC needs at least one Fisher sample",
        ));
    }
    let was_training = model.is_training();
    model.set_training(false);
    let result = accumulate_squared_gradients(model, parameters, loss, batches, samples, group);
    model.set_training(was_training);
    let sums = result?;

    let scale = 1.0 / samples as f32;
    let mut entries = Vec::with_capacity(parameters.len());
    for ((_, var), sum) in parameters.iter().zip(sums) {
        let averaged: Vec<f32> = sum.into_iter().map(|value| value * scale).collect();
        let fisher = Tensor::from_vec(averaged, var.shape(), var.device())
            .map_err(to_runtime_error)?;
        let anchor = var
            .as_tensor()
            .to_dtype(DType::F32)
            .and_then(|theta| theta.copy())
            .map_err(to_runtime_error)?
            .detach();
        entries.push(FisherEntry {
            var: var.clone(),
            fisher,
            anchor,
        });
    }
    info!(
        "estimated Fisher information for {} tensors over {samples} batches",
        entries.len()
    );
    Ok(FisherEstimate { entries, samples })
}

fn accumulate_squared_gradients(
    model: &dyn Seq2SeqModel,
    parameters: &[(String, Var)],
    loss: &CrossEntropyLoss,
    batches: &mut dyn BatchSource,
    samples: usize,
    group: &mut dyn ProcessGroup,
) -> Result<Vec<Vec<f32>>, TrainingError> {
    let mut sums: Vec<Vec<f32>> = parameters
        .iter()
        .map(|(_, var)| vec![0.0; var.elem_count()])
        .collect();
    for _ in 0..samples {
        let batch = batches
            .next_batch()?
            .ok_or_else(|| TrainingError::runtime("Fisher batch stream ended early"))?;
        let output = model
            .forward(&batch.model_inputs())
            .map_err(to_runtime_error)?;
        let grads = loss
            .compute(&output.logits, &batch.labels)?
            .loss
            .backward()
            .map_err(to_runtime_error)?;

        let mut flat = Vec::with_capacity(sums.iter().map(Vec::len).sum());
        for (_, var) in parameters {
            match grads.get(var.as_tensor()) {
                Some(grad) => flat.extend(
                    grad.to_dtype(DType::F32)
                        .and_then(|g| g.flatten_all())
                        .and_then(|g| g.to_vec1::<f32>())
                        .map_err(to_runtime_error)?,
                ),
                None => flat.extend(std::iter::repeat(0.0).take(var.elem_count())),
            }
        }
        group.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for sum in sums.iter_mut() {
            let len = sum.len();
            for (acc, grad) in sum.iter_mut().zip(&flat[offset..offset + len]) {
                *acc += grad * grad;
            }
            offset += len;
        }
    }
    Ok(sums)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn penalty_is_zero_at_the_anchor_and_grows_with_distance() {
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], &Device::Cpu).unwrap()).unwrap();
        let estimate = FisherEstimate {
            entries: vec![FisherEntry {
                var: var.clone(),
                fisher: Tensor::new(&[2.0f32, 0.5], &Device::Cpu).unwrap(),
                anchor: var.as_tensor().copy().unwrap(),
            }],
            samples: 1,
        };
        let at_anchor = estimate.penalty().unwrap().to_vec0::<f32>().unwrap();
        assert_eq!(at_anchor, 0.0);

        var.set(&Tensor::new(&[2.0f32, 4.0], &Device::Cpu).unwrap())
            .unwrap();
        let moved = estimate.penalty().unwrap().to_vec0::<f32>().unwrap();
        assert!((moved - (2.0 * 1.0 + 0.5 * 4.0)).abs() < 1e-6);
    }
}
