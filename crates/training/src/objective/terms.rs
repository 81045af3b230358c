use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use model::{ModelOutput, Seq2SeqModel};

use super::{label_mask, masked_mean, token_entropy, FisherEstimate, LossContext, LossTerm};
use crate::{
    config::{to_runtime_error, DistillationConfig, DistillationStyle, LayerPair},
    loss::CrossEntropyLoss,
    TrainingError,
};

type Folded = (Tensor, Option<Tensor>);

/// `w·term + (1-w)·running`.
fn blend(running: &Tensor, term: &Tensor, weight: f64) -> Result<Tensor, TrainingError> {
    let term = term.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let kept = running.affine(1.0 - weight, 0.0).map_err(to_runtime_error)?;
    (term.affine(weight, 0.0).map_err(to_runtime_error)? + kept).map_err(to_runtime_error)
}

fn add(running: &Tensor, term: &Tensor) -> Result<Tensor, TrainingError> {
    let term = term
        .to_dtype(DType::F32)
        .and_then(|t| t.reshape(()))
        .map_err(to_runtime_error)?;
    (running + term).map_err(to_runtime_error)
}

/// Multiplies the loss by the effective softmax temperature so a learned
/// temperature receives a calibration gradient.
pub struct TemperatureScale;

impl LossTerm for TemperatureScale {
    fn name(&self) -> &'static str {
        "temperature"
    }

    fn fold(&self, running: Tensor, ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        let Some(temperature) = &ctx.output.temperature else {
            return Ok((running, None));
        };
        let temperature = temperature
            .to_dtype(DType::F32)
            .and_then(|t| t.reshape(()))
            .map_err(to_runtime_error)?;
        let scaled = (&running * &temperature).map_err(to_runtime_error)?;
        Ok((scaled, Some(temperature)))
    }
}

pub struct ElasticWeightConsolidation {
    importance: f64,
    fisher: FisherEstimate,
}

impl ElasticWeightConsolidation {
    pub fn new(importance: f64, fisher: FisherEstimate) -> Self {
        Self { importance, fisher }
    }
}

impl LossTerm for ElasticWeightConsolidation {
    fn name(&self) -> &'static str {
        "ewc"
    }

    fn fold(&self, running: Tensor, _ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        let penalty = self
            .fisher
            .penalty()?
            .affine(self.importance, 0.0)
            .map_err(to_runtime_error)?;
        Ok((add(&running, &penalty)?, Some(penalty)))
    }
}

/// Label-smoothed cross entropy of the domain head against per-row labels.
pub struct DomainClassification {
    weight: f64,
    loss: CrossEntropyLoss,
}

impl DomainClassification {
    pub fn new(weight: f64, loss: CrossEntropyLoss) -> Self {
        Self { weight, loss }
    }
}

impl LossTerm for DomainClassification {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn fold(&self, running: Tensor, ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        let logits = ctx.output.domain_logits.as_ref().ok_or_else(|| {
            TrainingError::runtime("domain loss is configured but the model has no domain head")
        })?;
        let labels = ctx.batch.domain_labels.as_ref().ok_or_else(|| {
            TrainingError::runtime("domain loss is configured but the batch has no domain labels")
        })?;
        let domain = self.loss.compute(logits, labels)?.loss;
        Ok((blend(&running, &domain, self.weight)?, Some(domain)))
    }
}

/// Adds the vocabulary loss of every supervised intermediate layer.
pub struct AuxiliaryLayers {
    loss: CrossEntropyLoss,
}

impl AuxiliaryLayers {
    pub fn new(loss: CrossEntropyLoss) -> Self {
        Self { loss }
    }
}

impl LossTerm for AuxiliaryLayers {
    fn name(&self) -> &'static str {
        "auxiliary"
    }

    fn fold(&self, running: Tensor, ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        if ctx.output.auxiliary_logits.is_empty() {
            return Ok((running, None));
        }
        let mut total: Option<Tensor> = None;
        for logits in &ctx.output.auxiliary_logits {
            let layer = self.loss.compute(logits, &ctx.batch.labels)?.loss;
            total = Some(match total {
                Some(acc) => (acc + layer).map_err(to_runtime_error)?,
                None => layer,
            });
        }
        let Some(total) = total else {
            return Ok((running, None));
        };
        Ok((add(&running, &total)?, Some(total)))
    }
}

/// `(1-λ)·loss - λ·H` with `H` the mean per-position entropy of the
/// un-tempered distribution, summed over the final and auxiliary layers.
pub struct EntropyMaximization {
    weight: f64,
}

impl EntropyMaximization {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }
}

fn untempered(logits: &Tensor, output: &ModelOutput) -> Result<Tensor, TrainingError> {
    let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
    match &output.temperature {
        Some(temperature) => temperature
            .to_dtype(DType::F32)
            .and_then(|t| logits.broadcast_mul(&t))
            .map_err(to_runtime_error),
        None => Ok(logits),
    }
}

impl LossTerm for EntropyMaximization {
    fn name(&self) -> &'static str {
        "entropy"
    }

    fn fold(&self, running: Tensor, ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        let mask = label_mask(&ctx.batch.labels, ctx.pad_id)?;
        let mut entropy: Option<Tensor> = None;
        for logits in std::iter::once(&ctx.output.logits).chain(&ctx.output.auxiliary_logits) {
            let layer = masked_mean(&token_entropy(&untempered(logits, ctx.output)?)?, &mask)?;
            entropy = Some(match entropy {
                Some(acc) => (acc + layer).map_err(to_runtime_error)?,
                None => layer,
            });
        }
        let Some(entropy) = entropy else {
            return Ok((running, None));
        };
        let negated = entropy.neg().map_err(to_runtime_error)?;
        Ok((blend(&running, &negated, self.weight)?, Some(entropy)))
    }
}

/// Knowledge distillation from a frozen parent model.
pub struct DistillationTerm {
    parent: Box<dyn Seq2SeqModel>,
    weight: f64,
    temperature: f64,
    styles: Vec<DistillationStyle>,
    layer_mapping: Vec<LayerPair>,
}

impl DistillationTerm {
    pub fn new(parent: Box<dyn Seq2SeqModel>, config: &DistillationConfig) -> Self {
        parent.set_training(false);
        Self {
            parent,
            weight: config.weight,
            temperature: config.temperature,
            styles: config.styles.clone(),
            layer_mapping: config.layer_mapping.clone(),
        }
    }

    fn layer_pairs(&self, child: usize, parent: usize) -> Vec<LayerPair> {
        if self.layer_mapping.is_empty() {
            match (child.checked_sub(1), parent.checked_sub(1)) {
                (Some(child), Some(parent)) => vec![LayerPair { child, parent }],
                _ => Vec::new(),
            }
        } else {
            self.layer_mapping.clone()
        }
    }

    /// `T² · mean_non_pad(-Σ softmax(parent/T) · log_softmax(child/T))`.
    fn soft_targets(
        &self,
        child: &Tensor,
        parent: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let t = self.temperature;
        let child = child
            .to_dtype(DType::F32)
            .and_then(|c| c.affine(1.0 / t, 0.0))
            .and_then(|c| ops::log_softmax(&c, D::Minus1))
            .map_err(to_runtime_error)?;
        let parent = parent
            .to_dtype(DType::F32)
            .and_then(|p| p.affine(1.0 / t, 0.0))
            .and_then(|p| ops::softmax(&p, D::Minus1))
            .map_err(to_runtime_error)?;
        if child.dims() != parent.dims() {
            return Err(TrainingError::runtime(format!(
                "child logits {:?} and parent logits {:?} differ in shape",
                child.dims(),
                parent.dims()
            )));
        }
        let per_position = (parent * child)
            .and_then(|p| p.sum(D::Minus1))
            .and_then(|p| p.neg())
            .map_err(to_runtime_error)?;
        masked_mean(&per_position, mask)?
            .affine(t * t, 0.0)
            .map_err(to_runtime_error)
    }

    fn layer_mse(
        &self,
        child: &[Tensor],
        parent: &[Tensor],
        what: &str,
    ) -> Result<Option<Tensor>, TrainingError> {
        let mut total: Option<Tensor> = None;
        for pair in self.layer_pairs(child.len(), parent.len()) {
            let (Some(c), Some(p)) = (child.get(pair.child), parent.get(pair.parent)) else {
                return Err(TrainingError::runtime(format!(
                    "{what} distillation pair {}->{} is out of range",
                    pair.child, pair.parent
                )));
            };
            if c.dims() != p.dims() {
                return Err(TrainingError::runtime(format!(
                    "{what} distillation needs matching shapes, got {:?} and {:?}",
                    c.dims(),
                    p.dims()
                )));
            }
            let mse = c
                .to_dtype(DType::F32)
                .and_then(|c| c.sub(&p.to_dtype(DType::F32)?))
                .and_then(|d| d.sqr())
                .and_then(|d| d.mean_all())
                .map_err(to_runtime_error)?;
            total = Some(match total {
                Some(acc) => (acc + mse).map_err(to_runtime_error)?,
                None => mse,
            });
        }
        Ok(total)
    }
}

impl LossTerm for DistillationTerm {
    fn name(&self) -> &'static str {
        "distillation"
    }

    fn fold(&self, running: Tensor, ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        let parent = self
            .parent
            .forward(&ctx.batch.parent_inputs())
            .map_err(to_runtime_error)?;
        let detach = |tensors: &[Tensor]| tensors.iter().map(Tensor::detach).collect::<Vec<_>>();
        let mask = label_mask(&ctx.batch.labels, ctx.pad_id)?;

        let mut distill: Option<Tensor> = None;
        for style in &self.styles {
            let term = match style {
                DistillationStyle::CrossEntropy => Some(self.soft_targets(
                    &ctx.output.logits,
                    &parent.logits.detach(),
                    &mask,
                )?),
                DistillationStyle::Attention => self.layer_mse(
                    &ctx.output.cross_attentions,
                    &detach(&parent.cross_attentions),
                    "attention",
                )?,
                DistillationStyle::Hidden => self.layer_mse(
                    &ctx.output.hidden_states,
                    &detach(&parent.hidden_states),
                    "hidden-state",
                )?,
            };
            if let Some(term) = term {
                distill = Some(match distill {
                    Some(acc) => (acc + term).map_err(to_runtime_error)?,
                    None => term,
                });
            }
        }
        let Some(distill) = distill else {
            return Ok((running, None));
        };
        Ok((blend(&running, &distill, self.weight)?, Some(distill)))
    }
}

/// Adds the routing load-balancing loss reported by the model.
pub struct RoutingBalance;

impl LossTerm for RoutingBalance {
    fn name(&self) -> &'static str {
        "moe"
    }

    fn fold(&self, running: Tensor, ctx: &LossContext<'_>) -> Result<Folded, TrainingError> {
        match &ctx.output.moe_loss {
            Some(moe) => Ok((add(&running, moe)?, Some(moe.clone()))),
            None => Ok((running, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Batch, objective::scalar};
    use candle_core::Device;

    fn output() -> ModelOutput {
        let device = Device::Cpu;
        ModelOutput {
            logits: Tensor::new(&[[[1.0f32, 0.0], [0.0, 1.0]]], &device).unwrap(),
            auxiliary_logits: Vec::new(),
            domain_logits: Some(Tensor::new(&[[0.0f32, 0.0, 0.0]], &device).unwrap()),
            hidden_states: Vec::new(),
            cross_attentions: Vec::new(),
            moe_loss: Some(Tensor::new(0.25f32, &device).unwrap()),
            temperature: Some(Tensor::new(2.0f32, &device).unwrap()),
        }
    }

    fn batch() -> Batch {
        let device = Device::Cpu;
        let ids = Tensor::new(&[[1u32, 1]], &device).unwrap();
        Batch {
            input_ids: ids.clone(),
            attention_mask: ids.clone(),
            decoder_input_ids: ids.clone(),
            labels: ids,
            domain_labels: Some(Tensor::new(&[2u32], &device).unwrap()),
            parent_input_ids: None,
            parent_attention_mask: None,
            target_tokens: 2,
        }
    }

    fn fold(term: &dyn LossTerm, running: f32) -> (f32, Option<f32>) {
        let output = output();
        let batch = batch();
        let ctx = LossContext {
            output: &output,
            batch: &batch,
            pad_id: 0,
        };
        let running = Tensor::new(running, &Device::Cpu).unwrap();
        let (loss, value) = term.fold(running, &ctx).unwrap();
        (
            scalar(&loss).unwrap(),
            value.map(|value| scalar(&value).unwrap()),
        )
    }

    #[test]
    fn temperature_multiplies_the_loss() {
        let (loss, value) = fold(&TemperatureScale, 1.5);
        assert!((loss - 3.0).abs() < 1e-6);
        assert_eq!(value, Some(2.0));
    }

    #[test]
    fn domain_blends_with_uniform_logits() {
        let term = DomainClassification::new(0.25, CrossEntropyLoss::new());
        let (loss, value) = fold(&term, 1.0);
        let domain = (3.0f32).ln();
        assert!((value.unwrap() - domain).abs() < 1e-6);
        assert!((loss - (0.25 * domain + 0.75)).abs() < 1e-6);
    }

    #[test]
    fn routing_balance_is_added() {
        let (loss, _) = fold(&RoutingBalance, 1.0);
        assert!((loss - 1.25).abs() < 1e-6);
    }

    #[test]
    fn entropy_uses_untempered_logits() {
        let (_, value) = fold(&EntropyMaximization::new(0.1), 1.0);
        // Logits [2, 0] after undoing the temperature of 2.
        let p = 1.0 / (1.0 + (-2.0f32).exp());
        let expected = -(p * p.ln() + (1.0 - p) * (1.0 - p).ln());
        assert!((value.unwrap() - expected).abs() < 1e-5);
    }
}
