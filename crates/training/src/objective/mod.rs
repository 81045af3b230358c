//! Composite training objective.
//!
//! The primary label-smoothed cross entropy is computed first; every optional
//! term then folds into the running loss in a fixed order: temperature, EWC,
//! domain, auxiliary layers, entropy, distillation, routing balance.

mod ewc;
mod terms;

pub use ewc::{estimate_fisher, FisherEstimate};
pub use terms::{
    AuxiliaryLayers, DistillationTerm, DomainClassification, ElasticWeightConsolidation,
    EntropyMaximization, RoutingBalance, TemperatureScale,
};

use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use model::{ModelOutput, Seq2SeqModel};

use crate::{
    config::{to_runtime_error, ModelSettings, ObjectiveConfig},
    data::Batch,
    loss::{CrossEntropyLoss, LossMetrics},
    TrainingError,
};

/// What every term sees while folding.
pub struct LossContext<'a> {
    pub output: &'a ModelOutput,
    pub batch: &'a Batch,
    pub pad_id: u32,
}

/// One optional component of the objective.
pub trait LossTerm: Send {
    fn name(&self) -> &'static str;

    /// Combines the running loss with this term.
    ///
    /// Returns the new running loss and the term's own value, or `None` for
    /// the value when the term did not apply to this batch.
    fn fold(
        &self,
        running: Tensor,
        ctx: &LossContext<'_>,
    ) -> Result<(Tensor, Option<Tensor>), TrainingError>;
}

#[derive(Debug, Clone)]
pub struct ObjectiveOutput {
    pub loss: Tensor,
    /// `(term, value)` pairs in fold order, primary first.
    pub breakdown: Vec<(&'static str, f32)>,
    pub metrics: LossMetrics,
}

pub struct ObjectiveAssembler {
    primary: CrossEntropyLoss,
    pad_id: u32,
    terms: Vec<Box<dyn LossTerm>>,
}

impl ObjectiveAssembler {
    pub fn new(primary: CrossEntropyLoss, pad_id: u32) -> Self {
        Self {
            primary,
            pad_id,
            terms: Vec::new(),
        }
    }

    /// Builds the assembler in the canonical term order.
    ///
    /// `fisher` and `parent` must be present when EWC and distillation are
    /// configured.
    pub fn from_config(
        objective: &ObjectiveConfig,
        model: &ModelSettings,
        pad_id: u32,
        fisher: Option<FisherEstimate>,
        parent: Option<Box<dyn Seq2SeqModel>>,
    ) -> Result<Self, TrainingError> {
        let primary = CrossEntropyLoss::new()
            .with_label_smoothing(objective.label_smoothing)?
            .with_ignore_index(Some(pad_id));
        let mut assembler = Self::new(primary.clone(), pad_id);

        if (model.softmax_temperature - 1.0).abs() > f64::EPSILON || model.temperature_calibration
        {
            assembler.push(TemperatureScale);
        }
        if let Some(ewc) = &objective.ewc {
            let fisher = fisher.ok_or_else(|| {
                TrainingError::initialization("EWC is configured but no Fisher estimate was given")
            })?;
            assembler.push(ElasticWeightConsolidation::new(ewc.importance, fisher));
        }
        if let Some(domain) = &objective.domain {
            let loss = CrossEntropyLoss::new().with_label_smoothing(objective.label_smoothing)?;
            assembler.push(DomainClassification::new(domain.weight, loss));
        }
        if objective.auxiliary_supervision && !model.auxiliary_layers.is_empty() {
            assembler.push(AuxiliaryLayers::new(primary));
        }
        if let Some(entropy) = &objective.entropy {
            assembler.push(EntropyMaximization::new(entropy.weight));
        }
        if let Some(distillation) = &objective.distillation {
            let parent = parent.ok_or_else(|| {
                TrainingError::initialization(
                    "distillation is configured but no parent model was given",
                )
            })?;
            assembler.push(DistillationTerm::new(parent, distillation));
        }
        if model.num_experts > 0 {
            assembler.push(RoutingBalance);
        }
        Ok(assembler)
    }

    pub fn push(&mut self, term: impl LossTerm + 'static) {
        self.terms.push(Box::new(term));
    }

    pub fn term_names(&self) -> Vec<&'static str> {
        self.terms.iter().map(|term| term.name()).collect()
    }

    pub fn primary(&self) -> &CrossEntropyLoss {
        &self.primary
    }

    pub fn compute(
        &self,
        output: &ModelOutput,
        batch: &Batch,
    ) -> Result<ObjectiveOutput, TrainingError> {
        let primary = self.primary.compute(&output.logits, &batch.labels)?;
        let mut breakdown = vec![("nll", primary.metrics.average_loss())];
        let ctx = LossContext {
            output,
            batch,
            pad_id: self.pad_id,
        };

        let mut loss = primary.loss;
        for term in &self.terms {
            let (next, value) = term.fold(loss, &ctx)?;
            loss = next;
            if let Some(value) = value {
                breakdown.push((term.name(), scalar(&value)?));
            }
        }

        Ok(ObjectiveOutput {
            loss,
            breakdown,
            metrics: primary.metrics,
        })
    }
}

pub(crate) fn scalar(tensor: &Tensor) -> Result<f32, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.reshape(()))
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)
}

/// `(batch, len)` f32 mask, 1 where the label is not padding.
pub(crate) fn label_mask(labels: &Tensor, pad_id: u32) -> Result<Tensor, TrainingError> {
    labels
        .to_dtype(DType::U32)
        .and_then(|t| t.ne(pad_id))
        .and_then(|t| t.to_dtype(DType::F32))
        .map_err(to_runtime_error)
}

/// Mean of `values` (shape `(batch, len)`) over the unmasked positions.
pub(crate) fn masked_mean(values: &Tensor, mask: &Tensor) -> Result<Tensor, TrainingError> {
    let count = scalar(&mask.sum_all().map_err(to_runtime_error)?)?;
    if count <= 0.0 {
        return Err(TrainingError::runtime("no non-padding positions in batch"));
    }
    (values * mask)
        .and_then(|t| t.sum_all())
        .and_then(|t| t.affine(1.0 / f64::from(count), 0.0))
        .map_err(to_runtime_error)
}

/// Per-position predictive entropy `-Σ p·log p`, shape `(batch, len)`.
pub(crate) fn token_entropy(logits: &Tensor) -> Result<Tensor, TrainingError> {
    let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
    let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;
    let probs = log_probs.exp().map_err(to_runtime_error)?;
    (probs * log_probs)
        .and_then(|t| t.sum(D::Minus1))
        .and_then(|t| t.neg())
        .map_err(to_runtime_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch(labels: &[[u32; 3]]) -> Batch {
        let device = Device::Cpu;
        let rows = labels.len();
        let ids = Tensor::zeros((rows, 3), DType::U32, &device).unwrap();
        Batch {
            input_ids: ids.clone(),
            attention_mask: ids.ones_like().unwrap(),
            decoder_input_ids: ids,
            labels: Tensor::new(labels.iter().collect::<Vec<_>>(), &device).unwrap(),
            domain_labels: Some(Tensor::new(&[1u32], &device).unwrap()),
            parent_input_ids: None,
            parent_attention_mask: None,
            target_tokens: 3,
        }
    }

    fn output(logits: Tensor) -> ModelOutput {
        ModelOutput {
            logits,
            auxiliary_logits: Vec::new(),
            domain_logits: None,
            hidden_states: Vec::new(),
            cross_attentions: Vec::new(),
            moe_loss: None,
            temperature: None,
        }
    }

    fn logits() -> Tensor {
        Tensor::new(
            &[[[1.0f32, 2.0, 0.5, -1.0], [0.0, 0.3, 2.5, 1.0], [0.7, 0.7, 0.7, 0.7]]],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn no_optional_terms_is_the_primary_loss() {
        let objective = ObjectiveConfig::default();
        let settings = ModelSettings::default();
        let assembler = ObjectiveAssembler::from_config(&objective, &settings, 0, None, None)
            .unwrap();
        assert!(assembler.term_names().is_empty());

        let batch = batch(&[[1, 2, 0]]);
        let out = assembler.compute(&output(logits()), &batch).unwrap();
        let direct = assembler
            .primary()
            .compute(&logits(), &batch.labels)
            .unwrap();
        assert_eq!(
            scalar(&out.loss).unwrap(),
            direct.metrics.average_loss()
        );
        assert_eq!(out.breakdown.len(), 1);
    }

    #[test]
    fn entropy_blend_rewards_uncertainty() {
        let mut assembler =
            ObjectiveAssembler::new(CrossEntropyLoss::new().with_ignore_index(Some(0)), 0);
        assembler.push(EntropyMaximization::new(0.5));
        let batch = batch(&[[1, 2, 3]]);
        let out = assembler.compute(&output(logits()), &batch).unwrap();

        let nll = out.breakdown[0].1;
        let (name, entropy) = out.breakdown[1];
        assert_eq!(name, "entropy");
        assert!(entropy > 0.0);
        let expected = 0.5 * nll - 0.5 * entropy;
        assert!((scalar(&out.loss).unwrap() - expected).abs() < 1e-5);
    }

    #[test]
    fn uniform_distribution_has_maximal_entropy() {
        let entropy = token_entropy(&logits()).unwrap().to_vec2::<f32>().unwrap();
        let max = (4.0f32).ln();
        assert!((entropy[0][2] - max).abs() < 1e-5);
        assert!(entropy[0][0] < max);
    }

    #[test]
    fn missing_fisher_is_rejected() {
        let objective = ObjectiveConfig {
            ewc: Some(crate::config::EwcConfig {
                importance: 1.0,
                samples: 1,
                source: Default::default(),
                denoising: false,
            }),
            ..ObjectiveConfig::default()
        };
        let result = ObjectiveAssembler::from_config(
            &objective,
            &ModelSettings::default(),
            0,
            None,
            None,
        );
        assert!(result.is_err());
    }
}
