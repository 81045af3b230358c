use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Error, Result, Tensor, Var, D};
use candle_nn::ops;

use crate::{
    block::{DecoderLayer, Projection},
    config::ModelConfig,
    params::ParameterStore,
    seq2seq::{ModelOutput, Seq2SeqInputs, Seq2SeqModel},
};

const MASK_NEG: f64 = -1e9;

/// Compact attention encoder-decoder with a tied output projection.
pub struct Model {
    config: ModelConfig,
    store: ParameterStore,
    embedding: Tensor,
    encoder: Projection,
    layers: Vec<DecoderLayer>,
    lm_bias: Tensor,
    domain_head: Option<Projection>,
    experts: Option<ExpertMixture>,
    learned_temperature: Option<Tensor>,
    training: AtomicBool,
}

struct ExpertMixture {
    gate: Projection,
    experts: Vec<Projection>,
}

impl Model {
    /// Builds the model; parameters are drawn from `config.seed`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut store = ParameterStore::new(config.seed, config.dtype, config.device.clone());
        let d = config.hidden_dim;

        let embedding = store.uniform("shared.embedding", (config.vocab_size, d), 0.1)?;
        let encoder = Projection::new(&mut store, "encoder.proj", d, d, true)?;
        let mut layers = Vec::with_capacity(config.n_layers);
        for index in 0..config.n_layers {
            layers.push(DecoderLayer::new(&mut store, index, d)?);
        }
        let lm_bias = store.zeros("lm_head.bias", config.vocab_size)?;

        let domain_head = if config.num_domains > 0 {
            Some(Projection::new(
                &mut store,
                "domain_head",
                d,
                config.num_domains,
                true,
            )?)
        } else {
            None
        };

        let experts = if config.num_experts > 0 {
            let gate = Projection::new(&mut store, "moe.gate", d, config.num_experts, false)?;
            let mut experts = Vec::with_capacity(config.num_experts);
            for index in 0..config.num_experts {
                experts.push(Projection::new(
                    &mut store,
                    &format!("moe.experts.{index}"),
                    d,
                    d,
                    true,
                )?);
            }
            Some(ExpertMixture { gate, experts })
        } else {
            None
        };

        // Learned in log space; exp keeps the temperature positive.
        let learned_temperature = if config.learn_temperature {
            Some(store.zeros("log_temperature", 1)?)
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            embedding,
            encoder,
            layers,
            lm_bias,
            domain_head,
            experts,
            learned_temperature,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let (batch, len) = ids.dims2()?;
        let flat = ids.flatten_all()?.to_dtype(DType::U32)?;
        self.embedding
            .index_select(&flat, 0)?
            .reshape((batch, len, self.config.hidden_dim))
    }

    fn maybe_dropout(&self, xs: Tensor) -> Result<Tensor> {
        match self.config.dropout_p {
            Some(p) if p > 0.0 && self.is_training() => ops::dropout(&xs, p),
            _ => Ok(xs),
        }
    }

    fn project_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        hidden
            .broadcast_matmul(&self.embedding.t()?.contiguous()?)?
            .broadcast_add(&self.lm_bias)
    }

    /// Effective temperature as a scalar tensor, or `None` when it is exactly 1.
    fn temperature(&self) -> Result<Option<Tensor>> {
        let fixed = self.config.softmax_temperature;
        match &self.learned_temperature {
            Some(log_t) => Ok(Some(log_t.exp()?.affine(fixed, 0.0)?.reshape(())?)),
            None if (fixed - 1.0).abs() > f64::EPSILON => Ok(Some(Tensor::new(
                fixed as f32,
                self.embedding.device(),
            )?
            .to_dtype(self.config.dtype)?)),
            None => Ok(None),
        }
    }
}

impl ExpertMixture {
    /// Soft mixture over experts; returns the residual update and the
    /// load-balancing loss `E · Σ_e mean(gate_e)²`.
    fn forward(&self, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = ops::softmax_last_dim(&self.gate.forward(hidden)?.contiguous()?)?;
        let n = self.experts.len();
        let mut mixed: Option<Tensor> = None;
        for (index, expert) in self.experts.iter().enumerate() {
            let weight = gates.narrow(D::Minus1, index, 1)?;
            let out = expert.forward(hidden)?.tanh()?.broadcast_mul(&weight)?;
            mixed = Some(match mixed {
                Some(acc) => (acc + out)?,
                None => out,
            });
        }
        let mixed = mixed.ok_or_else(|| Error::Msg("expert mixture has no experts".into()))?;
        let (batch, len, _) = gates.dims3()?;
        let importance = gates
            .reshape((batch * len, n))?
            .mean(0)?
            .sqr()?
            .sum_all()?
            .affine(n as f64, 0.0)?;
        Ok((mixed, importance))
    }
}

impl Seq2SeqModel for Model {
    fn forward(&self, inputs: &Seq2SeqInputs<'_>) -> Result<ModelOutput> {
        let mask = inputs.attention_mask.to_dtype(self.config.dtype)?;
        let (batch, src_len) = mask.dims2()?;

        let source = self.embed(inputs.input_ids)?;
        let encoder_states = self
            .maybe_dropout(self.encoder.forward(&source)?.tanh()?)?;

        let mask_bias = mask
            .affine(-MASK_NEG, MASK_NEG)?
            .reshape((batch, 1, src_len))?;

        let mut hidden = self.maybe_dropout(self.embed(inputs.decoder_input_ids)?)?;
        let mut hidden_states = Vec::with_capacity(self.layers.len());
        let mut cross_attentions = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, attention) = layer.forward(&hidden, &encoder_states, &mask_bias)?;
            hidden = next;
            hidden_states.push(hidden.clone());
            cross_attentions.push(attention);
        }

        let moe_loss = match &self.experts {
            Some(mixture) => {
                let (update, balance) = mixture.forward(&hidden)?;
                hidden = (hidden + update)?;
                Some(balance)
            }
            None => None,
        };

        let temperature = self.temperature()?;
        let temper = |logits: Tensor| -> Result<Tensor> {
            match &temperature {
                Some(t) => logits.broadcast_div(t),
                None => Ok(logits),
            }
        };

        let logits = temper(self.project_vocab(&hidden)?)?;
        let mut auxiliary_logits = Vec::with_capacity(self.config.auxiliary_layers.len());
        for &layer in &self.config.auxiliary_layers {
            auxiliary_logits.push(temper(self.project_vocab(&hidden_states[layer])?)?);
        }

        let domain_logits = match &self.domain_head {
            Some(head) => {
                let weights = mask.unsqueeze(2)?;
                let pooled = encoder_states
                    .broadcast_mul(&weights)?
                    .sum(1)?
                    .broadcast_div(&weights.sum(1)?.clamp(1.0, f64::MAX)?)?;
                Some(head.forward(&pooled)?)
            }
            None => None,
        };

        Ok(ModelOutput {
            logits,
            auxiliary_logits,
            domain_logits,
            hidden_states,
            cross_attentions,
            moe_loss,
            temperature,
        })
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.store.named()
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }
}
