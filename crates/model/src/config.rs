use candle_core::{DType, Device, Error, Result};

/// High-level configuration for assembling the attention encoder-decoder.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    /// Decoder layers whose states are additionally projected to the vocabulary.
    pub auxiliary_layers: Vec<usize>,
    /// Size of the domain classification head; zero disables it.
    pub num_domains: usize,
    /// Number of soft-routed experts in the output mixture; zero disables it.
    pub num_experts: usize,
    pub softmax_temperature: f64,
    pub learn_temperature: bool,
    pub dropout_p: Option<f32>,
    pub seed: u64,
    pub dtype: DType,
    pub device: Device,
}

impl ModelConfig {
    pub fn new(vocab_size: usize, hidden_dim: usize, n_layers: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim,
            n_layers,
            auxiliary_layers: Vec::new(),
            num_domains: 0,
            num_experts: 0,
            softmax_temperature: 1.0,
            learn_temperature: false,
            dropout_p: None,
            seed: 0,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size < 2 {
            return Err(Error::Msg("vocab_size must be at least 2".into()));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        for &layer in &self.auxiliary_layers {
            if layer + 1 >= self.n_layers {
                return Err(Error::Msg(format!(
                    "auxiliary layer {} must be below the final layer ({})",
                    layer,
                    self.n_layers - 1
                )));
            }
        }
        if self.num_experts == 1 {
            return Err(Error::Msg(
                "num_experts must be 0 (disabled) or at least 2".into(),
            ));
        }
        if self.softmax_temperature <= 0.0 || !self.softmax_temperature.is_finite() {
            return Err(Error::Msg("softmax_temperature must be positive".into()));
        }
        if let Some(p) = self.dropout_p {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg("dropout_p must be in [0, 1)".into()));
            }
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg("model dtype must be a floating point type".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_auxiliary_final_layer() {
        let mut config = ModelConfig::new(16, 8, 2);
        config.auxiliary_layers = vec![1];
        assert!(config.validate().is_err());
        config.auxiliary_layers = vec![0];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_single_expert() {
        let mut config = ModelConfig::new(16, 8, 1);
        config.num_experts = 1;
        assert!(config.validate().is_err());
    }
}
