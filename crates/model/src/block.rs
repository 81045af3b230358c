use candle_core::{Result, Tensor, D};
use candle_nn::ops;

use crate::params::ParameterStore;

/// Dense projection `x · W + b` over the trailing dimension.
#[derive(Debug, Clone)]
pub struct Projection {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Projection {
    pub fn new(
        store: &mut ParameterStore,
        prefix: &str,
        in_dim: usize,
        out_dim: usize,
        with_bias: bool,
    ) -> Result<Self> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let weight = store.uniform(&format!("{prefix}.weight"), (in_dim, out_dim), bound)?;
        let bias = if with_bias {
            Some(store.zeros(&format!("{prefix}.bias"), out_dim)?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = xs.broadcast_matmul(&self.weight)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(bias),
            None => Ok(out),
        }
    }
}

/// Decoder layer: scaled dot-product attention over the encoder states
/// followed by a residual tanh projection of `[state; context]`.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    index: usize,
    mix: Projection,
    scale: f64,
}

impl DecoderLayer {
    pub fn new(store: &mut ParameterStore, index: usize, hidden_dim: usize) -> Result<Self> {
        let mix = Projection::new(
            store,
            &format!("decoder.layers.{index}"),
            hidden_dim * 2,
            hidden_dim,
            true,
        )?;
        Ok(Self {
            index,
            mix,
            scale: 1.0 / (hidden_dim as f64).sqrt(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the new decoder states and the attention map.
    ///
    /// `mask_bias` is `(batch, 1, src_len)` with large negative values on padding.
    pub fn forward(
        &self,
        hidden: &Tensor,
        encoder_states: &Tensor,
        mask_bias: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let keys = encoder_states.transpose(1, 2)?.contiguous()?;
        let scores = hidden
            .contiguous()?
            .matmul(&keys)?
            .affine(self.scale, 0.0)?
            .broadcast_add(mask_bias)?;
        let attention = ops::softmax_last_dim(&scores.contiguous()?)?;
        let context = attention.matmul(&encoder_states.contiguous()?)?;
        let joined = Tensor::cat(&[hidden, &context], D::Minus1)?;
        let update = self.mix.forward(&joined)?.tanh()?;
        let next = (hidden + update)?;
        Ok((next, attention))
    }
}
