use candle_core::{Result, Tensor, Var};

/// Host-side inputs for one encoder-decoder forward pass.
#[derive(Debug, Clone, Copy)]
pub struct Seq2SeqInputs<'a> {
    /// `(batch, src_len)` u32 token ids.
    pub input_ids: &'a Tensor,
    /// `(batch, src_len)` mask, 1 for real tokens and 0 for padding.
    pub attention_mask: &'a Tensor,
    /// `(batch, tgt_len)` u32 decoder input ids (shifted right labels).
    pub decoder_input_ids: &'a Tensor,
}

/// Everything a forward pass exposes to the training objective.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, tgt_len, vocab)` logits already divided by the softmax temperature.
    pub logits: Tensor,
    /// Tempered logits of every supervised intermediate decoder layer.
    pub auxiliary_logits: Vec<Tensor>,
    /// `(batch, num_domains)` logits when the model has a domain head.
    pub domain_logits: Option<Tensor>,
    /// Decoder states after every layer, `(batch, tgt_len, hidden)`.
    pub hidden_states: Vec<Tensor>,
    /// Decoder-to-encoder attention maps per layer, `(batch, tgt_len, src_len)`.
    pub cross_attentions: Vec<Tensor>,
    /// Load-balancing loss of the routing mixture, if any.
    pub moe_loss: Option<Tensor>,
    /// Scalar effective temperature the logits were divided by, when it is not
    /// the constant 1.
    pub temperature: Option<Tensor>,
}

/// A trainable sequence-to-sequence model.
///
/// Parameter names returned by [`Seq2SeqModel::named_parameters`] are the keys
/// used in checkpoints, so they must be stable across runs.
pub trait Seq2SeqModel: Send {
    fn forward(&self, inputs: &Seq2SeqInputs<'_>) -> Result<ModelOutput>;

    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&self, training: bool);

    fn is_training(&self) -> bool;

    fn vocab_size(&self) -> usize;
}
