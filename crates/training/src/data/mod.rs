//! Parallel-corpus batching.
//!
//! A [`Batch`] carries the encoder inputs, the teacher-forced decoder inputs
//! and the labels; label positions equal to the pad id are ignored by every
//! loss.

use std::{fs, path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use log::info;
use model::Seq2SeqInputs;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    config::{to_runtime_error, CorpusConfig, DataConfig},
    tokenizer::{language_token, TextCodec},
    TrainingError,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentencePair {
    pub source: String,
    pub target: String,
    pub target_lang: String,
    pub domain: Option<u32>,
    pub parent_source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub decoder_input_ids: Tensor,
    pub labels: Tensor,
    /// One label per row; present only when every row has a domain.
    pub domain_labels: Option<Tensor>,
    /// Inputs for the distillation parent when they differ from the child's.
    pub parent_input_ids: Option<Tensor>,
    pub parent_attention_mask: Option<Tensor>,
    pub target_tokens: usize,
}

impl Batch {
    pub fn model_inputs(&self) -> Seq2SeqInputs<'_> {
        Seq2SeqInputs {
            input_ids: &self.input_ids,
            attention_mask: &self.attention_mask,
            decoder_input_ids: &self.decoder_input_ids,
        }
    }

    /// Parent-side inputs; the child's own when no paired source exists.
    pub fn parent_inputs(&self) -> Seq2SeqInputs<'_> {
        match (&self.parent_input_ids, &self.parent_attention_mask) {
            (Some(input_ids), Some(attention_mask)) => Seq2SeqInputs {
                input_ids,
                attention_mask,
                decoder_input_ids: &self.decoder_input_ids,
            },
            _ => self.model_inputs(),
        }
    }

    pub fn rows(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }
}

/// Possibly infinite stream of training batches.
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Turns sentence pairs into padded id tensors.
#[derive(Clone)]
pub struct BatchEncoder {
    codec: Arc<dyn TextCodec>,
    max_source_length: usize,
    max_target_length: usize,
    device: Device,
}

impl BatchEncoder {
    pub fn new(
        codec: Arc<dyn TextCodec>,
        max_source_length: usize,
        max_target_length: usize,
        device: Device,
    ) -> Self {
        Self {
            codec,
            max_source_length: max_source_length.max(2),
            max_target_length: max_target_length.max(2),
            device,
        }
    }

    pub fn codec(&self) -> &Arc<dyn TextCodec> {
        &self.codec
    }

    /// `<2lang> source </s>`, or `source </s>` when the marker is unknown.
    pub fn encode_source(&self, text: &str, target_lang: &str) -> Result<Vec<u32>> {
        let marker = self.codec.control_token_id(&language_token(target_lang));
        let reserved = 1 + usize::from(marker.is_some());
        let mut ids = Vec::with_capacity(self.max_source_length);
        ids.extend(marker);
        ids.extend(
            self.codec
                .encode(text, self.max_source_length.saturating_sub(reserved))?,
        );
        ids.push(self.codec.eos_id());
        Ok(ids)
    }

    /// Padded `(ids, mask)` for a group of sources.
    pub fn encode_sources<'a, I>(&self, sources: I) -> Result<(Tensor, Tensor)>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let rows = sources
            .into_iter()
            .map(|(text, lang)| self.encode_source(text, lang))
            .collect::<Result<Vec<_>>>()?;
        let pad = self.codec.pad_id();
        let (ids, mask, width) = pad_rows(&rows, pad);
        let count = rows.len();
        Ok((
            Tensor::from_vec(ids, (count, width), &self.device).map_err(to_runtime_error)?,
            Tensor::from_vec(mask, (count, width), &self.device).map_err(to_runtime_error)?,
        ))
    }

    pub fn encode(&self, pairs: &[SentencePair]) -> Result<Batch> {
        if pairs.is_empty() {
            return Err(TrainingError::runtime("cannot build an empty batch"));
        }
        let pad = self.codec.pad_id();
        let (input_ids, attention_mask) = self.encode_sources(
            pairs
                .iter()
                .map(|pair| (pair.source.as_str(), pair.target_lang.as_str())),
        )?;

        let mut decoder_rows = Vec::with_capacity(pairs.len());
        let mut label_rows = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let target = self
                .codec
                .encode(&pair.target, self.max_target_length - 1)?;
            let mut decoder = Vec::with_capacity(target.len() + 1);
            decoder.push(self.codec.decoder_start_id());
            decoder.extend_from_slice(&target);
            let mut labels = target;
            labels.push(self.codec.eos_id());
            decoder_rows.push(decoder);
            label_rows.push(labels);
        }
        let (decoder_ids, _, width) = pad_rows(&decoder_rows, pad);
        let (labels, _, _) = pad_rows(&label_rows, pad);
        let target_tokens = label_rows.iter().map(Vec::len).sum();
        let rows = pairs.len();

        let domain_labels = pairs
            .iter()
            .map(|pair| pair.domain)
            .collect::<Option<Vec<u32>>>()
            .map(|domains| Tensor::from_vec(domains, rows, &self.device))
            .transpose()
            .map_err(to_runtime_error)?;

        let (parent_input_ids, parent_attention_mask) =
            match pairs.iter().map(|p| p.parent_source.as_deref()).collect::<Option<Vec<_>>>() {
                Some(parents) => {
                    let (ids, mask) = self.encode_sources(
                        parents
                            .into_iter()
                            .zip(pairs)
                            .map(|(text, pair)| (text, pair.target_lang.as_str())),
                    )?;
                    (Some(ids), Some(mask))
                }
                None => (None, None),
            };

        Ok(Batch {
            input_ids,
            attention_mask,
            decoder_input_ids: Tensor::from_vec(decoder_ids, (rows, width), &self.device)
                .map_err(to_runtime_error)?,
            labels: Tensor::from_vec(labels, (rows, width), &self.device)
                .map_err(to_runtime_error)?,
            domain_labels,
            parent_input_ids,
            parent_attention_mask,
            target_tokens,
        })
    }
}

/// Right-pads rows to the longest one; returns flat ids, flat mask and width.
pub fn pad_rows(rows: &[Vec<u32>], pad: u32) -> (Vec<u32>, Vec<u32>, usize) {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let mut ids = Vec::with_capacity(rows.len() * width);
    let mut mask = Vec::with_capacity(rows.len() * width);
    for row in rows {
        for index in 0..width {
            match row.get(index) {
                Some(id) => {
                    ids.push(*id);
                    mask.push(1);
                }
                None => {
                    ids.push(pad);
                    mask.push(0);
                }
            }
        }
    }
    (ids, mask, width)
}

/// Reads line-aligned files; trailing line-count mismatches are an error.
pub fn read_aligned(source: &Path, target: &Path) -> Result<Vec<(String, String)>> {
    let sources = read_lines(source)?;
    let targets = read_lines(target)?;
    if sources.len() != targets.len() {
        return Err(TrainingError::initialization(format!(
            "{} has {} lines but {} has {}",
            source.display(),
            sources.len(),
            target.display(),
            targets.len()
        )));
    }
    Ok(sources.into_iter().zip(targets).collect())
}

pub fn read_lines(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
    })?;
    Ok(contents.lines().map(|line| line.trim().to_string()).collect())
}

pub fn load_corpus(corpus: &CorpusConfig) -> Result<Vec<SentencePair>> {
    let aligned = read_aligned(&corpus.source, &corpus.target)?;
    let parents = match &corpus.parent_source {
        Some(path) => {
            let lines = read_lines(path)?;
            if lines.len() != aligned.len() {
                return Err(TrainingError::initialization(format!(
                    "{} is not line-aligned with {}",
                    path.display(),
                    corpus.source.display()
                )));
            }
            lines.into_iter().map(Some).collect()
        }
        None => vec![None; aligned.len()],
    };
    Ok(aligned
        .into_iter()
        .zip(parents)
        .filter(|((source, target), _)| !source.is_empty() && !target.is_empty())
        .map(|((source, target), parent_source)| SentencePair {
            source,
            target,
            target_lang: corpus.target_lang.clone(),
            domain: corpus.domain,
            parent_source,
        })
        .collect())
}

/// Reconstruction pairs: source to source (when its language is known) and
/// target to target.
pub fn to_denoising(pairs: &[SentencePair], source_lang: Option<&str>) -> Vec<SentencePair> {
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for pair in pairs {
        if let Some(lang) = source_lang {
            out.push(SentencePair {
                source: pair.source.clone(),
                target: pair.source.clone(),
                target_lang: lang.to_string(),
                domain: pair.domain,
                parent_source: None,
            });
        }
        out.push(SentencePair {
            source: pair.target.clone(),
            target: pair.target.clone(),
            target_lang: pair.target_lang.clone(),
            domain: pair.domain,
            parent_source: None,
        });
    }
    out
}

/// Shuffled, rank-sharded, endlessly cycling stream over sentence pairs.
pub struct ParallelCorpus {
    pairs: Vec<SentencePair>,
    encoder: BatchEncoder,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
    order: Vec<usize>,
    cursor: usize,
}

impl ParallelCorpus {
    /// Keeps every `world_size`-th pair starting at `rank`.
    pub fn new(
        pairs: Vec<SentencePair>,
        encoder: BatchEncoder,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let world_size = world_size.max(1);
        let pairs: Vec<SentencePair> = pairs
            .into_iter()
            .enumerate()
            .filter(|(index, _)| index % world_size == rank)
            .map(|(_, pair)| pair)
            .collect();
        if pairs.is_empty() {
            return Err(TrainingError::initialization(format!(
                "training corpus shard for rank {rank} is empty"
            )));
        }
        let mut corpus = Self {
            pairs,
            encoder,
            batch_size,
            shuffle,
            seed,
            epoch: 0,
            order: Vec::new(),
            cursor: 0,
        };
        corpus.prepare_epoch();
        Ok(corpus)
    }

    pub fn from_config(
        config: &DataConfig,
        encoder: BatchEncoder,
        seed: u64,
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let mut pairs = Vec::new();
        for corpus in &config.train {
            pairs.extend(load_corpus(corpus)?);
        }
        info!("loaded {} training pairs", pairs.len());
        Self::new(
            pairs,
            encoder,
            config.batch_size,
            config.shuffle,
            seed,
            rank,
            world_size,
        )
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Advances the stream past `batches` batches without encoding them, so a
    /// resumed run continues the data order where it stopped.
    pub fn skip_batches(&mut self, batches: usize) {
        let mut remaining = batches.saturating_mul(self.batch_size);
        while remaining > 0 {
            if self.cursor == self.order.len() {
                self.epoch += 1;
                self.prepare_epoch();
            }
            let taken = remaining.min(self.order.len() - self.cursor);
            self.cursor += taken;
            remaining -= taken;
        }
    }

    fn prepare_epoch(&mut self) {
        self.order = (0..self.pairs.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
    }
}

impl BatchSource for ParallelCorpus {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut selected = Vec::with_capacity(self.batch_size);
        while selected.len() < self.batch_size {
            if self.cursor == self.order.len() {
                self.epoch += 1;
                self.prepare_epoch();
            }
            selected.push(self.pairs[self.order[self.cursor]].clone());
            self.cursor += 1;
        }
        self.encoder.encode(&selected).map(Some)
    }
}
