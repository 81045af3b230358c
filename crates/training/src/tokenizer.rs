use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    str::FromStr,
};

use serde_json::json;
use tokenizers::{AddedToken, Tokenizer};

use crate::{config::TokenizerConfig, TrainingError};

const UNK_TOKEN: &str = "<unk>";

/// Text to ids and back, plus the special ids the trainer relies on.
pub trait TextCodec: Send + Sync {
    /// Encodes without special tokens, truncated to `max_len` ids.
    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>, TrainingError>;

    /// Decodes, dropping special and control tokens.
    fn decode(&self, ids: &[u32]) -> Result<String, TrainingError>;

    fn vocab_size(&self) -> usize;

    fn pad_id(&self) -> u32;

    fn eos_id(&self) -> u32;

    fn decoder_start_id(&self) -> u32;

    /// Adds control tokens (e.g. target-language markers) as special tokens.
    fn register_control_tokens(&mut self, tokens: &[String]) -> Result<(), TrainingError>;

    fn control_token_id(&self, token: &str) -> Option<u32>;
}

/// Target-language marker, `<2hi>` for `hi`.
pub fn language_token(lang: &str) -> String {
    format!("<2{lang}>")
}

/// [`TextCodec`] over a HuggingFace tokenizer.
#[derive(Clone)]
pub struct HfTokenizer {
    inner: Tokenizer,
    pad_id: u32,
    eos_id: u32,
    decoder_start_id: u32,
    control: HashMap<String, u32>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path, config: &TokenizerConfig) -> Result<Self, TrainingError> {
        let inner = Tokenizer::from_file(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_tokenizer(inner, config)
    }

    pub fn from_json_str(json: &str, config: &TokenizerConfig) -> Result<Self, TrainingError> {
        let inner = Tokenizer::from_str(json).map_err(|err| {
            TrainingError::initialization(format!("failed to parse tokenizer json: {err}"))
        })?;
        Self::from_tokenizer(inner, config)
    }

    /// Whitespace word-level tokenizer over the `max_words` most frequent
    /// words of `lines`; used when no tokenizer file is configured.
    pub fn word_level<'a, I>(
        lines: I,
        max_words: usize,
        config: &TokenizerConfig,
    ) -> Result<Self, TrainingError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in lines {
            for word in line.split_whitespace() {
                *counts.entry(word).or_default() += 1;
            }
        }
        let mut words: Vec<(&str, usize)> = counts.into_iter().collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let specials = [
            config.pad_token.as_str(),
            config.eos_token.as_str(),
            config.decoder_start_token.as_str(),
            UNK_TOKEN,
        ];
        let mut vocab: BTreeMap<String, u32> = BTreeMap::new();
        let mut added_tokens = Vec::new();
        for token in specials {
            if vocab.contains_key(token) {
                continue;
            }
            let id = vocab.len() as u32;
            vocab.insert(token.to_string(), id);
            added_tokens.push(json!({
                "id": id,
                "content": token,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            }));
        }
        for (word, _) in words.into_iter().take(max_words) {
            if !vocab.contains_key(word) {
                let id = vocab.len() as u32;
                vocab.insert(word.to_string(), id);
            }
        }

        let document = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added_tokens,
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": vocab,
                "unk_token": UNK_TOKEN,
            },
        });
        Self::from_json_str(&document.to_string(), config)
    }

    fn from_tokenizer(inner: Tokenizer, config: &TokenizerConfig) -> Result<Self, TrainingError> {
        let lookup = |token: &str| {
            inner.token_to_id(token).ok_or_else(|| {
                TrainingError::initialization(format!("tokenizer has no id for '{token}'"))
            })
        };
        let pad_id = lookup(&config.pad_token)?;
        let eos_id = lookup(&config.eos_token)?;
        let decoder_start_id = lookup(&config.decoder_start_token)?;
        Ok(Self {
            inner,
            pad_id,
            eos_id,
            decoder_start_id,
            control: HashMap::new(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), TrainingError> {
        self.inner.save(path, true).map_err(|err| {
            TrainingError::runtime(format!("failed to save tokenizer to {}: {err}", path.display()))
        })
    }
}

impl TextCodec for HfTokenizer {
    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>, TrainingError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|err| TrainingError::runtime(format!("tokenization failed: {err}")))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(max_len);
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String, TrainingError> {
        self.inner
            .decode(ids, true)
            .map_err(|err| TrainingError::runtime(format!("detokenization failed: {err}")))
    }

    /// One past the largest id, added tokens included.
    fn vocab_size(&self) -> usize {
        self.inner
            .get_vocab(true)
            .values()
            .max()
            .map_or(0, |id| *id as usize + 1)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn decoder_start_id(&self) -> u32 {
        self.decoder_start_id
    }

    fn register_control_tokens(&mut self, tokens: &[String]) -> Result<(), TrainingError> {
        let added: Vec<AddedToken> = tokens
            .iter()
            .map(|token| AddedToken::from(token.clone(), true))
            .collect();
        self.inner.add_special_tokens(&added);
        for token in tokens {
            let id = self.inner.token_to_id(token).ok_or_else(|| {
                TrainingError::initialization(format!("control token '{token}' was not registered"))
            })?;
            self.control.insert(token.clone(), id);
        }
        Ok(())
    }

    fn control_token_id(&self, token: &str) -> Option<u32> {
        self.control.get(token).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> HfTokenizer {
        let lines = ["the cat sat", "the dog sat down"];
        HfTokenizer::word_level(lines, 100, &TokenizerConfig::default()).unwrap()
    }

    #[test]
    fn word_level_round_trips_known_words() {
        let codec = codec();
        let ids = codec.encode("the dog sat", 16).unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(codec.decode(&ids).unwrap(), "the dog sat");
        assert_eq!(codec.pad_id(), 0);
        assert_ne!(codec.eos_id(), codec.decoder_start_id());
    }

    #[test]
    fn encode_truncates() {
        let codec = codec();
        assert_eq!(codec.encode("the cat sat down", 2).unwrap().len(), 2);
    }

    #[test]
    fn control_tokens_are_special() {
        let mut codec = codec();
        let before = codec.vocab_size();
        codec
            .register_control_tokens(&[language_token("hi")])
            .unwrap();
        let id = codec.control_token_id("<2hi>").unwrap();
        assert_eq!(codec.vocab_size(), before + 1);
        let cat = codec.encode("cat", 4).unwrap()[0];
        assert_eq!(codec.decode(&[id, cat, codec.eos_id()]).unwrap(), "cat");
    }
}
