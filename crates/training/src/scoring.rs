//! Corpus-level evaluation metrics.

use std::collections::HashMap;

use crate::{config::MetricKind, TrainingError};

/// Scores decoded hypotheses against references; higher is better.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// `sources` carries the un-corrected inputs for metrics that need them
    /// (grammatical error correction); the built-in metrics ignore it.
    fn score(
        &self,
        references: &[String],
        hypotheses: &[String],
        sources: Option<&[String]>,
    ) -> Result<f64, TrainingError>;
}

pub fn build_scorer(kind: MetricKind) -> Result<Box<dyn Scorer>, TrainingError> {
    match kind {
        MetricKind::Bleu => Ok(Box::new(Bleu::default())),
        MetricKind::Rouge => Ok(Box::new(RougeL)),
        MetricKind::M2 => Err(TrainingError::initialization(
            "the M2 metric has no built-in scorer; supply one through the Scorer trait",
        )),
    }
}

fn check_lengths(references: &[String], hypotheses: &[String]) -> Result<(), TrainingError> {
    if references.len() != hypotheses.len() {
        return Err(TrainingError::runtime(format!(
            "{} references but {} hypotheses",
            references.len(),
            hypotheses.len()
        )));
    }
    Ok(())
}

/// Corpus BLEU on whitespace tokens, 0 to 100, with the standard brevity
/// penalty and no smoothing.
#[derive(Debug, Clone, Copy)]
pub struct Bleu {
    pub max_order: usize,
}

impl Default for Bleu {
    fn default() -> Self {
        Self { max_order: 4 }
    }
}

fn ngram_counts<'t>(tokens: &'t [&'t str], order: usize) -> HashMap<&'t [&'t str], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= order {
        for window in tokens.windows(order) {
            *counts.entry(window).or_insert(0) += 1;
        }
    }
    counts
}

impl Scorer for Bleu {
    fn name(&self) -> &'static str {
        "BLEU"
    }

    fn score(
        &self,
        references: &[String],
        hypotheses: &[String],
        _sources: Option<&[String]>,
    ) -> Result<f64, TrainingError> {
        check_lengths(references, hypotheses)?;
        let mut matches = vec![0usize; self.max_order];
        let mut totals = vec![0usize; self.max_order];
        let mut hyp_len = 0usize;
        let mut ref_len = 0usize;

        for (reference, hypothesis) in references.iter().zip(hypotheses) {
            let ref_tokens: Vec<&str> = reference.split_whitespace().collect();
            let hyp_tokens: Vec<&str> = hypothesis.split_whitespace().collect();
            hyp_len += hyp_tokens.len();
            ref_len += ref_tokens.len();
            for order in 1..=self.max_order {
                let ref_counts = ngram_counts(&ref_tokens, order);
                let hyp_counts = ngram_counts(&hyp_tokens, order);
                for (gram, count) in &hyp_counts {
                    let clip = ref_counts.get(gram).copied().unwrap_or(0);
                    matches[order - 1] += (*count).min(clip);
                }
                totals[order - 1] += hyp_tokens.len().saturating_sub(order - 1);
            }
        }

        if hyp_len == 0 || matches.iter().any(|m| *m == 0) {
            return Ok(0.0);
        }
        let log_precision = matches
            .iter()
            .zip(&totals)
            .map(|(m, t)| (*m as f64 / *t as f64).ln())
            .sum::<f64>()
            / self.max_order as f64;
        let brevity = if hyp_len < ref_len {
            (1.0 - ref_len as f64 / hyp_len as f64).exp()
        } else {
            1.0
        };
        Ok(100.0 * brevity * log_precision.exp())
    }
}

/// Mean sentence-level ROUGE-L F-measure over whitespace tokens, 0 to 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct RougeL;

fn lcs_len(a: &[&str], b: &[&str]) -> usize {
    let mut previous = vec![0usize; b.len() + 1];
    let mut current = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            current[j + 1] = if x == y {
                previous[j] + 1
            } else {
                current[j].max(previous[j + 1])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

impl Scorer for RougeL {
    fn name(&self) -> &'static str {
        "ROUGE-L"
    }

    fn score(
        &self,
        references: &[String],
        hypotheses: &[String],
        _sources: Option<&[String]>,
    ) -> Result<f64, TrainingError> {
        check_lengths(references, hypotheses)?;
        if references.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = references
            .iter()
            .zip(hypotheses)
            .map(|(reference, hypothesis)| {
                let r: Vec<&str> = reference.split_whitespace().collect();
                let h: Vec<&str> = hypothesis.split_whitespace().collect();
                let lcs = lcs_len(&r, &h) as f64;
                if lcs == 0.0 {
                    return 0.0;
                }
                let precision = lcs / h.len() as f64;
                let recall = lcs / r.len() as f64;
                2.0 * precision * recall / (precision + recall)
            })
            .sum();
        Ok(total / references.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_corpus_scores_100_bleu() {
        let refs = lines(&["the cat sat on the mat", "a quick brown fox jumps"]);
        let score = Bleu::default().score(&refs, &refs, None).unwrap();
        assert!((score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn short_hypotheses_are_penalized() {
        let refs = lines(&["the cat sat on the mat today"]);
        let hyps = lines(&["the cat sat on the mat"]);
        let score = Bleu::default().score(&refs, &hyps, None).unwrap();
        let expected = 100.0 * (1.0f64 - 7.0 / 6.0).exp();
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn disjoint_output_scores_zero() {
        let refs = lines(&["one two three four"]);
        let hyps = lines(&["five six seven eight"]);
        assert_eq!(Bleu::default().score(&refs, &hyps, None).unwrap(), 0.0);
        assert_eq!(RougeL.score(&refs, &hyps, None).unwrap(), 0.0);
    }

    #[test]
    fn rouge_uses_longest_common_subsequence() {
        let refs = lines(&["a b c d"]);
        let hyps = lines(&["a x c d"]);
        // LCS = 3, precision = recall = 0.75.
        let score = RougeL.score(&refs, &hyps, None).unwrap();
        assert!((score - 0.75).abs() < 1e-12);
    }

    #[test]
    fn m2_needs_an_external_scorer() {
        assert!(build_scorer(MetricKind::M2).is_err());
        assert_eq!(build_scorer(MetricKind::Rouge).unwrap().name(), "ROUGE-L");
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let refs = lines(&["a"]);
        assert!(Bleu::default().score(&refs, &[], None).is_err());
    }
}
