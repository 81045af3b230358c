use candle_core::{DType, Error, IndexOp, Result, Tensor};

use crate::seq2seq::{Seq2SeqInputs, Seq2SeqModel};

/// Length bounds and special ids for greedy decoding.
#[derive(Debug, Clone, Copy)]
pub struct GenerationConfig {
    pub decoder_start_id: u32,
    pub eos_id: u32,
    pub pad_id: u32,
    pub max_length: usize,
    pub min_length: usize,
}

/// Greedy decoding for a whole batch.
///
/// Every step re-runs the decoder on the full prefix. End-of-sequence is
/// masked out until `min_length` tokens have been produced; finished rows are
/// padded. Returned sequences exclude the start token and the eos token.
pub fn greedy_decode(
    model: &dyn Seq2SeqModel,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    config: &GenerationConfig,
) -> Result<Vec<Vec<u32>>> {
    let (batch, _) = input_ids.dims2()?;
    let device = input_ids.device();
    let max_length = config.max_length.max(1);
    let min_length = config.min_length.min(max_length);

    let mut prefixes: Vec<Vec<u32>> = vec![vec![config.decoder_start_id]; batch];
    let mut finished = vec![false; batch];

    for step in 0..max_length {
        if finished.iter().all(|done| *done) {
            break;
        }
        let width = step + 1;
        let flat: Vec<u32> = prefixes.iter().flatten().copied().collect();
        let decoder_input_ids = Tensor::from_vec(flat, (batch, width), device)?;
        let output = model.forward(&Seq2SeqInputs {
            input_ids,
            attention_mask,
            decoder_input_ids: &decoder_input_ids,
        })?;
        let last = output
            .logits
            .i((.., width - 1))?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;

        for (row, scores) in last.iter().enumerate() {
            let next = if finished[row] {
                config.pad_id
            } else {
                let allow_eos = step >= min_length;
                argmax_excluding(scores, (!allow_eos).then_some(config.eos_id)).ok_or_else(
                    || Error::Msg("decoder produced an empty score vector".into()),
                )?
            };
            if next == config.eos_id {
                finished[row] = true;
            }
            prefixes[row].push(next);
        }
    }

    Ok(prefixes
        .into_iter()
        .map(|prefix| {
            prefix
                .into_iter()
                .skip(1)
                .take_while(|id| *id != config.eos_id)
                .collect()
        })
        .collect())
}

fn argmax_excluding(scores: &[f32], excluded: Option<u32>) -> Option<u32> {
    scores
        .iter()
        .enumerate()
        .filter(|(index, _)| Some(*index as u32) != excluded)
        .fold(None, |best: Option<(usize, f32)>, (index, &score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::argmax_excluding;

    #[test]
    fn argmax_skips_excluded_token() {
        let scores = [0.1, 3.0, 2.0];
        assert_eq!(argmax_excluding(&scores, None), Some(1));
        assert_eq!(argmax_excluding(&scores, Some(1)), Some(2));
    }
}
