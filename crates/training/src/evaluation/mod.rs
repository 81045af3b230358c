//! Held-out decoding, scoring and the early-stopping policy.

mod tracker;

pub use tracker::{ConvergenceTracker, EvalDecision, RoundReport, ScoreRecord};

use log::info;
use model::{greedy_decode, GenerationConfig, Seq2SeqModel};

use crate::{
    config::{to_runtime_error, EvalTaskConfig, EvaluationConfig},
    data::{read_lines, BatchEncoder},
    scoring::Scorer,
    TrainingError,
};

/// One development set, read fully at startup.
#[derive(Debug, Clone)]
pub struct EvalTask {
    pub name: String,
    pub target_lang: String,
    pub sources: Vec<String>,
    pub references: Vec<String>,
    /// Un-corrected inputs handed to the scorer, when configured.
    pub scorer_sources: Option<Vec<String>>,
}

impl EvalTask {
    /// Reads at most `limit` aligned lines.
    pub fn load(config: &EvalTaskConfig, limit: usize) -> Result<Self, TrainingError> {
        let mut sources = read_lines(&config.source)?;
        let mut references = read_lines(&config.reference)?;
        sources.truncate(limit);
        references.truncate(limit);
        if sources.len() != references.len() {
            return Err(TrainingError::initialization(format!(
                "evaluation task '{}' has {} sources but {} references",
                config.name,
                sources.len(),
                references.len()
            )));
        }
        if sources.is_empty() {
            return Err(TrainingError::initialization(format!(
                "evaluation task '{}' is empty",
                config.name
            )));
        }
        Ok(Self {
            name: config.name.clone(),
            target_lang: config.target_lang.clone(),
            scorer_sources: config.source_as_reference.then(|| sources.clone()),
            sources,
            references,
        })
    }
}

/// Decode length bound: a multiple of the source width when positive, an
/// absolute length when negative.
pub fn length_bound(source_len: usize, multiplier: f64) -> usize {
    if multiplier > 0.0 {
        (source_len as f64 * multiplier) as usize
    } else {
        (-multiplier) as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeSettings {
    pub batch_size: usize,
    pub max_length_multiplier: f64,
    pub min_length_multiplier: f64,
}

impl From<&EvaluationConfig> for DecodeSettings {
    fn from(config: &EvaluationConfig) -> Self {
        Self {
            batch_size: config.dev_batch_size.max(1),
            max_length_multiplier: config.max_decode_length_multiplier,
            min_length_multiplier: config.min_decode_length_multiplier,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvalRound {
    /// `(task name, score)` in task order.
    pub scores: Vec<(String, f64)>,
    pub report: RoundReport,
}

pub struct EvaluationController {
    tasks: Vec<EvalTask>,
    scorer: Box<dyn Scorer>,
    tracker: ConvergenceTracker,
    decode: DecodeSettings,
}

impl EvaluationController {
    pub fn new(
        tasks: Vec<EvalTask>,
        scorer: Box<dyn Scorer>,
        tracker: ConvergenceTracker,
        decode: DecodeSettings,
    ) -> Result<Self, TrainingError> {
        if tasks.is_empty() {
            return Err(TrainingError::initialization(
                "evaluation is enabled but no tasks are configured",
            ));
        }
        Ok(Self {
            tasks,
            scorer,
            tracker,
            decode,
        })
    }

    pub fn from_config(
        config: &EvaluationConfig,
        scorer: Box<dyn Scorer>,
    ) -> Result<Self, TrainingError> {
        let limit = config.max_eval_batches.saturating_mul(config.dev_batch_size.max(1));
        let tasks = config
            .tasks
            .iter()
            .map(|task| EvalTask::load(task, limit))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(
            tasks,
            scorer,
            ConvergenceTracker::from_config(config),
            DecodeSettings::from(config),
        )
    }

    pub fn tasks(&self) -> &[EvalTask] {
        &self.tasks
    }

    pub fn tracker(&self) -> &ConvergenceTracker {
        &self.tracker
    }

    pub fn scorer_name(&self) -> &'static str {
        self.scorer.name()
    }

    /// Greedy-decodes and detokenizes every source of `task`.
    pub fn decode_task(
        &self,
        model: &dyn Seq2SeqModel,
        encoder: &BatchEncoder,
        task: &EvalTask,
    ) -> Result<Vec<String>, TrainingError> {
        let codec = encoder.codec();
        let mut hypotheses = Vec::with_capacity(task.sources.len());
        for chunk in task.sources.chunks(self.decode.batch_size) {
            let (input_ids, attention_mask) = encoder.encode_sources(
                chunk
                    .iter()
                    .map(|source| (source.as_str(), task.target_lang.as_str())),
            )?;
            let width = input_ids.dims().get(1).copied().unwrap_or(0);
            let generation = GenerationConfig {
                decoder_start_id: codec.decoder_start_id(),
                eos_id: codec.eos_id(),
                pad_id: codec.pad_id(),
                max_length: length_bound(width, self.decode.max_length_multiplier).max(1),
                min_length: length_bound(width, self.decode.min_length_multiplier),
            };
            let decoded = greedy_decode(model, &input_ids, &attention_mask, &generation)
                .map_err(to_runtime_error)?;
            for ids in decoded {
                hypotheses.push(codec.decode(&ids)?);
            }
        }
        Ok(hypotheses)
    }

    /// Decodes and scores every task in inference mode, then updates the
    /// convergence policy.
    pub fn run_round(
        &mut self,
        model: &dyn Seq2SeqModel,
        encoder: &BatchEncoder,
        ctr: usize,
    ) -> Result<EvalRound, TrainingError> {
        let was_training = model.is_training();
        model.set_training(false);
        let scores = self.score_tasks(model, encoder);
        model.set_training(was_training);
        let scores = scores?;

        for (name, score) in &scores {
            info!(
                "{} score after {ctr} steps is {score:.2} for {name}",
                self.scorer.name()
            );
        }
        let values: Vec<f64> = scores.iter().map(|(_, score)| *score).collect();
        let report = self.tracker.record(ctr, &values)?;
        info!(
            "global {} score after {ctr} steps is {:.2}",
            self.scorer.name(),
            report.global_score
        );
        Ok(EvalRound { scores, report })
    }

    fn score_tasks(
        &self,
        model: &dyn Seq2SeqModel,
        encoder: &BatchEncoder,
    ) -> Result<Vec<(String, f64)>, TrainingError> {
        let mut scores = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let hypotheses = self.decode_task(model, encoder, task)?;
            let score = self.scorer.score(
                &task.references,
                &hypotheses,
                task.scorer_sources.as_deref(),
            )?;
            scores.push((task.name.clone(), score));
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_bounds_follow_the_multiplier_sign() {
        assert_eq!(length_bound(10, 2.0), 20);
        assert_eq!(length_bound(10, 0.15), 1);
        assert_eq!(length_bound(10, -64.0), 64);
    }
}
