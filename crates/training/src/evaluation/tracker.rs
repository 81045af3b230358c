use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{config::EvaluationConfig, TrainingError};

/// Best-so-far bookkeeping for one task, or for the mean over all tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreRecord {
    pub name: String,
    pub best_score: f64,
    pub best_ctr: usize,
    pub best_eval_index: usize,
    /// `(score, ctr)` pairs, oldest first, at most `history_limit` long.
    pub history: VecDeque<(f64, usize)>,
    history_limit: usize,
}

impl ScoreRecord {
    pub fn new(name: impl Into<String>, history_limit: usize) -> Self {
        Self {
            name: name.into(),
            best_score: 0.0,
            best_ctr: 0,
            best_eval_index: 0,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Appends to the history and returns whether `score` is a strict
    /// improvement.
    pub fn observe(&mut self, score: f64, ctr: usize, eval_index: usize) -> bool {
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back((score, ctr));
        if score > self.best_score {
            self.best_score = score;
            self.best_ctr = ctr;
            self.best_eval_index = eval_index;
            true
        } else {
            false
        }
    }

    pub fn summary(&self) -> String {
        let entries: Vec<String> = self
            .history
            .iter()
            .map(|(score, ctr)| format!("[{score:.2}, {ctr}]"))
            .collect();
        format!("{}: [{}]", self.name, entries.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalDecision {
    Continue,
    /// Lower the learning rate; `attempt` is the new annealing count.
    Anneal { attempt: usize },
    Converged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundReport {
    pub eval_index: usize,
    pub global_score: f64,
    pub global_improved: bool,
    /// Indices of the tasks whose best improved.
    pub improved_tasks: Vec<usize>,
    pub stall: usize,
    pub decision: EvalDecision,
}

/// Patience and annealing policy over the global score.
///
/// A round stalls when `eval_index - best_eval_index` exceeds
/// `patience + attempts · increment`; a stalled round anneals while attempts
/// remain and converges otherwise.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    tasks: Vec<ScoreRecord>,
    global: ScoreRecord,
    eval_index: usize,
    annealing_attempts: usize,
    patience: usize,
    patience_increment: usize,
    max_annealing_attempts: usize,
}

impl ConvergenceTracker {
    pub fn new<I, S>(
        task_names: I,
        patience: usize,
        patience_increment: usize,
        max_annealing_attempts: usize,
        history_limit: usize,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tasks: task_names
                .into_iter()
                .map(|name| ScoreRecord::new(name, history_limit))
                .collect(),
            global: ScoreRecord::new("global", history_limit),
            eval_index: 0,
            annealing_attempts: 0,
            patience,
            patience_increment,
            max_annealing_attempts,
        }
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self::new(
            config.tasks.iter().map(|task| task.name.clone()),
            config.early_stop_checkpoints,
            config.additional_early_stop_checkpoints_per_anneal_step,
            config.max_annealing_attempts,
            config.history_limit,
        )
    }

    pub fn tasks(&self) -> &[ScoreRecord] {
        &self.tasks
    }

    pub fn global(&self) -> &ScoreRecord {
        &self.global
    }

    pub fn eval_index(&self) -> usize {
        self.eval_index
    }

    pub fn annealing_attempts(&self) -> usize {
        self.annealing_attempts
    }

    /// Records one evaluation round. `scores` follows task order.
    pub fn record(&mut self, ctr: usize, scores: &[f64]) -> Result<RoundReport, TrainingError> {
        if scores.len() != self.tasks.len() || scores.is_empty() {
            return Err(TrainingError::runtime(format!(
                "expected {} task scores, got {}",
                self.tasks.len(),
                scores.len()
            )));
        }
        let eval_index = self.eval_index;
        let improved_tasks = self
            .tasks
            .iter_mut()
            .zip(scores)
            .enumerate()
            .filter_map(|(index, (task, score))| {
                task.observe(*score, ctr, eval_index).then_some(index)
            })
            .collect();

        let global_score = scores.iter().sum::<f64>() / scores.len() as f64;
        let global_improved = self.global.observe(global_score, ctr, eval_index);

        let stall = eval_index - self.global.best_eval_index;
        let tolerance = self.patience + self.annealing_attempts * self.patience_increment;
        let decision = if stall <= tolerance {
            EvalDecision::Continue
        } else if self.annealing_attempts < self.max_annealing_attempts {
            self.annealing_attempts += 1;
            EvalDecision::Anneal {
                attempt: self.annealing_attempts,
            }
        } else {
            EvalDecision::Converged
        };

        self.eval_index += 1;
        Ok(RoundReport {
            eval_index,
            global_score,
            global_improved,
            improved_tasks,
            stall,
            decision,
        })
    }

    /// Global and per-task histories, one line each.
    pub fn history_summary(&self) -> Vec<String> {
        std::iter::once(&self.global)
            .chain(&self.tasks)
            .map(ScoreRecord::summary)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tracker: &mut ConvergenceTracker, scores: &[f64], every: usize) -> Vec<(usize, EvalDecision)> {
        scores
            .iter()
            .enumerate()
            .map(|(round, score)| {
                let ctr = round * every;
                (ctr, tracker.record(ctr, &[*score]).unwrap().decision)
            })
            .collect()
    }

    #[test]
    fn strict_improvement_only() {
        let mut record = ScoreRecord::new("t", 10);
        assert!(!record.observe(0.0, 0, 0));
        assert!(record.observe(3.0, 100, 1));
        assert!(!record.observe(3.0, 200, 2));
        assert_eq!((record.best_ctr, record.best_eval_index), (100, 1));
    }

    #[test]
    fn history_is_bounded() {
        let mut record = ScoreRecord::new("t", 2);
        for (i, score) in [1.0, 2.0, 3.0].into_iter().enumerate() {
            record.observe(score, i, i);
        }
        assert_eq!(record.history, VecDeque::from(vec![(2.0, 1), (3.0, 2)]));
    }

    #[test]
    fn flat_scores_without_annealing_converge_after_patience() {
        // Evaluations at ctr 0, 100, 200, ...; the best (12) is at ctr 100.
        let mut tracker = ConvergenceTracker::new(["dev"], 2, 0, 0, 100);
        let decisions = run(&mut tracker, &[10.0, 12.0, 11.0, 11.0, 11.0, 11.0], 100);

        assert_eq!(tracker.global().best_score, 12.0);
        assert_eq!(tracker.global().best_ctr, 100);
        let converged: Vec<usize> = decisions
            .iter()
            .filter(|(_, d)| *d == EvalDecision::Converged)
            .map(|(ctr, _)| *ctr)
            .collect();
        // Stall 3 > patience 2 first happens three rounds after the best.
        assert_eq!(converged.first(), Some(&400));
    }

    #[test]
    fn anneals_max_attempts_times_then_converges() {
        let patience = 2;
        let increment = 1;
        let attempts = 2;
        let mut tracker = ConvergenceTracker::new(["a", "b"], patience, increment, attempts, 100);
        tracker.record(0, &[5.0, 7.0]).unwrap();

        let mut anneals = Vec::new();
        let mut converged_at = None;
        for round in 1..20 {
            let report = tracker.record(round, &[1.0, 1.0]).unwrap();
            match report.decision {
                EvalDecision::Anneal { attempt } => anneals.push((round, attempt)),
                EvalDecision::Converged => {
                    converged_at = Some(round);
                    break;
                }
                EvalDecision::Continue => {}
            }
        }
        // Tolerances 2, 3, 4: anneal at stall 3 and 4, converge at stall 5.
        assert_eq!(anneals, vec![(3, 1), (4, 2)]);
        assert_eq!(converged_at, Some(patience + increment * attempts + 1));
    }

    #[test]
    fn global_score_is_the_task_mean() {
        let mut tracker = ConvergenceTracker::new(["a", "b"], 1, 0, 0, 10);
        let report = tracker.record(0, &[10.0, 20.0]).unwrap();
        assert_eq!(report.global_score, 15.0);
        assert!(report.global_improved);
        assert_eq!(report.improved_tasks, vec![0, 1]);
        assert!(tracker.record(1, &[1.0]).is_err());
    }
}
