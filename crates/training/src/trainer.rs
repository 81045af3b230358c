use std::{fs, path::Path, sync::Arc};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device, Var,
};
use log::{info, warn};
use model::{Model, Seq2SeqModel};

use crate::{
    checkpoint::{self, CheckpointStore, LoadMode, SavedProgress, TrainingState},
    config::{
        to_runtime_error, CheckpointConfig, DevicePreference, EwcDataSource, ModelSettings,
        TrainingConfig,
    },
    control::ControlPlane,
    coordination::ProcessGroup,
    data::{load_corpus, read_lines, to_denoising, BatchEncoder, BatchSource, ParallelCorpus, SentencePair},
    evaluation::{EvalDecision, EvalTask, EvaluationController},
    logging::{Logger, LoggingSettings},
    loss::CrossEntropyLoss,
    metrics::TrainingMetrics,
    objective::{estimate_fisher, FisherEstimate, ObjectiveAssembler},
    optimizer::{AdamWConfig, GradientScaler, LossScaleConfig, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{anneal, fast_forward_to, LRScheduler, WarmupSchedule},
    scoring::{build_scorer, Scorer},
    step::{CompletedStep, StepExecutor, StepOutcome},
    tokenizer::{language_token, HfTokenizer, TextCodec},
    TrainingError,
};

const DEFAULT_MAX_WORDS: usize = 32_000;
const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// Why a worker left the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The leader raised the quit flag (convergence or a shutdown request).
    QuitFlag,
    /// `runtime.max_steps` optimizer steps were taken.
    StepBudget,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub ctr: usize,
    pub stop: StopReason,
    /// Best global score; leader with evaluation enabled only.
    pub best_score: Option<f64>,
    pub annealing_attempts: usize,
}

/// Everything a full checkpoint record restores.
struct Replica {
    model: Model,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    executor: StepExecutor,
    ctr: usize,
}

impl Replica {
    fn training_state(&self) -> TrainingState<'_> {
        TrainingState {
            model: &self.model,
            optimizer: &self.optimizer,
            scheduler: self.scheduler.as_ref(),
            scaler: self.executor.scaler(),
            ctr: self.ctr,
        }
    }

    fn restore(&mut self, progress: SavedProgress) -> Result<(), TrainingError> {
        self.optimizer.load_state(progress.optimizer)?;
        self.scheduler.load_state(&progress.scheduler);
        self.optimizer
            .set_learning_rate(self.scheduler.learning_rate());
        self.executor.scaler_mut().load_state(progress.scaler);
        self.ctr = progress.ctr;
        Ok(())
    }
}

/// One worker of a training run.
///
/// Construction establishes the shared initial state (fresh, resumed or
/// pretrained) and must be entered by every worker of the group; so must
/// [`Trainer::train_with_shutdown`].
pub struct Trainer {
    config: TrainingConfig,
    group: Box<dyn ProcessGroup>,
    replica: Replica,
    encoder: BatchEncoder,
    corpus: ParallelCorpus,
    objective: ObjectiveAssembler,
    store: CheckpointStore,
    control: ControlPlane,
    evaluation: Option<EvaluationController>,
    logger: Logger,
    metrics: TrainingMetrics,
    last_saved: Option<usize>,
}

impl Trainer {
    pub fn new(config: TrainingConfig, group: Box<dyn ProcessGroup>) -> Result<Self, TrainingError> {
        Self::build(config, group, None)
    }

    /// Like [`Trainer::new`] with a caller-supplied metric, e.g. an M2 scorer.
    pub fn with_scorer(
        config: TrainingConfig,
        group: Box<dyn ProcessGroup>,
        scorer: Box<dyn Scorer>,
    ) -> Result<Self, TrainingError> {
        Self::build(config, group, Some(scorer))
    }

    fn build(
        config: TrainingConfig,
        mut group: Box<dyn ProcessGroup>,
        scorer: Option<Box<dyn Scorer>>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let is_leader = group.is_leader();
        let rank = group.rank();
        let world_size = group.world_size();
        if is_leader {
            info!("starting worker group of {world_size}");
        }

        let device = select_device(config.runtime.device);
        let tokenizer = build_tokenizer(&config)?;
        let vocab_size = resolve_vocab_size(&config.model, tokenizer.vocab_size())?;
        let store = CheckpointStore::from_training_config(&config)?;
        if is_leader {
            let dir = store.deploy_dir();
            fs::create_dir_all(&dir)?;
            tokenizer.save(&dir.join(TOKENIZER_FILENAME))?;
        }
        let codec: Arc<dyn TextCodec> = Arc::new(tokenizer);
        let pad_id = codec.pad_id();
        let encoder = BatchEncoder::new(
            codec,
            config.data.max_source_length,
            config.data.max_target_length,
            device.clone(),
        );

        let model = build_model(&config.model, vocab_size, &config, &device)?;
        model.set_training(true);
        let mut optimizer = TrainerOptimizer::new(
            model.named_parameters(),
            AdamWConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from(&config.optimizer),
        )?;
        let mut scheduler: Box<dyn LRScheduler> = Box::new(WarmupSchedule::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate as f64,
            config.scheduler_horizon(),
        )?);
        let skipped = fast_forward_to(
            scheduler.as_mut(),
            config.scheduler.initial_min_lr,
            config.scheduler.anneal_iteration_cap,
        );
        if skipped > 0 && is_leader {
            info!(
                "advanced the learning rate schedule {skipped} steps to reach {:.3e}",
                scheduler.learning_rate()
            );
        }
        let scaler = GradientScaler::with_config(
            LossScaleConfig {
                initial_scale: config.runtime.initial_loss_scale,
                ..LossScaleConfig::default()
            },
            config.runtime.precision,
        );
        optimizer.set_learning_rate(scheduler.learning_rate());
        let mut replica = Replica {
            model,
            optimizer,
            scheduler,
            executor: StepExecutor::new(config.data.gradient_accumulation_steps, scaler),
            ctr: 0,
        };

        let control = ControlPlane::new(config.checkpoint.model_path.clone(), is_leader);
        establish_initial_state(
            &mut replica,
            &store,
            &control,
            &config.checkpoint,
            group.as_mut(),
        )?;

        let fisher = estimate_ewc_fisher(&config, &encoder, &replica, group.as_mut())?;
        let parent = build_parent(&config, vocab_size, &device)?;
        let objective =
            ObjectiveAssembler::from_config(&config.objective, &config.model, pad_id, fisher, parent)?;
        if is_leader {
            let mut terms = vec!["nll"];
            terms.extend(objective.term_names());
            info!("objective terms: {}", terms.join(", "));
        }

        let mut corpus = ParallelCorpus::from_config(
            &config.data,
            encoder.clone(),
            config.runtime.seed,
            rank,
            world_size,
        )?;
        // One batch per micro-step already taken.
        corpus.skip_batches(replica.ctr * replica.executor.accumulation_steps());

        let evaluation = if is_leader && config.evaluation.enabled {
            let scorer = match scorer {
                Some(scorer) => scorer,
                None => build_scorer(config.evaluation.metric)?,
            };
            let controller = EvaluationController::from_config(&config.evaluation, scorer)?;
            info!(
                "evaluating {} every {} steps",
                controller.scorer_name(),
                config.evaluation.every_n_steps
            );
            Some(controller)
        } else {
            None
        };
        let logger = Logger::new(&LoggingSettings::from_config(&config.runtime), is_leader)?;

        Ok(Self {
            config,
            group,
            replica,
            encoder,
            corpus,
            objective,
            store,
            control,
            evaluation,
            logger,
            metrics: TrainingMetrics::new(),
            last_saved: None,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Optimizer steps taken so far, restored ones included.
    pub fn ctr(&self) -> usize {
        self.replica.ctr
    }

    pub fn model(&self) -> &Model {
        &self.replica.model
    }

    pub fn learning_rate(&self) -> f64 {
        self.replica.scheduler.learning_rate()
    }

    /// Steps the learning rate schedule has advanced, fast-forwards included.
    pub fn schedule_position(&self) -> usize {
        self.replica.scheduler.position()
    }

    pub fn train(&mut self) -> Result<RunSummary, TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs until the quit flag is raised or the step budget is spent.
    ///
    /// `should_stop` is polled before every micro-batch; on the leader a
    /// request is turned into a raised quit flag at the next cadence.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<RunSummary, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let max_steps = self.config.runtime.max_steps;
        let mut stop_requested = false;
        let mut breakdown = Vec::new();

        let stop = loop {
            if !stop_requested && should_stop() {
                stop_requested = true;
                if self.group.is_leader() {
                    info!("shutdown requested; stopping at the next checkpoint");
                }
            }
            if self.replica.executor.is_idle() {
                if self.at_cadence() && self.run_cadence(stop_requested)? {
                    break StopReason::QuitFlag;
                }
                if self.replica.ctr >= max_steps {
                    break StopReason::StepBudget;
                }
            }

            let batch = self
                .corpus
                .next_batch()?
                .ok_or_else(|| TrainingError::runtime("training stream ended"))?;
            let output = self
                .replica
                .model
                .forward(&batch.model_inputs())
                .map_err(to_runtime_error)?;
            let objective = self.objective.compute(&output, &batch)?;
            breakdown = objective.breakdown;

            let replica = &mut self.replica;
            let outcome = replica.executor.micro_step(
                &objective.loss,
                batch.target_tokens,
                &mut replica.optimizer,
                replica.scheduler.as_mut(),
                self.group.as_mut(),
            )?;
            if let StepOutcome::Completed(step) = outcome {
                replica.ctr += 1;
                self.after_step(&step, &breakdown);
            }
        };

        self.finish(stop)
    }

    fn after_step(&mut self, step: &CompletedStep, breakdown: &[(&'static str, f32)]) {
        let ctr = self.replica.ctr;
        if !step.applied && self.group.is_leader() {
            warn!(
                "skipped update at ctr {ctr}: non-finite gradients (loss scale {})",
                step.loss_scale
            );
        }
        let snapshot = self.metrics.record_step(
            step.target_tokens as u64,
            f64::from(step.loss),
            step.grad_norm,
            step.applied,
        );
        self.logger
            .log_training_step(ctr, step.learning_rate, &snapshot, breakdown);
        if ctr % self.config.runtime.log_every_n_steps == 0 {
            let window = self.metrics.drain_window();
            self.logger.log_window(ctr, step.learning_rate, &window);
        }
    }

    fn at_cadence(&self) -> bool {
        let ctr = self.replica.ctr;
        let evaluation = &self.config.evaluation;
        if evaluation.enabled {
            ctr % evaluation.every_n_steps == 0
        } else {
            ctr > 0 && ctr % evaluation.no_eval_save_every == 0
        }
    }

    /// Evaluate (leader), save latest, barrier, then every worker reads the
    /// quit flag. Returns `true` when the run must end.
    fn run_cadence(&mut self, stop_requested: bool) -> Result<bool, TrainingError> {
        if self.group.is_leader() {
            if self.evaluation.is_some() {
                self.evaluate()?;
            }
            if stop_requested {
                self.control.quit_flag().raise()?;
            }
            self.save_latest()?;
        }
        self.group.barrier()?;

        if self.control.quit_flag().is_raised()? {
            return Ok(true);
        }
        if self.config.evaluation.enabled {
            self.reload_latest()?;
        }
        Ok(false)
    }

    /// One evaluation round plus its side effects: best records, deploy
    /// promotion, then annealing or the quit flag.
    fn evaluate(&mut self) -> Result<(), TrainingError> {
        let ctr = self.replica.ctr;
        let Some(controller) = self.evaluation.as_mut() else {
            return Ok(());
        };
        let round = controller.run_round(&self.replica.model, &self.encoder, ctr)?;
        let summary = (round.report.decision == EvalDecision::Converged)
            .then(|| controller.tracker().history_summary());
        self.logger.log_evaluation(ctr, &round);

        // Best records hold the state from before any annealing below.
        for &index in &round.report.improved_tasks {
            let (task, score) = &round.scores[index];
            let path = self.store.best_path(Some(task.as_str()), ctr);
            self.save_record(&path)?;
            info!("new best {score:.2} for {task}, saved to {}", path.display());
        }
        if round.report.global_improved {
            let path = self.store.best_path(None, ctr);
            self.save_record(&path)?;
            if !self.store.keeps_numbered_snapshots() {
                let deployed = self.store.promote_to_deploy(&path)?;
                info!("promoted global best to {}", deployed.display());
            }
        }

        match round.report.decision {
            EvalDecision::Continue => {}
            EvalDecision::Anneal { attempt } => {
                let outcome = anneal(
                    self.replica.scheduler.as_mut(),
                    self.config.evaluation.learning_rate_scaling,
                    self.config.scheduler.anneal_iteration_cap,
                );
                self.replica
                    .optimizer
                    .set_learning_rate(outcome.learning_rate);
                info!(
                    "no improvement for {} evaluations; annealing attempt {attempt}/{} lowers \
                     the learning rate from {:.3e} to {:.3e}",
                    round.report.stall,
                    self.config.evaluation.max_annealing_attempts,
                    outcome.previous_lr,
                    outcome.learning_rate
                );
            }
            EvalDecision::Converged => {
                info!("training converged after {ctr} steps");
                for line in summary.unwrap_or_default() {
                    info!("{line}");
                }
                self.control.quit_flag().raise()?;
            }
        }
        Ok(())
    }

    fn save_record(&self, path: &Path) -> Result<(), TrainingError> {
        self.store.save(&self.replica.training_state(), path)?;
        Ok(())
    }

    fn save_latest(&mut self) -> Result<(), TrainingError> {
        let ctr = self.replica.ctr;
        let latest = self.store.latest_path().to_path_buf();
        self.save_record(&latest)?;
        if self.store.keeps_numbered_snapshots() {
            self.save_record(&self.store.numbered_path(ctr))?;
        }
        self.last_saved = Some(ctr);
        Ok(())
    }

    /// Brings every replica back to the leader's saved state.
    fn reload_latest(&mut self) -> Result<(), TrainingError> {
        let latest = self.store.latest_path().to_path_buf();
        let loaded = self
            .store
            .load(&latest, &self.replica.model, LoadMode::Strict)?;
        let progress = loaded.progress.ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "{} carries no training progress",
                latest.display()
            ))
        })?;
        self.replica.restore(progress)
    }

    fn finish(&mut self, stop: StopReason) -> Result<RunSummary, TrainingError> {
        let ctr = self.replica.ctr;
        if self.group.is_leader() {
            // Workers polling the control plane see the end of a budget run too.
            if stop == StopReason::StepBudget {
                self.control.quit_flag().raise()?;
            }
            if self.last_saved != Some(ctr) {
                self.save_latest()?;
            }
            if !self.config.evaluation.enabled {
                let deployed = self.store.promote_to_deploy(self.store.latest_path())?;
                info!("copied final model to {}", deployed.display());
            }
            info!("training stopped at ctr {ctr} ({stop:?})");
            self.logger.flush();
        }
        self.group.barrier()?;
        self.group.teardown()?;

        Ok(RunSummary {
            ctr,
            stop,
            best_score: self
                .evaluation
                .as_ref()
                .map(|controller| controller.tracker().global().best_score),
            annealing_attempts: self
                .evaluation
                .as_ref()
                .map_or(0, |controller| controller.tracker().annealing_attempts()),
        })
    }
}

fn select_device(preference: DevicePreference) -> Device {
    if preference == DevicePreference::Cpu {
        return Device::Cpu;
    }
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => return device,
            Err(err) => warn!("failed to initialize metal device, falling back to CPU: {err}"),
        }
    } else if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => return device,
            Err(err) => warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    Device::Cpu
}

/// Loads the configured tokenizer, or builds a word-level one over the
/// training corpora, then registers every target-language marker.
fn build_tokenizer(config: &TrainingConfig) -> Result<HfTokenizer, TrainingError> {
    let markers: Vec<String> = config
        .target_languages()
        .iter()
        .map(|lang| language_token(lang))
        .collect();
    let mut tokenizer = match &config.tokenizer.tokenizer_json {
        Some(path) => HfTokenizer::from_file(path, &config.tokenizer)?,
        None => {
            let mut lines = Vec::new();
            for corpus in &config.data.train {
                lines.extend(read_lines(&corpus.source)?);
                lines.extend(read_lines(&corpus.target)?);
                if let Some(path) = &corpus.parent_source {
                    lines.extend(read_lines(path)?);
                }
            }
            let max_words = config
                .model
                .vocab_size
                .map_or(DEFAULT_MAX_WORDS, |size| size.saturating_sub(4 + markers.len()));
            HfTokenizer::word_level(lines.iter().map(String::as_str), max_words, &config.tokenizer)?
        }
    };
    tokenizer.register_control_tokens(&markers)?;
    Ok(tokenizer)
}

fn resolve_vocab_size(settings: &ModelSettings, tokenizer_vocab: usize) -> Result<usize, TrainingError> {
    match settings.vocab_size {
        Some(size) if size < tokenizer_vocab => Err(TrainingError::initialization(format!(
            "model.vocab_size {size} is smaller than the tokenizer vocabulary ({tokenizer_vocab})"
        ))),
        Some(size) => Ok(size),
        None => Ok(tokenizer_vocab),
    }
}

fn build_model(
    settings: &ModelSettings,
    vocab_size: usize,
    config: &TrainingConfig,
    device: &Device,
) -> Result<Model, TrainingError> {
    let model_config = settings.to_model_config(
        vocab_size,
        config.runtime.seed,
        config.parameter_dtype(),
        device,
    );
    Model::new(model_config)
        .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))
}

/// Fresh runs: the leader writes the initial record and every worker loads
/// it. Resumed or pretrained runs load from disk directly.
fn establish_initial_state(
    replica: &mut Replica,
    store: &CheckpointStore,
    control: &ControlPlane,
    checkpoint: &CheckpointConfig,
    group: &mut dyn ProcessGroup,
) -> Result<(), TrainingError> {
    if group.is_leader() {
        control.quit_flag().reset()?;
    }
    group.barrier()?;

    let mode = if checkpoint.requires_relaxed_load() {
        LoadMode::Relaxed
    } else {
        LoadMode::Strict
    };
    let latest = if checkpoint.resume {
        store.existing_latest()
    } else {
        None
    };
    // Nobody writes before every worker has looked.
    group.barrier()?;

    if let Some(path) = latest {
        let loaded = store.load(&path, &replica.model, mode)?;
        match loaded.progress {
            Some(progress) if checkpoint.restores_progress() => {
                replica.restore(progress)?;
                if group.is_leader() {
                    info!("resumed from {} at ctr {}", path.display(), replica.ctr);
                }
            }
            _ => {
                replica.optimizer.sync_master_weights()?;
                if group.is_leader() {
                    info!(
                        "loaded weights from {}; optimizer, schedule and ctr start fresh",
                        path.display()
                    );
                }
            }
        }
        return Ok(());
    }

    if let Some(path) = &checkpoint.pretrained_model {
        store.load(path, &replica.model, mode)?;
        replica.optimizer.sync_master_weights()?;
        if group.is_leader() {
            info!("initialized weights from {}", path.display());
        }
        return Ok(());
    }

    if group.is_leader() {
        store.save(&replica.training_state(), store.latest_path())?;
    }
    group.barrier()?;
    let loaded = store.load(store.latest_path(), &replica.model, LoadMode::Strict)?;
    if let Some(progress) = loaded.progress {
        replica.restore(progress)?;
    }
    Ok(())
}

/// Fisher information over `ewc.samples` batches of the configured stream,
/// taken at the weights every worker starts from.
fn estimate_ewc_fisher(
    config: &TrainingConfig,
    encoder: &BatchEncoder,
    replica: &Replica,
    group: &mut dyn ProcessGroup,
) -> Result<Option<FisherEstimate>, TrainingError> {
    let Some(ewc) = &config.objective.ewc else {
        return Ok(None);
    };

    let mut pairs = Vec::new();
    match ewc.source {
        EwcDataSource::Train => {
            for corpus in &config.data.train {
                let loaded = load_corpus(corpus)?;
                if ewc.denoising {
                    pairs.extend(to_denoising(&loaded, corpus.source_lang.as_deref()));
                } else {
                    pairs.extend(loaded);
                }
            }
        }
        EwcDataSource::Dev => {
            let evaluation = &config.evaluation;
            let limit = evaluation
                .max_eval_batches
                .saturating_mul(evaluation.dev_batch_size.max(1));
            for task in &evaluation.tasks {
                let task = EvalTask::load(task, limit)?;
                let loaded: Vec<SentencePair> = task
                    .sources
                    .into_iter()
                    .zip(task.references)
                    .map(|(source, target)| SentencePair {
                        source,
                        target,
                        target_lang: task.target_lang.clone(),
                        domain: None,
                        parent_source: None,
                    })
                    .collect();
                if ewc.denoising {
                    pairs.extend(to_denoising(&loaded, None));
                } else {
                    pairs.extend(loaded);
                }
            }
        }
    }

    let mut stream = ParallelCorpus::new(
        pairs,
        encoder.clone(),
        config.data.batch_size,
        true,
        config.runtime.seed,
        group.rank(),
        group.world_size(),
    )?;
    let parameters: Vec<(String, Var)> = replica
        .optimizer
        .parameters()
        .map(|(name, var)| (name.to_string(), var.clone()))
        .collect();
    let loss = CrossEntropyLoss::new().with_ignore_index(Some(encoder.codec().pad_id()));
    estimate_fisher(
        &replica.model,
        &parameters,
        &loss,
        &mut stream,
        ewc.samples,
        group,
    )
    .map(Some)
}

/// The frozen distillation parent, when one is configured.
fn build_parent(
    config: &TrainingConfig,
    vocab_size: usize,
    device: &Device,
) -> Result<Option<Box<dyn Seq2SeqModel>>, TrainingError> {
    let Some(distillation) = &config.objective.distillation else {
        return Ok(None);
    };
    let parent = build_model(&distillation.parent, vocab_size, config, device)?;
    let report = checkpoint::load_weights(&distillation.parent_checkpoint, &parent, LoadMode::Strict)?;
    info!(
        "loaded distillation parent from {} ({} tensors)",
        distillation.parent_checkpoint.display(),
        report.loaded.len()
    );
    Ok(Some(Box::new(parent)))
}
