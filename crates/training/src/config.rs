use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device};
use model::ModelConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub objective: ObjectiveConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }
        if self.model.num_layers == 0 {
            errors.push("model.num_layers must be greater than 0".to_string());
        }
        for &layer in &self.model.auxiliary_layers {
            if layer + 1 >= self.model.num_layers {
                errors.push(format!(
                    "model.auxiliary_layers entry {} must be below the final layer",
                    layer
                ));
            }
        }
        if self.model.softmax_temperature <= 0.0 {
            errors.push("model.softmax_temperature must be greater than 0".to_string());
        }

        if self.data.train.is_empty() {
            errors.push("data.train must list at least one corpus".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if self.data.max_source_length < 2 || self.data.max_target_length < 2 {
            errors.push("data.max_source_length and data.max_target_length must be >= 2".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.max_gradient_clip_value < 0.0 {
            errors.push("optimizer.max_gradient_clip_value must be >= 0".to_string());
        }

        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }
        if self.scheduler.anneal_iteration_cap == 0 {
            errors.push("scheduler.anneal_iteration_cap must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.objective.label_smoothing) {
            errors.push("objective.label_smoothing must be in [0, 1]".to_string());
        }
        if let Some(domain) = &self.objective.domain {
            if !(0.0..=1.0).contains(&domain.weight) {
                errors.push("objective.domain.weight must be in [0, 1]".to_string());
            }
            if self.model.num_domains == 0 {
                errors.push("objective.domain requires model.num_domains > 0".to_string());
            }
        }
        if let Some(entropy) = &self.objective.entropy {
            if !(0.0..=1.0).contains(&entropy.weight) {
                errors.push("objective.entropy.weight must be in [0, 1]".to_string());
            }
        }
        if let Some(ewc) = &self.objective.ewc {
            if ewc.samples == 0 {
                errors.push("objective.ewc.samples must be greater than 0".to_string());
            }
            if ewc.importance < 0.0 {
                errors.push("objective.ewc.importance must be >= 0".to_string());
            }
            if ewc.source == EwcDataSource::Dev && self.evaluation.tasks.is_empty() {
                errors.push("objective.ewc.source = \"dev\" requires evaluation.tasks".to_string());
            }
        }
        if let Some(distillation) = &self.objective.distillation {
            if !(0.0..=1.0).contains(&distillation.weight) {
                errors.push("objective.distillation.weight must be in [0, 1]".to_string());
            }
            if distillation.temperature <= 0.0 {
                errors.push("objective.distillation.temperature must be greater than 0".to_string());
            }
            if distillation.styles.is_empty() {
                errors.push("objective.distillation.styles must not be empty".to_string());
            }
            for pair in &distillation.layer_mapping {
                if pair.child >= self.model.num_layers
                    || pair.parent >= distillation.parent.num_layers
                {
                    errors.push(format!(
                        "objective.distillation.layer_mapping entry {}->{} is out of range",
                        pair.child, pair.parent
                    ));
                }
            }
        }

        let evaluation = &self.evaluation;
        if evaluation.every_n_steps == 0 {
            errors.push("evaluation.every_n_steps must be greater than 0".to_string());
        }
        if evaluation.no_eval_save_every == 0 {
            errors.push("evaluation.no_eval_save_every must be greater than 0".to_string());
        }
        if evaluation.enabled && evaluation.tasks.is_empty() {
            errors.push("evaluation.tasks must not be empty when evaluation is enabled".to_string());
        }
        if evaluation.dev_batch_size == 0 || evaluation.max_eval_batches == 0 {
            errors.push("evaluation.dev_batch_size and max_eval_batches must be > 0".to_string());
        }
        if evaluation.learning_rate_scaling <= 1.0 {
            errors.push("evaluation.learning_rate_scaling must be greater than 1".to_string());
        }
        if evaluation.max_decode_length_multiplier == 0.0 {
            errors.push("evaluation.max_decode_length_multiplier must be non-zero".to_string());
        }
        if evaluation.history_limit == 0 {
            errors.push("evaluation.history_limit must be greater than 0".to_string());
        }
        let mut names = std::collections::HashSet::new();
        for task in &evaluation.tasks {
            if !is_plain_file_component(&task.name) {
                errors.push(format!(
                    "evaluation task name '{}' must be a plain file name component",
                    task.name
                ));
            }
            if !names.insert(task.name.as_str()) {
                errors.push(format!("evaluation task '{}' is declared twice", task.name));
            }
        }

        if self.checkpoint.model_path.as_os_str().is_empty() {
            errors.push("checkpoint.model_path must not be empty".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if self.runtime.max_steps == 0 {
            errors.push("runtime.max_steps must be greater than 0".to_string());
        }
        if self.runtime.world_size == 0 {
            errors.push("runtime.world_size must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.tokenizer.apply_base_path(base);
        self.data.apply_base_path(base);
        self.evaluation.apply_base_path(base);
        self.checkpoint.apply_base_path(base);
        if let Some(distillation) = self.objective.distillation.as_mut() {
            absolutize_in_place(&mut distillation.parent_checkpoint, base);
        }
        if let Some(dir) = self.runtime.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Loss-scaling and parameter dtype derived from `runtime.precision`.
    pub fn parameter_dtype(&self) -> DType {
        precision_to_dtype(self.runtime.precision)
    }

    /// Scheduler horizon; defaults to the step budget.
    pub fn scheduler_horizon(&self) -> usize {
        self.scheduler
            .horizon_steps
            .unwrap_or(self.runtime.max_steps)
            .max(1)
    }

    /// Every target language marker used by training data or evaluation tasks.
    pub fn target_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self
            .data
            .train
            .iter()
            .flat_map(|corpus| {
                std::iter::once(corpus.target_lang.clone()).chain(corpus.source_lang.clone())
            })
            .chain(self.evaluation.tasks.iter().map(|task| task.target_lang.clone()))
            .collect();
        languages.sort();
        languages.dedup();
        languages
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Intermediate decoder layers that also receive a vocabulary loss.
    #[serde(default)]
    pub auxiliary_layers: Vec<usize>,
    #[serde(default)]
    pub num_domains: usize,
    #[serde(default)]
    pub num_experts: usize,
    #[serde(default = "default_softmax_temperature")]
    pub softmax_temperature: f64,
    #[serde(default)]
    pub temperature_calibration: bool,
    #[serde(default)]
    pub dropout: Option<f32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            vocab_size: None,
            hidden_size: default_hidden_size(),
            num_layers: default_num_layers(),
            auxiliary_layers: Vec::new(),
            num_domains: 0,
            num_experts: 0,
            softmax_temperature: default_softmax_temperature(),
            temperature_calibration: false,
            dropout: None,
        }
    }
}

impl ModelSettings {
    pub fn to_model_config(
        &self,
        vocab_size: usize,
        seed: u64,
        dtype: DType,
        device: &Device,
    ) -> ModelConfig {
        let mut config = ModelConfig::new(
            self.vocab_size.unwrap_or(vocab_size),
            self.hidden_size,
            self.num_layers,
        );
        config.auxiliary_layers = self.auxiliary_layers.clone();
        config.num_domains = self.num_domains;
        config.num_experts = self.num_experts;
        config.softmax_temperature = self.softmax_temperature;
        config.learn_temperature = self.temperature_calibration;
        config.dropout_p = self.dropout.filter(|p| *p > 0.0);
        config.seed = seed;
        config.dtype = dtype;
        config.device = device.clone();
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default)]
    pub tokenizer_json: Option<PathBuf>,
    #[serde(default = "default_pad_token")]
    pub pad_token: String,
    #[serde(default = "default_eos_token")]
    pub eos_token: String,
    #[serde(default = "default_decoder_start_token")]
    pub decoder_start_token: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            tokenizer_json: None,
            pad_token: default_pad_token(),
            eos_token: default_eos_token(),
            decoder_start_token: default_decoder_start_token(),
        }
    }
}

impl TokenizerConfig {
    fn apply_base_path(&mut self, base: &Path) {
        if let Some(path) = self.tokenizer_json.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

/// One parallel training corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    pub source: PathBuf,
    pub target: PathBuf,
    pub target_lang: String,
    /// Marker used for source-side reconstruction pairs.
    #[serde(default)]
    pub source_lang: Option<String>,
    #[serde(default)]
    pub domain: Option<u32>,
    /// Line-aligned source in another language fed to the distillation parent.
    #[serde(default)]
    pub parent_source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train: Vec<CorpusConfig>,
    /// Sentence pairs per micro-batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_max_length")]
    pub max_source_length: usize,
    #[serde(default = "default_max_length")]
    pub max_target_length: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for corpus in &mut self.train {
            absolutize_in_place(&mut corpus.source, base);
            absolutize_in_place(&mut corpus.target, base);
            if let Some(path) = corpus.parent_source.as_mut() {
                absolutize_in_place(path, base);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f32,
    /// Global gradient-norm bound; zero disables clipping.
    #[serde(default = "default_max_gradient_clip_value")]
    pub max_gradient_clip_value: f32,
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
    #[serde(default)]
    pub freeze: FreezeConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_gradient_clip_value: default_max_gradient_clip_value(),
            no_decay: default_no_decay(),
            freeze: FreezeConfig::default(),
        }
    }
}

/// Parameters excluded from optimization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FreezeConfig {
    #[serde(default)]
    pub embeddings: bool,
    #[serde(default)]
    pub encoder: bool,
    /// Name fragments that stay trainable even inside a frozen group.
    #[serde(default)]
    pub exceptions: Vec<String>,
}

impl FreezeConfig {
    pub fn is_frozen(&self, name: &str) -> bool {
        if self.exceptions.iter().any(|pattern| name.contains(pattern.as_str())) {
            return false;
        }
        (self.embeddings && name.contains("embedding")) || (self.encoder && name.starts_with("encoder."))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Step at which decaying schedules reach `min_lr`; defaults to `runtime.max_steps`.
    #[serde(default)]
    pub horizon_steps: Option<usize>,
    #[serde(default)]
    pub min_lr: f32,
    #[serde(default = "default_power")]
    pub power: f32,
    /// The schedule is advanced before training until the rate reaches this value.
    #[serde(default = "default_initial_min_lr")]
    pub initial_min_lr: f64,
    #[serde(default = "default_anneal_iteration_cap")]
    pub anneal_iteration_cap: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            warmup_steps: default_warmup_steps(),
            horizon_steps: None,
            min_lr: 0.0,
            power: default_power(),
            initial_min_lr: default_initial_min_lr(),
            anneal_iteration_cap: default_anneal_iteration_cap(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    #[default]
    LinearDecay,
    Cosine,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveConfig {
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,
    /// Adds the loss of every `model.auxiliary_layers` entry.
    #[serde(default = "default_true")]
    pub auxiliary_supervision: bool,
    #[serde(default)]
    pub ewc: Option<EwcConfig>,
    #[serde(default)]
    pub domain: Option<DomainConfig>,
    #[serde(default)]
    pub entropy: Option<EntropyConfig>,
    #[serde(default)]
    pub distillation: Option<DistillationConfig>,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            label_smoothing: default_label_smoothing(),
            auxiliary_supervision: true,
            ewc: None,
            domain: None,
            entropy: None,
            distillation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EwcDataSource {
    #[default]
    Train,
    Dev,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EwcConfig {
    pub importance: f64,
    #[serde(default = "default_ewc_samples")]
    pub samples: usize,
    #[serde(default)]
    pub source: EwcDataSource,
    /// Estimate on source→source and target→target reconstruction pairs.
    #[serde(default)]
    pub denoising: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    #[serde(default = "default_domain_weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntropyConfig {
    pub weight: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistillationStyle {
    CrossEntropy,
    Attention,
    Hidden,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayerPair {
    pub child: usize,
    pub parent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    pub parent_checkpoint: PathBuf,
    #[serde(default)]
    pub parent: ModelSettings,
    #[serde(default = "default_distillation_weight")]
    pub weight: f64,
    #[serde(default = "default_distillation_temperature")]
    pub temperature: f64,
    #[serde(default = "default_distillation_styles")]
    pub styles: Vec<DistillationStyle>,
    /// Child/parent layer pairs compared by the attention and hidden styles;
    /// empty pairs the final layers.
    #[serde(default)]
    pub layer_mapping: Vec<LayerPair>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Bleu,
    Rouge,
    M2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalTaskConfig {
    pub name: String,
    pub source: PathBuf,
    pub reference: PathBuf,
    pub target_lang: String,
    /// Pass the un-corrected source to the scorer as a second reference.
    #[serde(default)]
    pub source_as_reference: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_eval_every")]
    pub every_n_steps: usize,
    #[serde(default = "default_no_eval_save_every")]
    pub no_eval_save_every: usize,
    #[serde(default)]
    pub tasks: Vec<EvalTaskConfig>,
    #[serde(default)]
    pub metric: MetricKind,
    #[serde(default = "default_max_eval_batches")]
    pub max_eval_batches: usize,
    /// Sentences per decoding batch.
    #[serde(default = "default_dev_batch_size")]
    pub dev_batch_size: usize,
    /// Positive: multiple of the source length. Negative: absolute length.
    #[serde(default = "default_max_decode_length_multiplier")]
    pub max_decode_length_multiplier: f64,
    #[serde(default = "default_min_decode_length_multiplier")]
    pub min_decode_length_multiplier: f64,
    #[serde(default = "default_early_stop_checkpoints")]
    pub early_stop_checkpoints: usize,
    #[serde(default = "default_additional_early_stop_checkpoints")]
    pub additional_early_stop_checkpoints_per_anneal_step: usize,
    #[serde(default = "default_max_annealing_attempts")]
    pub max_annealing_attempts: usize,
    #[serde(default = "default_learning_rate_scaling")]
    pub learning_rate_scaling: f64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_steps: default_eval_every(),
            no_eval_save_every: default_no_eval_save_every(),
            tasks: Vec::new(),
            metric: MetricKind::default(),
            max_eval_batches: default_max_eval_batches(),
            dev_batch_size: default_dev_batch_size(),
            max_decode_length_multiplier: default_max_decode_length_multiplier(),
            min_decode_length_multiplier: default_min_decode_length_multiplier(),
            early_stop_checkpoints: default_early_stop_checkpoints(),
            additional_early_stop_checkpoints_per_anneal_step:
                default_additional_early_stop_checkpoints(),
            max_annealing_attempts: default_max_annealing_attempts(),
            learning_rate_scaling: default_learning_rate_scaling(),
            history_limit: default_history_limit(),
        }
    }
}

impl EvaluationConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for task in &mut self.tasks {
            absolutize_in_place(&mut task.source, base);
            absolutize_in_place(&mut task.reference, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Fixed location of the latest full record; other artifacts are derived from it.
    pub model_path: PathBuf,
    #[serde(default)]
    pub save_intermediate_checkpoints: bool,
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default)]
    pub pretrained_model: Option<PathBuf>,
    #[serde(default)]
    pub no_reload_optimizer_ctr_and_scheduler: bool,
    /// Checkpoint name prefix -> model name prefix.
    #[serde(default)]
    pub layer_remap: BTreeMap<String, String>,
    /// New parameters that do not exist in the loaded checkpoint are expected.
    #[serde(default)]
    pub parameter_efficient: bool,
}

impl CheckpointConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.model_path, base);
        if let Some(path) = self.pretrained_model.as_mut() {
            absolutize_in_place(path, base);
        }
    }

    pub fn requires_relaxed_load(&self) -> bool {
        !self.layer_remap.is_empty() || self.parameter_efficient
    }

    /// Whether resuming restores ctr, optimizer, schedule and scaler. The load
    /// mode only governs weight-key matching; a remapped model is a new run.
    pub fn restores_progress(&self) -> bool {
        self.layer_remap.is_empty() && !self.no_reload_optimizer_ctr_and_scheduler
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub device: DevicePreference,
    /// Optimizer-step budget for the run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_initial_loss_scale")]
    pub initial_loss_scale: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            precision: Precision::default(),
            device: DevicePreference::default(),
            max_steps: default_max_steps(),
            log_every_n_steps: default_log_every_n_steps(),
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
            world_size: default_world_size(),
            master_addr: default_master_addr(),
            initial_loss_scale: default_initial_loss_scale(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

/// `auto` picks Metal, then CUDA, then the CPU.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn precision_to_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 | Precision::Mixed => DType::F32,
        Precision::Fp16 => DType::F16,
        Precision::Bf16 => DType::BF16,
    }
}

fn default_true() -> bool {
    true
}

fn default_hidden_size() -> usize {
    256
}

fn default_num_layers() -> usize {
    3
}

fn default_softmax_temperature() -> f64 {
    1.0
}

fn default_pad_token() -> String {
    "<pad>".to_string()
}

fn default_eos_token() -> String {
    "</s>".to_string()
}

fn default_decoder_start_token() -> String {
    "<s>".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_max_length() -> usize {
    256
}

fn default_learning_rate() -> f32 {
    7e-4
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.98
}

fn default_adam_eps() -> f32 {
    1e-9
}

fn default_max_gradient_clip_value() -> f32 {
    1.0
}

fn default_no_decay() -> Vec<String> {
    vec!["bias".to_string(), "norm".to_string(), "temperature".to_string()]
}

fn default_warmup_steps() -> usize {
    16_000
}

fn default_power() -> f32 {
    1.0
}

fn default_initial_min_lr() -> f64 {
    1e-7
}

fn default_anneal_iteration_cap() -> usize {
    10_000_000
}

/// Task names become suffixes of checkpoint paths inside the run directory.
fn is_plain_file_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn default_label_smoothing() -> f64 {
    0.1
}

fn default_ewc_samples() -> usize {
    200
}

fn default_domain_weight() -> f64 {
    0.1
}

fn default_distillation_weight() -> f64 {
    0.7
}

fn default_distillation_temperature() -> f64 {
    1.0
}

fn default_distillation_styles() -> Vec<DistillationStyle> {
    vec![DistillationStyle::CrossEntropy]
}

fn default_eval_every() -> usize {
    1_000
}

fn default_no_eval_save_every() -> usize {
    10_000
}

fn default_max_eval_batches() -> usize {
    1_000
}

fn default_dev_batch_size() -> usize {
    64
}

fn default_max_decode_length_multiplier() -> f64 {
    2.0
}

fn default_min_decode_length_multiplier() -> f64 {
    0.1
}

fn default_early_stop_checkpoints() -> usize {
    10
}

fn default_additional_early_stop_checkpoints() -> usize {
    5
}

fn default_max_annealing_attempts() -> usize {
    2
}

fn default_learning_rate_scaling() -> f64 {
    2.0
}

fn default_history_limit() -> usize {
    1_000
}

fn default_seed() -> u64 {
    42
}

fn default_max_steps() -> usize {
    500_000
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_tensorboard_flush_every_n() -> usize {
    20
}

fn default_world_size() -> usize {
    1
}

fn default_master_addr() -> String {
    "127.0.0.1:29500".to_string()
}

fn default_initial_loss_scale() -> f32 {
    65_536.0
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Checkpoint(String),
    Coordination(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn coordination(message: impl Into<String>) -> Self {
        Self::Coordination(message.into())
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Checkpoint(msg) => write!(f, "checkpoint error: {}", msg),
            TrainingError::Coordination(msg) => write!(f, "worker group failure: {}", msg),
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[data]
train = [{ source = "train.src", target = "train.tgt", target_lang = "hi" }]

[checkpoint]
model_path = "run/model"

[evaluation]
enabled = false
"#;

    #[test]
    fn minimal_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(&path, MINIMAL).unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();

        assert_eq!(config.evaluation.every_n_steps, 1_000);
        assert_eq!(config.evaluation.early_stop_checkpoints, 10);
        assert_eq!(config.evaluation.max_annealing_attempts, 2);
        assert_eq!(config.objective.label_smoothing, 0.1);
        assert_eq!(config.scheduler.warmup_steps, 16_000);
        assert_eq!(config.runtime.max_steps, 500_000);
        assert_eq!(config.scheduler_horizon(), 500_000);
        assert!(config.checkpoint.model_path.starts_with(dir.path()));
        assert!(config.data.train[0].source.is_absolute());
        assert_eq!(config.target_languages(), vec!["hi".to_string()]);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.data.batch_size = 0;
        config.optimizer.learning_rate = 0.0;
        config.evaluation.enabled = true;

        let err = config.validate().unwrap_err();
        match err {
            TrainingError::Validation(messages) => assert_eq!(messages.len(), 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn freeze_respects_exceptions() {
        let freeze = FreezeConfig {
            embeddings: true,
            encoder: true,
            exceptions: vec!["encoder.proj.bias".to_string()],
        };
        assert!(freeze.is_frozen("shared.embedding"));
        assert!(freeze.is_frozen("encoder.proj.weight"));
        assert!(!freeze.is_frozen("encoder.proj.bias"));
        assert!(!freeze.is_frozen("decoder.layers.0.weight"));
    }

    #[test]
    fn relaxed_load_follows_remap_and_peft() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        assert!(!config.checkpoint.requires_relaxed_load());
        config
            .checkpoint
            .layer_remap
            .insert("decoder.layers.2".into(), "decoder.layers.0".into());
        assert!(config.checkpoint.requires_relaxed_load());
    }

    #[test]
    fn progress_survives_peft_but_not_remap() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.checkpoint.parameter_efficient = true;
        assert!(config.checkpoint.requires_relaxed_load());
        assert!(config.checkpoint.restores_progress());

        config.checkpoint.no_reload_optimizer_ctr_and_scheduler = true;
        assert!(!config.checkpoint.restores_progress());

        config.checkpoint.no_reload_optimizer_ctr_and_scheduler = false;
        config
            .checkpoint
            .layer_remap
            .insert("decoder.layers.1".into(), "decoder.layers.0".into());
        assert!(!config.checkpoint.restores_progress());
    }

    #[test]
    fn full_label_smoothing_is_accepted() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        config.objective.label_smoothing = 1.0;
        assert!(config.validate().is_ok());

        config.objective.label_smoothing = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn task_names_stay_inside_the_run_directory() {
        let mut config: TrainingConfig = toml::from_str(MINIMAL).unwrap();
        let task = |name: &str| EvalTaskConfig {
            name: name.to_string(),
            source: PathBuf::from("dev.src"),
            reference: PathBuf::from("dev.ref"),
            target_lang: "hi".to_string(),
            source_as_reference: false,
        };
        config.evaluation.tasks = vec![task("dev-news")];
        assert!(config.validate().is_ok());

        for name in ["../escape", "nested/dev", "a\\b", "..", ""] {
            config.evaluation.tasks = vec![task(name)];
            let err = config.validate().unwrap_err();
            match err {
                TrainingError::Validation(messages) => {
                    assert_eq!(messages.len(), 1, "{name}: {messages:?}")
                }
                other => panic!("unexpected error {other}"),
            }
        }
    }
}
