use std::{fs, path::Path, thread};

use tempfile::{tempdir, TempDir};
use training::{
    coordination::{LocalGroup, SoloGroup},
    scoring::Scorer,
    StopReason, Trainer, TrainingConfig, TrainingError,
};

const SOURCES: &[&str] = &[
    "the cat sits",
    "a dog runs fast",
    "the bird sings",
    "a cat sleeps now",
    "the dog eats",
    "a bird flies high",
];

const TARGETS: &[&str] = &[
    "die katze sitzt",
    "ein hund rennt schnell",
    "der vogel singt",
    "eine katze schlaeft jetzt",
    "der hund frisst",
    "ein vogel fliegt hoch",
];

const BASE_CONFIG: &str = r#"
[model]
hidden_size = 8
num_layers = 2

[data]
train = [{ source = "train.src", target = "train.tgt", target_lang = "de" }]
batch_size = 2
max_source_length = 12
max_target_length = 12

[optimizer]
learning_rate = 0.001

[scheduler]
strategy = "linear_decay"
warmup_steps = 0
horizon_steps = 1000

[checkpoint]
model_path = "run/model"

[runtime]
max_steps = 6
log_every_n_steps = 2
device = "cpu"
"#;

const NO_EVAL: &str = r#"
[evaluation]
enabled = false
no_eval_save_every = 3
"#;

const EARLY_STOP: &str = r#"
[evaluation]
every_n_steps = 1
dev_batch_size = 2
max_eval_batches = 1
early_stop_checkpoints = 0
additional_early_stop_checkpoints_per_anneal_step = 1
max_annealing_attempts = 1
tasks = [{ name = "dev", source = "dev.src", reference = "dev.ref", target_lang = "de" }]
"#;

fn write_lines(path: &Path, lines: &[&str]) {
    fs::write(path, lines.join("\n")).unwrap();
}

fn workspace(evaluation: &str) -> (TempDir, TrainingConfig) {
    let dir = tempdir().unwrap();
    write_lines(&dir.path().join("train.src"), SOURCES);
    write_lines(&dir.path().join("train.tgt"), TARGETS);
    write_lines(&dir.path().join("dev.src"), &SOURCES[..2]);
    write_lines(&dir.path().join("dev.ref"), &TARGETS[..2]);

    let path = dir.path().join("train.toml");
    fs::write(&path, format!("{BASE_CONFIG}{evaluation}")).unwrap();
    let config = TrainingConfig::from_path(&path).unwrap();
    (dir, config)
}

fn manifest_ctr(record: &Path) -> u64 {
    let manifest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(record.join("manifest.json")).unwrap()).unwrap();
    manifest["ctr"].as_u64().unwrap()
}

fn flat_parameters(trainer: &Trainer) -> Vec<f32> {
    use model::Seq2SeqModel;
    trainer
        .model()
        .named_parameters()
        .into_iter()
        .flat_map(|(_, var)| {
            var.as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect()
}

struct ConstantScorer(f64);

impl Scorer for ConstantScorer {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn score(
        &self,
        _references: &[String],
        hypotheses: &[String],
        _sources: Option<&[String]>,
    ) -> Result<f64, TrainingError> {
        assert_eq!(hypotheses.len(), 2);
        Ok(self.0)
    }
}

#[test]
fn runs_to_the_step_budget_and_deploys() {
    let (dir, config) = workspace(NO_EVAL);
    let mut trainer = Trainer::new(config, Box::new(SoloGroup)).unwrap();
    assert_eq!(trainer.ctr(), 0);

    let summary = trainer.train().unwrap();

    assert_eq!(summary.ctr, 6);
    assert_eq!(summary.stop, StopReason::StepBudget);
    assert_eq!(summary.best_score, None);
    let run = dir.path().join("run");
    assert_eq!(manifest_ctr(&run.join("model")), 6);
    assert!(run.join("model.pure_model").is_file());
    assert!(run.join("model_deploy/model.safetensors").is_file());
    assert!(run.join("model_deploy/tokenizer.json").is_file());
    assert_eq!(fs::read_to_string(run.join("model.quitflag")).unwrap(), "1");
}

#[test]
fn resumed_run_continues_the_step_count() {
    let (dir, mut config) = workspace(NO_EVAL);
    config.runtime.max_steps = 3;
    let first = Trainer::new(config.clone(), Box::new(SoloGroup))
        .unwrap()
        .train()
        .unwrap();
    assert_eq!(first.ctr, 3);

    config.runtime.max_steps = 6;
    let mut resumed = Trainer::new(config, Box::new(SoloGroup)).unwrap();
    assert_eq!(resumed.ctr(), 3);
    let second = resumed.train().unwrap();

    assert_eq!(second.ctr, 6);
    assert_eq!(manifest_ctr(&dir.path().join("run/model")), 6);

    let (_other, config) = workspace(NO_EVAL);
    let mut uninterrupted = Trainer::new(config, Box::new(SoloGroup)).unwrap();
    assert_eq!(uninterrupted.train().unwrap().ctr, 6);

    assert_eq!(resumed.learning_rate(), uninterrupted.learning_rate());
    assert_eq!(resumed.schedule_position(), uninterrupted.schedule_position());
    assert_eq!(flat_parameters(&resumed), flat_parameters(&uninterrupted));
}

#[test]
fn parameter_efficient_resume_keeps_progress() {
    let (_dir, mut config) = workspace(NO_EVAL);
    config.checkpoint.parameter_efficient = true;
    config.runtime.max_steps = 3;
    let mut first = Trainer::new(config.clone(), Box::new(SoloGroup)).unwrap();
    assert_eq!(first.train().unwrap().ctr, 3);
    let learning_rate = first.learning_rate();

    config.runtime.max_steps = 6;
    let resumed = Trainer::new(config, Box::new(SoloGroup)).unwrap();
    assert_eq!(resumed.ctr(), 3);
    assert_eq!(resumed.learning_rate(), learning_rate);
    assert_eq!(resumed.schedule_position(), first.schedule_position());
}

#[test]
fn shutdown_request_raises_the_quit_flag_at_the_next_save() {
    let (dir, config) = workspace(NO_EVAL);
    let mut trainer = Trainer::new(config, Box::new(SoloGroup)).unwrap();

    let summary = trainer.train_with_shutdown(|| true).unwrap();

    assert_eq!(summary.stop, StopReason::QuitFlag);
    assert_eq!(summary.ctr, 3);
    let run = dir.path().join("run");
    assert_eq!(fs::read_to_string(run.join("model.quitflag")).unwrap(), "1");
    assert!(run.join("model_deploy/model.safetensors").is_file());
}

#[test]
fn flat_scores_anneal_then_converge() {
    let (dir, config) = workspace(EARLY_STOP);
    let mut trainer =
        Trainer::with_scorer(config, Box::new(SoloGroup), Box::new(ConstantScorer(5.0))).unwrap();

    let summary = trainer.train().unwrap();

    // Round 0 sets the best; round 1 anneals (stall 1 > 0); round 2 has
    // stall 2 > 0 + 1 and no attempts left.
    assert_eq!(summary.stop, StopReason::QuitFlag);
    assert_eq!(summary.ctr, 2);
    assert_eq!(summary.annealing_attempts, 1);
    assert_eq!(summary.best_score, Some(5.0));
    assert!(trainer.learning_rate() < 5e-4);

    let run = dir.path().join("run");
    assert_eq!(manifest_ctr(&run.join("model.best")), 0);
    assert_eq!(manifest_ctr(&run.join("model.best.dev")), 0);
    assert!(run.join("model_deploy/model.safetensors").is_file());
    assert_eq!(fs::read_to_string(run.join("model.quitflag")).unwrap(), "1");
}

#[test]
fn local_workers_stay_in_lockstep() {
    let (dir, config) = workspace(NO_EVAL);
    let handles: Vec<_> = LocalGroup::create(2)
        .unwrap()
        .into_iter()
        .map(|group| {
            let config = config.clone();
            thread::spawn(move || {
                let mut trainer = Trainer::new(config, Box::new(group)).unwrap();
                let summary = trainer.train().unwrap();
                (summary, flat_parameters(&trainer))
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results[0].0.ctr, 6);
    assert_eq!(results[1].0.ctr, 6);
    assert_eq!(results[0].1, results[1].1);
    assert_eq!(manifest_ctr(&dir.path().join("run/model")), 6);
}
