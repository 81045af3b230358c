use std::{collections::BTreeMap, path::Path};

use candle_core::{DType, Tensor};
use model::{Model, ModelConfig, Seq2SeqModel};
use tempfile::tempdir;
use training::{
    checkpoint::{pure_model_path, CheckpointStore, LoadMode, TrainingState},
    config::{CheckpointConfig, Precision},
    optimizer::{AdamWConfig, GradientScaler, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{DecayShape, LRScheduler, WarmupSchedule},
};

fn build_model(seed: u64, n_layers: usize, num_domains: usize) -> Model {
    let mut config = ModelConfig::new(12, 4, n_layers);
    config.seed = seed;
    config.num_domains = num_domains;
    Model::new(config).unwrap()
}

fn checkpoint_config(dir: &Path, layer_remap: BTreeMap<String, String>) -> CheckpointConfig {
    CheckpointConfig {
        model_path: dir.join("model"),
        save_intermediate_checkpoints: false,
        resume: true,
        pretrained_model: None,
        no_reload_optimizer_ctr_and_scheduler: false,
        layer_remap,
        parameter_efficient: false,
    }
}

fn parameter(model: &Model, name: &str) -> Vec<f32> {
    model
        .named_parameters()
        .into_iter()
        .find(|(candidate, _)| candidate == name)
        .unwrap()
        .1
        .as_tensor()
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn optimizer_for(model: &Model) -> TrainerOptimizer {
    TrainerOptimizer::new(
        model.named_parameters(),
        AdamWConfig {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.98,
            epsilon: 1e-9,
            weight_decay: 0.01,
        },
        TrainerOptimizerOptions::default(),
    )
    .unwrap()
}

fn schedule() -> WarmupSchedule {
    WarmupSchedule::new(DecayShape::Linear, 1e-3, 0.0, 2, 100).unwrap()
}

fn bits(tensor: &Tensor) -> Vec<u32> {
    tensor
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .map(f32::to_bits)
        .collect()
}

fn save_record(store: &CheckpointStore, model: &Model, ctr: usize) {
    let optimizer = optimizer_for(model);
    let mut scheduler = schedule();
    for _ in 0..3 {
        scheduler.step();
    }
    let scaler = GradientScaler::new(Precision::Fp32);
    store
        .save(
            &TrainingState {
                model,
                optimizer: &optimizer,
                scheduler: &scheduler,
                scaler: &scaler,
                ctr,
            },
            store.latest_path(),
        )
        .unwrap();
}

#[test]
fn strict_round_trip_restores_weights_and_progress() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(&checkpoint_config(dir.path(), BTreeMap::new()), "cfg");
    let source = build_model(1, 2, 0);
    save_record(&store, &source, 7);
    assert!(pure_model_path(store.latest_path()).is_file());

    let target = build_model(99, 2, 0);
    let loaded = store
        .load(store.latest_path(), &target, LoadMode::Strict)
        .unwrap();

    assert!(loaded.report.is_exact());
    let progress = loaded.progress.unwrap();
    assert_eq!(progress.ctr, 7);
    assert_eq!(progress.scheduler.position, 3);
    assert_eq!(progress.optimizer.step, 0);
    assert_eq!(
        parameter(&target, "shared.embedding"),
        parameter(&source, "shared.embedding")
    );
}

#[test]
fn stepped_optimizer_state_survives_the_round_trip() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(&checkpoint_config(dir.path(), BTreeMap::new()), "cfg");
    let mut config = ModelConfig::new(12, 4, 2);
    config.seed = 1;
    config.dtype = DType::BF16;
    let source = Model::new(config.clone()).unwrap();

    let mut optimizer = optimizer_for(&source);
    let grads = optimizer
        .parameters()
        .enumerate()
        .map(|(i, (_, var))| {
            let ones = Tensor::ones(var.shape(), DType::F32, var.device()).unwrap();
            Some(ones.affine(0.1 * (i + 1) as f64, 0.0).unwrap())
        })
        .collect();
    optimizer.step(grads).unwrap();
    let mut scheduler = schedule();
    scheduler.step();
    optimizer.set_learning_rate(scheduler.learning_rate());
    let scaler = GradientScaler::new(Precision::Fp32);
    store
        .save(
            &TrainingState {
                model: &source,
                optimizer: &optimizer,
                scheduler: &scheduler,
                scaler: &scaler,
                ctr: 1,
            },
            store.latest_path(),
        )
        .unwrap();

    config.seed = 99;
    let target = Model::new(config).unwrap();
    let progress = store
        .load(store.latest_path(), &target, LoadMode::Strict)
        .unwrap()
        .progress
        .unwrap();
    let mut restored = optimizer_for(&target);
    restored.load_state(progress.optimizer).unwrap();
    let mut restored_schedule = schedule();
    restored_schedule.load_state(&progress.scheduler);

    assert_eq!(restored.steps_taken(), 1);
    let expected = optimizer.state().moments;
    let actual = restored.state().moments;
    assert_eq!(expected.len(), actual.len());
    assert!(expected.keys().any(|key| key.ends_with(".master")));
    for (key, tensor) in &expected {
        assert_eq!(bits(tensor), bits(&actual[key]), "{key}");
    }
    assert_eq!(restored_schedule.position(), scheduler.position());
    assert_eq!(restored_schedule.learning_rate(), scheduler.learning_rate());
    assert_eq!(
        parameter(&target, "shared.embedding"),
        parameter(&source, "shared.embedding")
    );
}

#[test]
fn bare_parameter_files_carry_weights_only() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(&checkpoint_config(dir.path(), BTreeMap::new()), "cfg");
    let source = build_model(1, 2, 0);
    save_record(&store, &source, 3);

    let target = build_model(5, 2, 0);
    let loaded = store
        .load(&pure_model_path(store.latest_path()), &target, LoadMode::Strict)
        .unwrap();
    assert!(loaded.progress.is_none());
    assert_eq!(
        parameter(&target, "lm_head.bias"),
        parameter(&source, "lm_head.bias")
    );
}

#[test]
fn new_parameters_need_a_relaxed_load() {
    let dir = tempdir().unwrap();
    let store = CheckpointStore::new(&checkpoint_config(dir.path(), BTreeMap::new()), "cfg");
    save_record(&store, &build_model(1, 2, 0), 3);

    let with_domains = build_model(2, 2, 3);
    assert!(store
        .load(store.latest_path(), &with_domains, LoadMode::Strict)
        .is_err());

    let loaded = store
        .load(store.latest_path(), &with_domains, LoadMode::Relaxed)
        .unwrap();
    assert!(!loaded.report.missing.is_empty());
    assert!(loaded
        .report
        .missing
        .iter()
        .all(|name| name.starts_with("domain_head")));
    assert!(loaded.report.unexpected.is_empty());
}

#[test]
fn layer_remap_moves_checkpoint_layers() {
    let dir = tempdir().unwrap();
    let mut remap = BTreeMap::new();
    remap.insert("decoder.layers.2".to_string(), "decoder.layers.1".to_string());
    let store = CheckpointStore::new(&checkpoint_config(dir.path(), remap), "cfg");
    let deep = build_model(1, 3, 0);
    save_record(&store, &deep, 3);

    let shallow = build_model(4, 2, 0);
    let loaded = store
        .load(store.latest_path(), &shallow, LoadMode::Relaxed)
        .unwrap();

    assert!(loaded.report.missing.is_empty());
    assert_eq!(
        parameter(&shallow, "decoder.layers.1.weight"),
        parameter(&deep, "decoder.layers.2.weight")
    );
}
