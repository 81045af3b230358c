use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Tensor};
use hex::encode as hex_encode;
use log::{info, warn};
use model::Seq2SeqModel;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::CheckpointConfig,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_TENSORS_FILENAME: &str = "optimizer.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const PURE_MODEL_SUFFIX: &str = "pure_model";
const DEPLOY_FILENAME: &str = "model.safetensors";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub ctr: usize,
    pub model: FileRecord,
    pub optimizer_tensors: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptimizerMetadata {
    step: usize,
}

/// Borrowed view of everything a full checkpoint record holds.
pub struct TrainingState<'a> {
    pub model: &'a dyn Seq2SeqModel,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub scaler: &'a GradientScaler,
    pub ctr: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Any missing, unexpected or mis-shaped parameter is an error.
    Strict,
    /// Unmatched parameters are skipped; new parameters keep their init.
    Relaxed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Training progress recovered from a full record. Bare parameter files carry
/// weights only.
#[derive(Debug)]
pub struct LoadedState {
    pub report: LoadReport,
    pub progress: Option<SavedProgress>,
}

#[derive(Debug)]
pub struct SavedProgress {
    pub ctr: usize,
    pub optimizer: OptimizerState,
    pub scheduler: SchedulerState,
    pub scaler: GradientScalerState,
}

/// Naming and persistence of every checkpoint artifact derived from
/// `checkpoint.model_path`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    model_path: PathBuf,
    save_intermediate: bool,
    layer_remap: BTreeMap<String, String>,
    config_sha256: String,
}

impl CheckpointStore {
    pub fn new(config: &CheckpointConfig, config_sha256: impl Into<String>) -> Self {
        Self {
            model_path: config.model_path.clone(),
            save_intermediate: config.save_intermediate_checkpoints,
            layer_remap: config.layer_remap.clone(),
            config_sha256: config_sha256.into(),
        }
    }

    pub fn from_training_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        Ok(Self::new(&config.checkpoint, fingerprint_config(config)?))
    }

    /// Fixed location of the latest record, overwritten on every save.
    pub fn latest_path(&self) -> &Path {
        &self.model_path
    }

    pub fn keeps_numbered_snapshots(&self) -> bool {
        self.save_intermediate
    }

    /// `<model_path>.<ctr>`.
    pub fn numbered_path(&self, ctr: usize) -> PathBuf {
        with_suffix(&self.model_path, &ctr.to_string())
    }

    /// `<model_path>.best` for the global best, `<model_path>.best.<task>`
    /// per task; numbered with `.<ctr>` when snapshots are kept.
    pub fn best_path(&self, task: Option<&str>, ctr: usize) -> PathBuf {
        let mut suffix = "best".to_string();
        if let Some(task) = task {
            suffix.push('.');
            suffix.push_str(task);
        }
        if self.save_intermediate {
            suffix.push('.');
            suffix.push_str(&ctr.to_string());
        }
        with_suffix(&self.model_path, &suffix)
    }

    pub fn deploy_dir(&self) -> PathBuf {
        let mut name = self.model_path.as_os_str().to_os_string();
        name.push("_deploy");
        PathBuf::from(name)
    }

    pub fn deploy_model_path(&self) -> PathBuf {
        self.deploy_dir().join(DEPLOY_FILENAME)
    }

    /// Returns the latest record if one is present, falling back to the
    /// previous record when a save was interrupted mid-swap.
    pub fn existing_latest(&self) -> Option<PathBuf> {
        existing_record(&self.model_path)
    }

    /// Writes a full record at `path` plus its `<path>.pure_model` companion.
    pub fn save(
        &self,
        state: &TrainingState<'_>,
        path: &Path,
    ) -> Result<CheckpointManifest, TrainingError> {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            fs::create_dir_all(parent).map_err(|err| {
                TrainingError::checkpoint(format!(
                    "failed to create checkpoint directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let staging = with_suffix(path, "tmp");
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir(&staging).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to create checkpoint directory {}: {err}",
                staging.display()
            ))
        })?;

        let model_path = staging.join(MODEL_FILENAME);
        save_model_weights(state.model, &model_path)?;
        let model_record = file_record(&model_path)?;

        let optimizer_state = state.optimizer.state();
        let tensors_path = staging.join(OPTIMIZER_TENSORS_FILENAME);
        candle_core::safetensors::save(&optimizer_state.moments, &tensors_path).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to serialize optimizer state to {}: {err}",
                tensors_path.display()
            ))
        })?;
        let optimizer_tensors_record = file_record(&tensors_path)?;
        let optimizer_path = staging.join(OPTIMIZER_FILENAME);
        write_json(
            &optimizer_path,
            &OptimizerMetadata {
                step: optimizer_state.step,
            },
        )?;
        let optimizer_record = file_record(&optimizer_path)?;

        let scheduler_path = staging.join(SCHEDULER_FILENAME);
        write_json(&scheduler_path, &state.scheduler.state())?;
        let scheduler_record = file_record(&scheduler_path)?;

        let scaler_path = staging.join(SCALER_FILENAME);
        write_json(&scaler_path, &state.scaler.state())?;
        let scaler_record = file_record(&scaler_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            config_sha256: self.config_sha256.clone(),
            ctr: state.ctr,
            model: model_record,
            optimizer_tensors: optimizer_tensors_record,
            optimizer: optimizer_record,
            scheduler: scheduler_record,
            scaler: scaler_record,
        };
        write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

        swap_into_place(&staging, path)?;
        self.save_pure_model(state.model, path)?;

        Ok(manifest)
    }

    /// Writes only the model parameters to `<record>.pure_model`.
    pub fn save_pure_model(
        &self,
        model: &dyn Seq2SeqModel,
        record: &Path,
    ) -> Result<PathBuf, TrainingError> {
        let target = pure_model_path(record);
        let staging = with_suffix(&target, "tmp");
        save_model_weights(model, &staging)?;
        fs::rename(&staging, &target)?;
        Ok(target)
    }

    /// Copies the pure-model companion of `record` into the deploy folder.
    pub fn promote_to_deploy(&self, record: &Path) -> Result<PathBuf, TrainingError> {
        let source = pure_model_path(record);
        let dir = self.deploy_dir();
        fs::create_dir_all(&dir)?;
        let target = self.deploy_model_path();
        fs::copy(&source, &target).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to copy {} to {}: {err}",
                source.display(),
                target.display()
            ))
        })?;
        Ok(target)
    }

    /// Loads either a full record directory or a bare parameters file into
    /// `model`. Optimizer, scheduler and scaler states are returned for the
    /// caller to restore.
    pub fn load(
        &self,
        path: &Path,
        model: &dyn Seq2SeqModel,
        mode: LoadMode,
    ) -> Result<LoadedState, TrainingError> {
        let resolved = existing_record(path).ok_or_else(|| {
            TrainingError::checkpoint(format!("no checkpoint found at {}", path.display()))
        })?;

        if resolved.is_file() {
            let report = apply_model_weights(model, &resolved, mode, &self.layer_remap)?;
            return Ok(LoadedState {
                report,
                progress: None,
            });
        }

        let manifest: CheckpointManifest = read_json(&resolved.join(MANIFEST_FILENAME))?;
        ensure_version_supported(manifest.version)?;
        if manifest.config_sha256 != self.config_sha256 {
            warn!(
                "checkpoint {} was written under a different configuration",
                resolved.display()
            );
        }

        let model_path = verified(&resolved, &manifest.model)?;
        let report = apply_model_weights(model, &model_path, mode, &self.layer_remap)?;

        let tensors_path = verified(&resolved, &manifest.optimizer_tensors)?;
        let moments: HashMap<String, Tensor> =
            load_safetensors(&tensors_path, &candle_core::Device::Cpu)
                .map_err(|err| {
                    TrainingError::checkpoint(format!(
                        "failed to read {}: {err}",
                        tensors_path.display()
                    ))
                })?
                .into_iter()
                .collect();
        let metadata: OptimizerMetadata = read_json(&verified(&resolved, &manifest.optimizer)?)?;
        let scheduler: SchedulerState = read_json(&verified(&resolved, &manifest.scheduler)?)?;
        let scaler: GradientScalerState = read_json(&verified(&resolved, &manifest.scaler)?)?;

        Ok(LoadedState {
            report,
            progress: Some(SavedProgress {
                ctr: manifest.ctr,
                optimizer: OptimizerState {
                    step: metadata.step,
                    moments,
                },
                scheduler,
                scaler,
            }),
        })
    }
}

/// `<record>.pure_model`.
pub fn pure_model_path(record: &Path) -> PathBuf {
    with_suffix(record, PURE_MODEL_SUFFIX)
}

/// Applies only the parameters of a full record or a bare parameters file,
/// without any name remapping.
pub fn load_weights(
    record: &Path,
    model: &dyn Seq2SeqModel,
    mode: LoadMode,
) -> Result<LoadReport, TrainingError> {
    let resolved = existing_record(record).ok_or_else(|| {
        TrainingError::checkpoint(format!("no checkpoint found at {}", record.display()))
    })?;
    let weights = if resolved.is_dir() {
        resolved.join(MODEL_FILENAME)
    } else {
        resolved
    };
    apply_model_weights(model, &weights, mode, &BTreeMap::new())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn existing_record(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let previous = with_suffix(path, "old");
    previous.exists().then_some(previous)
}

/// Replaces `target` with `staging`, keeping the old record reachable as
/// `<target>.old` until the new one is in place.
fn swap_into_place(staging: &Path, target: &Path) -> Result<(), TrainingError> {
    let previous = with_suffix(target, "old");
    if previous.exists() {
        remove_any(&previous)?;
    }
    if target.exists() {
        fs::rename(target, &previous)?;
    }
    fs::rename(staging, target)?;
    if previous.exists() {
        remove_any(&previous)?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<(), TrainingError> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Applies a safetensors parameter file to `model`.
///
/// Checkpoint names are first rewritten through `remap` (checkpoint prefix to
/// model prefix); remapped entries win over identically named ones.
pub fn apply_model_weights(
    model: &dyn Seq2SeqModel,
    weights_path: &Path,
    mode: LoadMode,
    remap: &BTreeMap<String, String>,
) -> Result<LoadReport, TrainingError> {
    let tensors = load_safetensors(weights_path, &candle_core::Device::Cpu).map_err(|err| {
        TrainingError::checkpoint(format!("failed to read {}: {err}", weights_path.display()))
    })?;
    let mut by_name = remap_names(tensors, remap);

    let mut report = LoadReport::default();
    for (name, var) in model.named_parameters() {
        let Some(tensor) = by_name.remove(&name) else {
            report.missing.push(name);
            continue;
        };
        let current = var.as_tensor();
        if tensor.dims() != current.dims() {
            report.mismatched.push(format!(
                "{name}: checkpoint {:?} vs model {:?}",
                tensor.dims(),
                current.dims()
            ));
            continue;
        }
        let tensor = tensor
            .to_dtype(current.dtype())
            .and_then(|t| t.to_device(current.device()))
            .map_err(crate::config::to_runtime_error)?;
        var.set(&tensor).map_err(crate::config::to_runtime_error)?;
        report.loaded.push(name);
    }
    report.unexpected = by_name.into_keys().collect();
    report.unexpected.sort();

    if mode == LoadMode::Strict && !report.is_exact() {
        return Err(TrainingError::checkpoint(format!(
            "strict load of {} failed: missing {:?}, unexpected {:?}, mismatched {:?}",
            weights_path.display(),
            report.missing,
            report.unexpected,
            report.mismatched
        )));
    }
    if !report.is_exact() {
        info!(
            "relaxed load of {}: {} loaded, {} missing, {} unexpected, {} mismatched",
            weights_path.display(),
            report.loaded.len(),
            report.missing.len(),
            report.unexpected.len(),
            report.mismatched.len()
        );
    }
    Ok(report)
}

fn remap_names(
    tensors: HashMap<String, Tensor>,
    remap: &BTreeMap<String, String>,
) -> HashMap<String, Tensor> {
    if remap.is_empty() {
        return tensors;
    }
    let mut identity = HashMap::with_capacity(tensors.len());
    let mut remapped = HashMap::new();
    for (name, tensor) in tensors {
        match remap_name(&name, remap) {
            Some(target) => {
                remapped.insert(target, tensor);
            }
            None => {
                identity.insert(name, tensor);
            }
        }
    }
    identity.extend(remapped);
    identity
}

fn remap_name(name: &str, remap: &BTreeMap<String, String>) -> Option<String> {
    remap
        .iter()
        .filter(|(from, _)| {
            name.strip_prefix(from.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
        })
        .max_by_key(|(from, _)| from.len())
        .map(|(from, to)| format!("{to}{}", &name[from.len()..]))
}

fn save_model_weights(model: &dyn Seq2SeqModel, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.named_parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path.metadata()?.len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn verified(directory: &Path, record: &FileRecord) -> Result<PathBuf, TrainingError> {
    let path = directory.join(&record.filename);
    let actual = sha256_file(&path)?;
    if actual != record.sha256 {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
