use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use simclr_model::{Param, Parameterized};

use crate::{
    logging::current_unix_timestamp,
    optimizer::{GradientScaler, GradientScalerState, Optimizer, OptimizerState},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Regime the engine was in when the checkpoint was written.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    Pretrain,
    Probe,
    Finetune,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub phase: CheckpointPhase,
    pub iteration_count: u64,
    pub epoch_count: u64,
    /// Hyperparameters the run was started with.
    pub config: TrainingConfig,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: Option<FileRecord>,
    pub scaler: FileRecord,
}

pub struct SaveRequest<'a> {
    /// Run directory that receives `model_{epoch}[_{suffix}]`.
    pub base_dir: &'a Path,
    pub suffix: Option<&'a str>,
    pub config: &'a TrainingConfig,
    pub phase: CheckpointPhase,
    pub iteration_count: u64,
    pub epoch_count: u64,
    pub model: &'a dyn Parameterized,
    pub optimizer: &'a dyn Optimizer,
    pub scheduler: Option<&'a dyn LRScheduler>,
    pub scaler: &'a GradientScaler,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Fully validated checkpoint contents; nothing has been applied yet.
pub struct LoadedCheckpoint {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub weights: HashMap<String, Tensor>,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: Option<SchedulerState>,
    pub scaler_state: GradientScalerState,
}

pub fn checkpoint_dir_name(epoch_count: u64, suffix: Option<&str>) -> String {
    match suffix.map(|s| s.trim_start_matches('_')) {
        Some(suffix) if !suffix.is_empty() => format!("model_{epoch_count}_{suffix}"),
        _ => format!("model_{epoch_count}"),
    }
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(checkpoint_dir_name(request.epoch_count, request.suffix));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to replace checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scheduler_record = match request.scheduler {
        Some(scheduler) => {
            let path = checkpoint_dir.join(SCHEDULER_FILENAME);
            write_json(&path, &scheduler.snapshot())?;
            Some(file_record(&path)?)
        }
        None => None,
    };

    let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;
    let scaler_record = file_record(&scaler_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: current_unix_timestamp(),
        phase: request.phase,
        iteration_count: request.iteration_count,
        epoch_count: request.epoch_count,
        config: request.config.clone(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        scheduler: scheduler_record,
        scaler: scaler_record,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Reads and validates a checkpoint directory. Weights are decoded onto `device`.
pub fn load_checkpoint(directory: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model)?;
    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer)?;
    let scaler_path = directory.join(&manifest.scaler.filename);
    validate_file(&scaler_path, &manifest.scaler)?;
    let scheduler_path = match manifest.scheduler.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, record)?;
            Some(path)
        }
        None => None,
    };

    let weights = candle_core::safetensors::load(&model_path, device).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to decode {}: {err}",
            model_path.display()
        ))
    })?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;
    let scaler_state: GradientScalerState = read_json(&scaler_path)?;
    let scheduler_state = match scheduler_path {
        Some(path) => Some(read_json::<SchedulerState>(&path)?),
        None => None,
    };

    Ok(LoadedCheckpoint {
        directory: directory.to_path_buf(),
        manifest,
        weights,
        optimizer_state,
        scheduler_state,
        scaler_state,
    })
}

pub fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

/// Copies stored tensors into `model`'s parameters whose names start with `prefix`.
///
/// Every targeted parameter is checked (present, same shape) before any value is written.
/// Returns the number of parameters restored.
pub fn apply_model_weights(
    model: &dyn Parameterized,
    weights: &HashMap<String, Tensor>,
    prefix: &str,
) -> Result<usize, TrainingError> {
    stage_model_weights(model, weights, prefix)?.commit()
}

/// Weights matched against a model and checked, not yet written.
#[derive(Debug)]
pub struct StagedWeights<'a> {
    targets: Vec<(&'a Param, Tensor)>,
}

impl StagedWeights<'_> {
    /// Writes every staged tensor into its parameter.
    pub fn commit(self) -> Result<usize, TrainingError> {
        let restored = self.targets.len();
        for (param, tensor) in self.targets {
            param.assign(&tensor)?;
        }
        Ok(restored)
    }
}

/// Matches stored tensors to the parameters under `prefix` without touching the model.
pub fn stage_model_weights<'a>(
    model: &'a dyn Parameterized,
    weights: &HashMap<String, Tensor>,
    prefix: &str,
) -> Result<StagedWeights<'a>, TrainingError> {
    let targets: Vec<&Param> = model
        .parameters()
        .into_iter()
        .filter(|param| param.name().starts_with(prefix))
        .collect();
    if targets.is_empty() {
        return Err(TrainingError::checkpoint(format!(
            "model has no parameters under '{prefix}'"
        )));
    }

    let mut staged = Vec::with_capacity(targets.len());
    for param in targets {
        let tensor = weights.get(param.name()).ok_or_else(|| {
            TrainingError::checkpoint(format!("checkpoint missing parameter {}", param.name()))
        })?;
        if tensor.dims() != param.var().dims() {
            return Err(TrainingError::checkpoint(format!(
                "parameter {} has shape {:?} in the checkpoint but {:?} in the model",
                param.name(),
                tensor.dims(),
                param.var().dims()
            )));
        }
        staged.push((param, tensor.to_dtype(param.var().dtype())?));
    }
    Ok(StagedWeights { targets: staged })
}

fn save_model_weights(model: &dyn Parameterized, path: &Path) -> Result<(), TrainingError> {
    let named = model.named_parameters();
    if named.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = named
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
        .map_err(|err| TrainingError::checkpoint(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to stat {}: {err}", path.display()))
        })?
        .len();
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
        sha256,
        bytes,
    })
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, record: &FileRecord) -> Result<(), TrainingError> {
    if sha256_file(path)? != record.sha256 {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
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
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
        })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use simclr_model::Param;

    struct Pair {
        params: Vec<Param>,
    }

    impl Parameterized for Pair {
        fn parameters(&self) -> Vec<&Param> {
            self.params.iter().collect()
        }

        fn parameters_mut(&mut self) -> Vec<&mut Param> {
            self.params.iter_mut().collect()
        }
    }

    fn pair(fill: f32) -> Result<Pair, TrainingError> {
        let device = Device::Cpu;
        Ok(Pair {
            params: vec![
                Param::new("encoder.w", &Tensor::full(fill, (2, 2), &device)?)?,
                Param::new("head.w", &Tensor::full(fill, 3, &device)?)?,
            ],
        })
    }

    #[test]
    fn directory_names_follow_epoch_and_suffix() {
        assert_eq!(checkpoint_dir_name(3, None), "model_3");
        assert_eq!(checkpoint_dir_name(0, Some("_dryrun")), "model_0_dryrun");
        assert_eq!(checkpoint_dir_name(7, Some("timeout")), "model_7_timeout");
    }

    #[test]
    fn prefix_restore_leaves_other_parameters_alone() -> Result<(), TrainingError> {
        let source = pair(1.0)?;
        let target = pair(0.0)?;
        let weights: HashMap<String, Tensor> = source
            .named_parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();

        assert_eq!(apply_model_weights(&target, &weights, "encoder.")?, 1);
        let encoder = target.params[0].var().as_tensor().sum_all()?.to_scalar::<f32>()?;
        let head = target.params[1].var().as_tensor().sum_all()?.to_scalar::<f32>()?;
        assert_eq!((encoder, head), (4.0, 0.0));
        Ok(())
    }

    #[test]
    fn shape_mismatch_aborts_before_writing() -> Result<(), TrainingError> {
        let target = pair(0.0)?;
        let mut weights = HashMap::new();
        weights.insert("encoder.w".to_string(), Tensor::ones((2, 2), DType::F32, &Device::Cpu)?);
        weights.insert("head.w".to_string(), Tensor::ones(4, DType::F32, &Device::Cpu)?);

        assert!(apply_model_weights(&target, &weights, "").is_err());
        let encoder = target.params[0].var().as_tensor().sum_all()?.to_scalar::<f32>()?;
        assert_eq!(encoder, 0.0);
        Ok(())
    }
}
