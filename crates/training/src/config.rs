use candle_core::DType;
use serde::{Deserialize, Serialize};
use simclr_model::{EncoderConfig, ModelConfig};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Hyperparameters for one experiment. The whole struct is snapshotted into
/// every checkpoint so a run can be rebuilt from its checkpoint alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub optimization: OptimizationConfig,
    #[serde(default)]
    pub downstream: DownstreamConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
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

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.batch_size < 2 {
            errors.push("data.batch_size must be at least 2 for contrastive pairs".to_string());
        }
        if !(0.0..1.0).contains(&self.data.val_split) {
            errors.push("data.val_split must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&self.data.test_split) {
            errors.push("data.test_split must be in [0, 1)".to_string());
        }
        if self.data.val_split + self.data.test_split >= 1.0 {
            errors.push("data.val_split + data.test_split must be below 1".to_string());
        }
        if !(self.data.truncate_at > 0.0 && self.data.truncate_at <= 100.0) {
            errors.push("data.truncate_at must be in (0, 100]".to_string());
        }

        if let Err(err) = self.model.resolve() {
            errors.push(format!("model: {err}"));
        }

        let opt = &self.optimization;
        if opt.lr <= 0.0 {
            errors.push("optimization.lr must be greater than 0".to_string());
        }
        if opt.wd < 0.0 {
            errors.push("optimization.wd must be >= 0".to_string());
        }
        if opt.acc_grad_steps == 0 {
            errors.push("optimization.acc_grad_steps must be greater than 0".to_string());
        }
        if opt.eval_every == 0 {
            errors.push("optimization.eval_every must be greater than 0".to_string());
        }
        if opt.ntx_temp <= 0.0 {
            errors.push("optimization.ntx_temp must be greater than 0".to_string());
        }
        if opt.sched_t_max == 0 {
            errors.push("optimization.sched_t_max must be greater than 0".to_string());
        }

        let ds = &self.downstream;
        if ds.linear_probe && ds.fine_tuning {
            errors.push(
                "downstream.linear_probe and downstream.fine_tuning are mutually exclusive"
                    .to_string(),
            );
        }
        if ds.num_classes == 0 {
            errors.push("downstream.num_classes must be greater than 0".to_string());
        }
        if ds.ftop_batch_size == 0 {
            errors.push("downstream.ftop_batch_size must be greater than 0".to_string());
        }

        if self.runtime.save_freq == 0 {
            errors.push("runtime.save_freq must be greater than 0".to_string());
        }
        if self.runtime.checkpoint_dir.as_os_str().is_empty() {
            errors.push("runtime.checkpoint_dir must not be empty".to_string());
        }
        if self.runtime.log_formats.is_empty() {
            errors.push("runtime.log_formats must name at least one sink".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.data_path, base);
        if let Some(dir) = self.data.split_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
        absolutize_in_place(&mut self.runtime.checkpoint_dir, base);
        absolutize_in_place(&mut self.runtime.log_dir, base);
        if let Some(path) = self.runtime.load_checkpoint.as_mut() {
            absolutize_in_place(path, base);
        }
    }

    /// Whether a downstream phase (probe or fine-tune) follows pretraining.
    pub fn wants_downstream(&self) -> bool {
        self.downstream.linear_probe || self.downstream.fine_tuning
    }

    /// `{uuid}.{algo}.{dataset}.seed{seed}`.
    pub fn experiment_name(&self, uuid: &str) -> String {
        format!(
            "{}.{}.{}.seed{:02}",
            uuid, self.experiment.algo, self.experiment.dataset_handle, self.experiment.seed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub seed: u64,
    /// Fixed run id; a fresh v4 uuid is generated when absent.
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_algo")]
    pub algo: String,
    #[serde(default = "default_dataset_handle")]
    pub dataset_handle: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            uuid: None,
            algo: default_algo(),
            dataset_handle: default_dataset_handle(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding one safetensors file per patch.
    pub data_path: PathBuf,
    /// Directory with official `train.txt` / `val.txt` / `test.txt` lists.
    #[serde(default)]
    pub split_dir: Option<PathBuf>,
    #[serde(default = "default_split_fraction")]
    pub val_split: f64,
    #[serde(default = "default_split_fraction")]
    pub test_split: f64,
    /// Percentage of each split kept.
    #[serde(default = "default_truncate_at")]
    pub truncate_at: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rayon threads used to decode samples (0 keeps the global pool).
    #[serde(default)]
    pub num_workers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    /// Named encoder preset; ignored when `encoder` is set explicitly.
    #[serde(default = "default_backbone")]
    pub backbone: String,
    #[serde(default)]
    pub encoder: Option<EncoderConfig>,
    #[serde(default = "default_fc_hid_dim")]
    pub fc_hid_dim: usize,
    #[serde(default = "default_fc_out_dim")]
    pub fc_out_dim: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            backbone: default_backbone(),
            encoder: None,
            fc_hid_dim: default_fc_hid_dim(),
            fc_out_dim: default_fc_out_dim(),
        }
    }
}

impl ModelSection {
    pub fn resolve(&self) -> Result<ModelConfig, TrainingError> {
        let encoder = match &self.encoder {
            Some(encoder) => encoder.clone(),
            None => EncoderConfig::preset(&self.backbone)?,
        };
        let config = ModelConfig {
            encoder,
            fc_hid_dim: self.fc_hid_dim,
            fc_out_dim: self.fc_out_dim,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationConfig {
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_wd")]
    pub wd: f64,
    /// Global gradient-norm bound; `<= 0` disables clipping.
    #[serde(default = "default_clip_norm")]
    pub clip_norm: f64,
    #[serde(default = "default_acc_grad_steps")]
    pub acc_grad_steps: usize,
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    #[serde(default)]
    pub lars: bool,
    #[serde(default)]
    pub sched: bool,
    #[serde(default = "default_sched_t_max")]
    pub sched_t_max: usize,
    #[serde(default = "default_ntx_temp")]
    pub ntx_temp: f64,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            wd: default_wd(),
            clip_norm: default_clip_norm(),
            acc_grad_steps: default_acc_grad_steps(),
            eval_every: default_eval_every(),
            lars: false,
            sched: false,
            sched_t_max: default_sched_t_max(),
            ntx_temp: default_ntx_temp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamConfig {
    #[serde(default)]
    pub linear_probe: bool,
    #[serde(default)]
    pub fine_tuning: bool,
    #[serde(default = "default_ftop_epochs")]
    pub ftop_epochs: i64,
    #[serde(default = "default_batch_size")]
    pub ftop_batch_size: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            linear_probe: false,
            fine_tuning: false,
            ftop_epochs: default_ftop_epochs(),
            ftop_batch_size: default_batch_size(),
            num_classes: default_num_classes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Pretraining epochs; the loop runs while `epoch_count <= epochs`.
    #[serde(default = "default_epochs")]
    pub epochs: i64,
    #[serde(default = "default_save_freq")]
    pub save_freq: usize,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_cuda")]
    pub cuda: bool,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default)]
    pub load_checkpoint: Option<PathBuf>,
    #[serde(default = "default_log_formats")]
    pub log_formats: Vec<LogFormat>,
    #[serde(default = "default_progress")]
    pub progress: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            save_freq: default_save_freq(),
            precision: Precision::default(),
            cuda: default_cuda(),
            checkpoint_dir: default_checkpoint_dir(),
            log_dir: default_log_dir(),
            load_checkpoint: None,
            log_formats: default_log_formats(),
            progress: default_progress(),
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
}

impl Precision {
    pub fn compute_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Stdout,
    Json,
    Csv,
    Tensorboard,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_algo() -> String {
    "simclr".to_string()
}

fn default_dataset_handle() -> String {
    "bigearthnet".to_string()
}

fn default_split_fraction() -> f64 {
    0.1
}

fn default_truncate_at() -> f64 {
    100.0
}

fn default_batch_size() -> usize {
    128
}

fn default_backbone() -> String {
    "resnet18".to_string()
}

fn default_fc_hid_dim() -> usize {
    128
}

fn default_fc_out_dim() -> usize {
    64
}

fn default_lr() -> f64 {
    3e-4
}

fn default_wd() -> f64 {
    1e-6
}

fn default_clip_norm() -> f64 {
    60.0
}

fn default_acc_grad_steps() -> usize {
    8
}

fn default_eval_every() -> usize {
    100
}

fn default_sched_t_max() -> usize {
    800
}

fn default_ntx_temp() -> f64 {
    0.07
}

fn default_ftop_epochs() -> i64 {
    10
}

fn default_num_classes() -> usize {
    19
}

fn default_epochs() -> i64 {
    100
}

fn default_save_freq() -> usize {
    1
}

fn default_cuda() -> bool {
    true
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_formats() -> Vec<LogFormat> {
    vec![LogFormat::Stdout, LogFormat::Json, LogFormat::Csv]
}

fn default_progress() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("dashboard error: {0}")]
    Dashboard(String),
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

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(value: candle_core::Error) -> Self {
        TrainingError::Runtime(value.to_string())
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
