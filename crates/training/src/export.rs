//! Standalone backbone artifact for inference outside the training stack.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, Arc},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, SeedableRng};
use safetensors::SafeTensors;
use simclr_model::{EncoderConfig, Parameterized, ResidualEncoder, INPUT_BANDS, INPUT_SIZE};
use tracing::info;

use crate::{checkpoint, CheckpointPhase, Engine, TrainingError};

pub const BACKBONE_FILENAME: &str = "backbone.safetensors";
pub const INPUT_NAME: &str = "input_sentinel2_10_bands_120";

const ENCODER_PREFIX: &str = "encoder";
const KEY_INPUT_NAME: &str = "input_name";
const KEY_INPUT_SHAPE: &str = "input_shape";
const KEY_OUTPUT_NAME: &str = "output_name";
const KEY_ENCODER: &str = "encoder_config";

/// Metadata stored next to the exported weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneMetadata {
    pub input_name: String,
    /// `batch` marks the dynamic axis.
    pub input_shape: String,
    pub output_name: String,
    pub encoder: EncoderConfig,
}

impl BackboneMetadata {
    pub fn for_encoder(encoder: &EncoderConfig) -> Self {
        Self {
            input_name: INPUT_NAME.to_string(),
            input_shape: format!("[batch,{INPUT_BANDS},{INPUT_SIZE},{INPUT_SIZE}]"),
            output_name: format!("representation_{}", encoder.output_dim()),
            encoder: encoder.clone(),
        }
    }

    fn to_map(&self) -> Result<HashMap<String, String>, TrainingError> {
        let mut map = HashMap::new();
        map.insert(KEY_INPUT_NAME.to_string(), self.input_name.clone());
        map.insert(KEY_INPUT_SHAPE.to_string(), self.input_shape.clone());
        map.insert(KEY_OUTPUT_NAME.to_string(), self.output_name.clone());
        map.insert(KEY_ENCODER.to_string(), serde_json::to_string(&self.encoder)?);
        Ok(map)
    }

    fn from_map(map: &HashMap<String, String>) -> Result<Self, TrainingError> {
        let field = |key: &str| {
            map.get(key).cloned().ok_or_else(|| {
                TrainingError::checkpoint(format!("backbone metadata is missing '{key}'"))
            })
        };
        Ok(Self {
            input_name: field(KEY_INPUT_NAME)?,
            input_shape: field(KEY_INPUT_SHAPE)?,
            output_name: field(KEY_OUTPUT_NAME)?,
            encoder: serde_json::from_str(&field(KEY_ENCODER)?)?,
        })
    }
}

/// Writes the encoder of the checkpoint in `checkpoint_dir` to `out_dir/backbone.safetensors`.
///
/// Works for pretraining and downstream checkpoints alike; only `encoder.*` is exported.
pub fn export_backbone(checkpoint_dir: &Path, out_dir: &Path) -> Result<PathBuf, TrainingError> {
    let (engine, phase) = restore_engine(checkpoint_dir, &Device::Cpu)?;
    let encoder = match (engine.pretrain_model(), engine.classifier()) {
        (Some(model), _) => model.encoder(),
        (None, Some(model)) => model.encoder(),
        (None, None) => return Err(TrainingError::invariant("restored engine has no model")),
    };

    let metadata = BackboneMetadata::for_encoder(encoder.config());
    fs::create_dir_all(out_dir)?;
    let path = out_dir.join(BACKBONE_FILENAME);
    let tensors: Vec<(String, Tensor)> = encoder
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    safetensors::serialize_to_file(tensors, &Some(metadata.to_map()?), &path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
    })?;
    info!(
        path = %path.display(),
        ?phase,
        output = %metadata.output_name,
        "backbone exported"
    );
    Ok(path)
}

/// Rebuilds the engine that wrote `checkpoint_dir` from its stored configuration,
/// with every stored tensor restored.
pub fn restore_engine(
    checkpoint_dir: &Path,
    device: &Device,
) -> Result<(Engine, CheckpointPhase), TrainingError> {
    let manifest = checkpoint::load_manifest(checkpoint_dir)?;
    let phase = manifest.phase;
    let mut config = manifest.config;
    config.runtime.load_checkpoint = Some(checkpoint_dir.to_path_buf());
    config.downstream.linear_probe = phase == CheckpointPhase::Probe;
    config.downstream.fine_tuning = phase == CheckpointPhase::Finetune;
    let downstream = phase != CheckpointPhase::Pretrain;
    if downstream {
        // downstream state is restored when the head is renewed
        config.runtime.epochs = -1;
        config.downstream.ftop_epochs = 0;
    }

    let mut engine = Engine::new(config, device.clone(), Arc::new(AtomicBool::new(false)))?;
    if downstream {
        engine.renew_head()?;
    }
    if !engine.already_loaded() {
        return Err(TrainingError::checkpoint(format!(
            "{} was not restored",
            checkpoint_dir.display()
        )));
    }
    Ok((engine, phase))
}

/// Reads only the metadata header of an exported backbone.
pub fn read_backbone_metadata(path: &Path) -> Result<BackboneMetadata, TrainingError> {
    let buffer = fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&buffer).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse {}: {err}", path.display()))
    })?;
    let map = header.metadata().as_ref().ok_or_else(|| {
        TrainingError::checkpoint(format!("{} carries no metadata", path.display()))
    })?;
    BackboneMetadata::from_map(map)
}

/// Rebuilds an inference encoder from an exported backbone file.
pub fn load_backbone(
    path: &Path,
    device: &Device,
) -> Result<(ResidualEncoder, BackboneMetadata), TrainingError> {
    let metadata = read_backbone_metadata(path)?;
    let weights = candle_core::safetensors::load(path, device).map_err(|err| {
        TrainingError::checkpoint(format!("failed to decode {}: {err}", path.display()))
    })?;
    let mut rng = StdRng::seed_from_u64(0);
    let mut encoder = ResidualEncoder::new(ENCODER_PREFIX, &metadata.encoder, &mut rng, device)?;
    checkpoint::apply_model_weights(&encoder, &weights, "encoder.")?;
    encoder.set_trainable(false);
    Ok((encoder, metadata))
}
