#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::Result;
use candle_core::{Device, Tensor};
use simclr_model::Parameterized;
use training::{
    data::patches::write_patch, Engine, MemorySink, RunLogger, TensorStream, TrainingConfig,
};

pub const SIZE: usize = 16;
pub const CLASSES: usize = 3;

const TINY_RUN: &str = r#"
[experiment]
seed = 3
uuid = "fixture"

[data]
data_path = "patches"
batch_size = 2
val_split = 0.2
test_split = 0.2

[model]
backbone = "resnet-tiny"
fc_hid_dim = 16
fc_out_dim = 8

[optimization]
lr = 0.001
clip_norm = 1.0
acc_grad_steps = 4
eval_every = 3

[downstream]
num_classes = 3
ftop_batch_size = 2
ftop_epochs = 0

[runtime]
epochs = 0
cuda = false
progress = false
log_formats = ["json", "csv"]
"#;

/// Small CPU-only experiment rooted at `dir`.
pub fn tiny_config(dir: &Path) -> Result<TrainingConfig> {
    let path = dir.join("run.toml");
    fs::write(&path, TINY_RUN)?;
    Ok(TrainingConfig::from_path(&path)?)
}

pub fn engine_with_sink(config: TrainingConfig) -> Result<(Engine, MemorySink)> {
    engine_with_flag(config, Arc::new(AtomicBool::new(false)))
}

pub fn engine_with_flag(
    config: TrainingConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<(Engine, MemorySink)> {
    let mut engine = Engine::new(config, Device::Cpu, shutdown)?;
    let sink = MemorySink::new();
    engine.set_logger(RunLogger::new("fixture.simclr.test.seed03", vec![Box::new(sink.clone())]));
    Ok((engine, sink))
}

/// Two-view unlabeled stream of `batches` batches of two samples.
pub fn pair_stream(batches: usize) -> Result<TensorStream> {
    let images = Tensor::randn(0f32, 1.0, (batches * 2, 2, 10, SIZE, SIZE), &Device::Cpu)?;
    Ok(TensorStream::new(images, None, 2)?)
}

/// Single-view labeled stream; sample `i` is positive for class `i % CLASSES`.
pub fn labeled_stream(batches: usize) -> Result<TensorStream> {
    let samples = batches * 2;
    let images = Tensor::randn(0f32, 1.0, (samples, 10, SIZE, SIZE), &Device::Cpu)?;
    let mut labels = vec![0f32; samples * CLASSES];
    for idx in 0..samples {
        labels[idx * CLASSES + idx % CLASSES] = 1.0;
    }
    let labels = Tensor::from_vec(labels, (samples, CLASSES), &Device::Cpu)?;
    Ok(TensorStream::new(images, Some(labels), 2)?)
}

/// Writes `count` labeled patch files into `dir`.
pub fn write_patches(dir: &Path, count: usize) -> Result<()> {
    fs::create_dir_all(dir)?;
    for idx in 0..count {
        let bands = Tensor::randn(0f32, 1.0, (10, SIZE, SIZE), &Device::Cpu)?;
        let mut labels = vec![0f32; CLASSES];
        labels[idx % CLASSES] = 1.0;
        let labels = Tensor::from_vec(labels, CLASSES, &Device::Cpu)?;
        write_patch(&dir.join(format!("patch_{idx:03}.safetensors")), &bands, Some(&labels))?;
    }
    Ok(())
}

pub fn steps(sink: &MemorySink, namespace: &str) -> Vec<u64> {
    sink.namespace(namespace).iter().map(|record| record.step).collect()
}

/// Deep copies of every parameter, keyed by name.
pub fn weights_of(model: &dyn Parameterized) -> Result<Vec<(String, Tensor)>> {
    model
        .named_parameters()
        .into_iter()
        .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
        .collect()
}

/// Names of the parameters whose values differ from `before`.
pub fn changed_since(before: &[(String, Tensor)], model: &dyn Parameterized) -> Result<Vec<String>> {
    let mut changed = Vec::new();
    for ((name, old), (_, var)) in before.iter().zip(model.named_parameters()) {
        let diff = (old - var.as_tensor())?.abs()?.max_all()?.to_scalar::<f32>()?;
        if diff != 0.0 {
            changed.push(name.clone());
        }
    }
    Ok(changed)
}
