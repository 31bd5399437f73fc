use std::{
    fs,
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tracing::info;

use super::Result;
use crate::{config::DataConfig, TrainingError};

pub const TRAIN_SPLIT: &str = "train.txt";
pub const VAL_SPLIT: &str = "val.txt";
pub const TEST_SPLIT: &str = "test.txt";

/// Split lists written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPaths {
    pub train: PathBuf,
    pub val: PathBuf,
    pub test: PathBuf,
}

/// Builds the train/val/test sample lists and writes them under `out_dir`.
///
/// With `split_dir` set the official lists are read from it; otherwise every
/// `.safetensors` file in `data_path` is shuffled with `seed` and carved into
/// test, validation and train portions. Each list is then truncated to
/// `truncate_at` percent (rounded up, at least one sample when non-empty).
pub fn split_datasets(data: &DataConfig, seed: u64, out_dir: &Path) -> Result<SplitPaths> {
    let (train, val, test) = match &data.split_dir {
        Some(dir) => (
            read_list(&dir.join(TRAIN_SPLIT))?,
            read_list(&dir.join(VAL_SPLIT))?,
            read_list(&dir.join(TEST_SPLIT))?,
        ),
        None => random_split(data, seed)?,
    };

    let train = truncate(train, data.truncate_at);
    let val = truncate(val, data.truncate_at);
    let test = truncate(test, data.truncate_at);
    info!(
        train = train.len(),
        val = val.len(),
        test = test.len(),
        "dataset splits ready"
    );

    fs::create_dir_all(out_dir)?;
    let paths = SplitPaths {
        train: out_dir.join(TRAIN_SPLIT),
        val: out_dir.join(VAL_SPLIT),
        test: out_dir.join(TEST_SPLIT),
    };
    write_list(&paths.train, &train)?;
    write_list(&paths.val, &val)?;
    write_list(&paths.test, &test)?;
    Ok(paths)
}

fn random_split(data: &DataConfig, seed: u64) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let entries = fs::read_dir(&data.data_path).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to list {}: {err}",
            data.data_path.display()
        ))
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("safetensors") {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            names.push(name.to_string());
        }
    }
    if names.is_empty() {
        return Err(TrainingError::initialization(format!(
            "no samples found in {}",
            data.data_path.display()
        )));
    }
    names.sort();
    names.shuffle(&mut StdRng::seed_from_u64(seed));

    let total = names.len();
    let n_test = (total as f64 * data.test_split).floor() as usize;
    let n_val = (total as f64 * data.val_split).floor() as usize;
    let train = names.split_off(n_test + n_val);
    let val = names.split_off(n_test);
    Ok((train, val, names))
}

fn truncate(mut names: Vec<String>, percent: f64) -> Vec<String> {
    if names.is_empty() {
        return names;
    }
    let keep = ((names.len() as f64) * percent / 100.0).ceil() as usize;
    names.truncate(keep.clamp(1, names.len()));
    names
}

fn read_list(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn write_list(path: &Path, names: &[String]) -> Result<()> {
    let mut contents = names.join("\n");
    contents.push('\n');
    fs::write(path, contents)?;
    Ok(())
}
