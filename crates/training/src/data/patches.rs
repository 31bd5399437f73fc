use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use simclr_model::INPUT_BANDS;

use super::{class_balances, Batch, BatchStream, Result};
use crate::TrainingError;

pub const BANDS_KEY: &str = "bands";
pub const LABELS_KEY: &str = "labels";
const SAMPLE_EXTENSION: &str = "safetensors";

/// One decoded patch: `bands` is `(INPUT_BANDS, height, width)` in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub bands: Vec<f32>,
    pub height: usize,
    pub width: usize,
    pub labels: Vec<f32>,
}

/// Patches listed in a split file, one safetensors file per sample.
#[derive(Debug, Clone)]
pub struct PatchDataset {
    root: PathBuf,
    samples: Vec<PathBuf>,
}

impl PatchDataset {
    /// Each non-empty line of `split_file` names a sample relative to `root`.
    /// The `.safetensors` extension is optional.
    pub fn from_split_file(root: impl AsRef<Path>, split_file: impl AsRef<Path>) -> Result<Self> {
        let split_file = split_file.as_ref();
        let contents = std::fs::read_to_string(split_file).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read split file {}: {err}",
                split_file.display()
            ))
        })?;
        let names = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());
        Self::from_names(root, names)
    }

    pub fn from_names<S: AsRef<str>>(
        root: impl AsRef<Path>,
        names: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let samples = names
            .into_iter()
            .map(|name| {
                let mut path = root.join(name.as_ref());
                if path.extension().is_none() {
                    path.set_extension(SAMPLE_EXTENSION);
                }
                path
            })
            .collect();
        Ok(Self { root, samples })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_path(&self, index: usize) -> Option<&Path> {
        self.samples.get(index).map(PathBuf::as_path)
    }

    pub fn load(&self, index: usize) -> Result<Sample> {
        let path = self.sample_path(index).ok_or_else(|| {
            TrainingError::runtime(format!(
                "sample index {index} out of range for {} samples",
                self.len()
            ))
        })?;
        read_patch(path)
    }
}

/// Reads one sample file.
pub fn read_patch(path: &Path) -> Result<Sample> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu).map_err(|err| {
        TrainingError::runtime(format!("failed to decode {}: {err}", path.display()))
    })?;
    let bands = tensors.get(BANDS_KEY).ok_or_else(|| {
        TrainingError::runtime(format!("{} has no '{BANDS_KEY}' tensor", path.display()))
    })?;
    let (channels, height, width) = bands.dims3()?;
    if channels != INPUT_BANDS {
        return Err(TrainingError::runtime(format!(
            "{} holds {channels} bands, expected {INPUT_BANDS}",
            path.display()
        )));
    }
    let labels = match tensors.get(LABELS_KEY) {
        Some(labels) => labels.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        None => Vec::new(),
    };
    Ok(Sample {
        bands: bands.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        height,
        width,
        labels,
    })
}

/// Writes one sample file in the layout [`read_patch`] expects.
pub fn write_patch(path: &Path, bands: &Tensor, labels: Option<&Tensor>) -> Result<()> {
    let mut tensors = HashMap::new();
    tensors.insert(BANDS_KEY.to_string(), bands.to_dtype(DType::F32)?);
    if let Some(labels) = labels {
        tensors.insert(LABELS_KEY.to_string(), labels.to_dtype(DType::F32)?);
    }
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}

/// Random dihedral transform of a `(channels, n, n)` patch: rotation by a
/// multiple of 90 degrees followed by optional horizontal and vertical flips.
/// Non-square patches are only flipped.
pub fn augment_patch(
    bands: &[f32],
    channels: usize,
    height: usize,
    width: usize,
    rng: &mut StdRng,
) -> Vec<f32> {
    let quarter_turns = if height == width { rng.gen_range(0..4) } else { 0 };
    let flip_h: bool = rng.gen();
    let flip_v: bool = rng.gen();

    let plane = height * width;
    let mut out = vec![0f32; bands.len()];
    for y in 0..height {
        for x in 0..width {
            let (mut sy, mut sx) = (y, x);
            for _ in 0..quarter_turns {
                (sy, sx) = (sx, height - 1 - sy);
            }
            if flip_h {
                sx = width - 1 - sx;
            }
            if flip_v {
                sy = height - 1 - sy;
            }
            for c in 0..channels {
                out[c * plane + y * width + x] = bands[c * plane + sy * width + sx];
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    /// Views per sample; 1 yields `(batch, bands, h, w)` directly.
    pub num_transforms: usize,
    pub with_labels: bool,
    pub shuffle: bool,
    pub augment: bool,
    pub seed: u64,
    /// Dedicated decode threads (0 keeps the global rayon pool).
    pub num_workers: usize,
    /// Expected label width; samples with another width are rejected.
    pub num_classes: usize,
}

/// Batches a [`PatchDataset`], decoding samples in parallel with rayon.
pub struct PatchLoader {
    dataset: Arc<PatchDataset>,
    options: LoaderOptions,
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    balances: Option<Vec<f32>>,
    pool: Option<rayon::ThreadPool>,
}

impl PatchLoader {
    pub fn new(dataset: Arc<PatchDataset>, options: LoaderOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if options.num_transforms == 0 {
            return Err(TrainingError::initialization(
                "num_transforms must be greater than zero",
            ));
        }
        let pool = if options.num_workers > 0 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(options.num_workers)
                    .build()
                    .map_err(|err| {
                        TrainingError::initialization(format!(
                            "failed to start decode pool: {err}"
                        ))
                    })?,
            )
        } else {
            None
        };

        let mut loader = Self {
            order: (0..dataset.len()).collect(),
            dataset,
            options,
            cursor: 0,
            epoch: 0,
            balances: None,
            pool,
        };
        if loader.options.with_labels {
            loader.balances = Some(loader.scan_balances()?);
        }
        Ok(loader)
    }

    pub fn dataset(&self) -> &PatchDataset {
        &self.dataset
    }

    fn scan_balances(&self) -> Result<Vec<f32>> {
        let dataset = &self.dataset;
        let num_classes = self.options.num_classes;
        let labels = self.run(|| {
            (0..dataset.len())
                .into_par_iter()
                .map(|index| {
                    let sample = dataset.load(index)?;
                    check_labels(&sample, num_classes, index)?;
                    Ok(sample.labels)
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(class_balances(labels.iter().map(Vec::as_slice), num_classes))
    }

    fn run<T: Send>(&self, job: impl FnOnce() -> T + Send) -> T {
        match &self.pool {
            Some(pool) => pool.install(job),
            None => job(),
        }
    }

    fn view_seed(&self, position: usize, view: usize) -> u64 {
        self.options
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(self.epoch << 40)
            .wrapping_add((position as u64) << 8)
            .wrapping_add(view as u64)
    }

    fn decode(&self, position: usize, index: usize) -> Result<(Vec<f32>, Vec<f32>, usize, usize)> {
        let sample = self.dataset.load(index)?;
        if self.options.with_labels {
            check_labels(&sample, self.options.num_classes, index)?;
        }
        let mut views = Vec::with_capacity(sample.bands.len() * self.options.num_transforms);
        for view in 0..self.options.num_transforms {
            if self.options.augment {
                let mut rng = StdRng::seed_from_u64(self.view_seed(position, view));
                views.extend(augment_patch(
                    &sample.bands,
                    INPUT_BANDS,
                    sample.height,
                    sample.width,
                    &mut rng,
                ));
            } else {
                views.extend_from_slice(&sample.bands);
            }
        }
        Ok((views, sample.labels, sample.height, sample.width))
    }
}

fn check_labels(sample: &Sample, num_classes: usize, index: usize) -> Result<()> {
    if sample.labels.len() != num_classes {
        return Err(TrainingError::runtime(format!(
            "sample {index} carries {} labels, expected {num_classes}",
            sample.labels.len()
        )));
    }
    Ok(())
}

impl BatchStream for PatchLoader {
    fn len(&self) -> usize {
        self.dataset.len() / self.options.batch_size
    }

    fn begin_epoch(&mut self) -> Result<()> {
        self.order = (0..self.dataset.len()).collect();
        if self.options.shuffle {
            let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
        self.epoch += 1;
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch_size = self.options.batch_size;
        if self.cursor + batch_size > self.order.len() {
            return Ok(None);
        }
        let start = self.cursor;
        let indices = &self.order[start..start + batch_size];
        let decoded = self.run(|| {
            indices
                .par_iter()
                .enumerate()
                .map(|(offset, &index)| self.decode(start + offset, index))
                .collect::<Result<Vec<_>>>()
        })?;
        self.cursor += batch_size;

        let (height, width) = match decoded.first() {
            Some((_, _, h, w)) => (*h, *w),
            None => return Ok(None),
        };
        let mut pixels = Vec::with_capacity(decoded.iter().map(|d| d.0.len()).sum());
        let mut labels = Vec::new();
        for (index, (views, sample_labels, h, w)) in decoded.into_iter().enumerate() {
            if (h, w) != (height, width) {
                return Err(TrainingError::runtime(format!(
                    "patch {index} of the batch is {h}x{w}, expected {height}x{width}"
                )));
            }
            pixels.extend(views);
            labels.extend(sample_labels);
        }

        let views = self.options.num_transforms;
        let images = if views == 1 {
            Tensor::from_vec(pixels, (batch_size, INPUT_BANDS, height, width), &Device::Cpu)?
        } else {
            Tensor::from_vec(
                pixels,
                (batch_size, views, INPUT_BANDS, height, width),
                &Device::Cpu,
            )?
        };
        let labels = if self.options.with_labels {
            Some(Tensor::from_vec(
                labels,
                (batch_size, self.options.num_classes),
                &Device::Cpu,
            )?)
        } else {
            None
        };
        Ok(Some(Batch { images, labels }))
    }

    fn balances(&self) -> Option<&[f32]> {
        self.balances.as_deref()
    }

    fn num_classes(&self) -> usize {
        if self.options.with_labels {
            self.options.num_classes
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path, count: usize, size: usize) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for idx in 0..count {
            let bands = Tensor::full(idx as f32, (INPUT_BANDS, size, size), &Device::Cpu)?;
            let mut labels = vec![0f32; 3];
            labels[idx % 3] = 1.0;
            let labels = Tensor::from_vec(labels, 3, &Device::Cpu)?;
            let name = format!("patch_{idx:03}");
            write_patch(&dir.join(format!("{name}.safetensors")), &bands, Some(&labels))?;
            names.push(name);
        }
        Ok(names)
    }

    fn options(views: usize) -> LoaderOptions {
        LoaderOptions {
            batch_size: 2,
            num_transforms: views,
            with_labels: true,
            shuffle: true,
            augment: views > 1,
            seed: 7,
            num_workers: 0,
            num_classes: 3,
        }
    }

    #[test]
    fn augmentation_permutes_pixels_per_channel() {
        let n = 3;
        let bands: Vec<f32> = (0..2 * n * n).map(|v| v as f32).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let out = augment_patch(&bands, 2, n, n, &mut rng);
        let mut first: Vec<f32> = out[..n * n].to_vec();
        first.sort_by(f32::total_cmp);
        assert_eq!(first, bands[..n * n].to_vec());
        // the centre pixel of a 3x3 patch is fixed by every dihedral transform
        assert_eq!(out[4], 4.0);
        assert_eq!(out[n * n + 4], 13.0);
    }

    #[test]
    fn multi_view_batches_stack_views() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let names = write_fixture(dir.path(), 5, 4)?;
        let dataset = Arc::new(PatchDataset::from_names(dir.path(), &names)?);
        let mut loader = PatchLoader::new(dataset, options(2))?;
        assert_eq!(loader.len(), 2);

        loader.begin_epoch()?;
        let batch = loader.next_batch()?.ok_or_else(|| TrainingError::runtime("empty"))?;
        assert_eq!(batch.images.dims(), &[2, 2, INPUT_BANDS, 4, 4]);
        assert_eq!(batch.require_labels()?.dims(), &[2, 3]);
        assert!(loader.next_batch()?.is_some());
        assert!(loader.next_batch()?.is_none());

        let balances = loader.balances().map(<[f32]>::to_vec).unwrap_or_default();
        approx::assert_abs_diff_eq!(balances[0], 0.4, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn single_view_batches_are_four_dimensional() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let names = write_fixture(dir.path(), 4, 4)?;
        let dataset = Arc::new(PatchDataset::from_names(dir.path(), &names)?);
        let mut loader = PatchLoader::new(dataset, options(1))?;
        loader.begin_epoch()?;
        let batch = loader.next_batch()?.ok_or_else(|| TrainingError::runtime("empty"))?;
        assert_eq!(batch.images.dims(), &[2, INPUT_BANDS, 4, 4]);
        Ok(())
    }

    #[test]
    fn shuffle_is_reproducible_for_a_seed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let names = write_fixture(dir.path(), 6, 2)?;
        let dataset = Arc::new(PatchDataset::from_names(dir.path(), &names)?);
        let first_values = |loader: &mut PatchLoader| -> Result<Vec<f32>> {
            loader.begin_epoch()?;
            let batch = loader.next_batch()?.ok_or_else(|| TrainingError::runtime("empty"))?;
            Ok(batch.images.flatten_all()?.to_vec1::<f32>()?)
        };
        let mut a = PatchLoader::new(dataset.clone(), options(1))?;
        let mut b = PatchLoader::new(dataset, options(1))?;
        assert_eq!(first_values(&mut a)?, first_values(&mut b)?);
        Ok(())
    }

    #[test]
    fn wrong_band_count_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.safetensors");
        let bands = Tensor::zeros((3, 4, 4), DType::F32, &Device::Cpu)?;
        write_patch(&path, &bands, None)?;
        assert!(read_patch(&path).is_err());
        Ok(())
    }
}
