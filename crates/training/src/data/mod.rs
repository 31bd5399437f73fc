//! Batch streams consumed by the training engine.
//!
//! The engine only relies on [`BatchStream`]: a finite pass of batches that
//! can be restarted with [`BatchStream::begin_epoch`]. Multi-view streams
//! yield images shaped `(batch, views, bands, h, w)`; single-view streams
//! yield `(batch, bands, h, w)` with multi-hot labels `(batch, num_classes)`.

pub mod patches;
pub mod split;

pub use patches::{augment_patch, LoaderOptions, PatchDataset, PatchLoader, Sample};
pub use split::{split_datasets, SplitPaths};

use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Option<Tensor>,
}

impl Batch {
    pub fn size(&self) -> Result<usize> {
        Ok(self.images.dim(0)?)
    }

    pub fn require_labels(&self) -> Result<&Tensor> {
        self.labels
            .as_ref()
            .ok_or_else(|| TrainingError::runtime("batch carries no labels"))
    }
}

pub trait BatchStream: Send {
    /// Batches per full pass.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restarts the pass (reshuffling when the stream shuffles).
    fn begin_epoch(&mut self) -> Result<()>;

    fn next_batch(&mut self) -> Result<Option<Batch>>;

    /// Per-class weights summing to one; `None` for unlabeled streams.
    fn balances(&self) -> Option<&[f32]>;

    fn num_classes(&self) -> usize;
}

/// Pulls the next batch, restarting the stream once when it is exhausted.
pub fn next_cycled(stream: &mut dyn BatchStream) -> Result<Batch> {
    if let Some(batch) = stream.next_batch()? {
        return Ok(batch);
    }
    stream.begin_epoch()?;
    stream
        .next_batch()?
        .ok_or_else(|| TrainingError::runtime("stream yields no batches"))
}

/// Splits `(batch, views, ...)` into exactly `num_transforms` tensors of shape `(batch, ...)`.
pub fn split_views(images: &Tensor, num_transforms: usize) -> Result<Vec<Tensor>> {
    if images.rank() < 3 {
        return Err(TrainingError::runtime(format!(
            "multi-view batch expected (batch, views, ...), got {:?}",
            images.dims()
        )));
    }
    let views = images.dim(1)?;
    if views != num_transforms {
        return Err(TrainingError::runtime(format!(
            "expected {num_transforms} views per sample, got {views}"
        )));
    }
    (0..views)
        .map(|view| Ok(images.narrow(1, view, 1)?.squeeze(1)?))
        .collect()
}

/// Per-class positive frequency normalised to sum to one (uniform when no positives exist).
pub fn class_balances<'a>(
    rows: impl IntoIterator<Item = &'a [f32]>,
    num_classes: usize,
) -> Vec<f32> {
    let mut counts = vec![0f64; num_classes];
    for row in rows {
        for (count, &value) in counts.iter_mut().zip(row) {
            if value >= 0.5 {
                *count += 1.0;
            }
        }
    }
    let total: f64 = counts.iter().sum();
    if total == 0.0 {
        return vec![1.0 / num_classes.max(1) as f32; num_classes];
    }
    counts.into_iter().map(|c| (c / total) as f32).collect()
}

/// In-memory stream over prepared tensors, batched in order with the last partial batch dropped.
#[derive(Debug, Clone)]
pub struct TensorStream {
    images: Tensor,
    labels: Option<Tensor>,
    batch_size: usize,
    cursor: usize,
    balances: Option<Vec<f32>>,
    num_classes: usize,
}

impl TensorStream {
    pub fn new(images: Tensor, labels: Option<Tensor>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        let samples = images.dim(0)?;
        let (balances, num_classes) = match &labels {
            Some(labels) => {
                let (rows, classes) = labels.dims2()?;
                if rows != samples {
                    return Err(TrainingError::initialization(format!(
                        "{samples} images but {rows} label rows"
                    )));
                }
                let label_rows = labels.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                let balances = class_balances(label_rows.iter().map(Vec::as_slice), classes);
                (Some(balances), classes)
            }
            None => (None, 0),
        };
        Ok(Self {
            images,
            labels,
            batch_size,
            cursor: 0,
            balances,
            num_classes,
        })
    }

    fn samples(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }
}

impl BatchStream for TensorStream {
    fn len(&self) -> usize {
        self.samples() / self.batch_size
    }

    fn begin_epoch(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor + self.batch_size > self.samples() {
            return Ok(None);
        }
        let images = self.images.narrow(0, self.cursor, self.batch_size)?;
        let labels = match &self.labels {
            Some(labels) => Some(labels.narrow(0, self.cursor, self.batch_size)?),
            None => None,
        };
        self.cursor += self.batch_size;
        Ok(Some(Batch { images, labels }))
    }

    fn balances(&self) -> Option<&[f32]> {
        self.balances.as_deref()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn split_views_keeps_batch_axis_for_single_sample() -> Result<()> {
        let images = Tensor::zeros((1, 2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let views = split_views(&images, 2)?;
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].dims(), &[1, 3, 4, 4]);
        assert!(split_views(&images, 3).is_err());
        Ok(())
    }

    #[test]
    fn tensor_stream_drops_last_partial_batch() -> Result<()> {
        let images = Tensor::zeros((10, 3), DType::F32, &Device::Cpu)?;
        let mut stream = TensorStream::new(images, None, 4)?;
        assert_eq!(stream.len(), 2);
        stream.begin_epoch()?;
        assert!(stream.next_batch()?.is_some());
        assert!(stream.next_batch()?.is_some());
        assert!(stream.next_batch()?.is_none());
        assert!(stream.balances().is_none());
        Ok(())
    }

    #[test]
    fn cycling_restarts_exhausted_stream() -> Result<()> {
        let images = Tensor::arange(0f32, 4.0, &Device::Cpu)?.reshape((4, 1))?;
        let mut stream = TensorStream::new(images, None, 2)?;
        stream.begin_epoch()?;
        let seen: Vec<f32> = (0..3)
            .map(|_| -> Result<f32> {
                let batch = next_cycled(&mut stream)?;
                Ok(batch.images.flatten_all()?.to_vec1::<f32>()?[0])
            })
            .collect::<Result<_>>()?;
        assert_eq!(seen, vec![0.0, 2.0, 0.0]);
        Ok(())
    }

    #[test]
    fn balances_follow_positive_frequency() {
        let rows = [vec![1f32, 0.0, 1.0], vec![1.0, 0.0, 0.0]];
        let balances = class_balances(rows.iter().map(Vec::as_slice), 3);
        approx::assert_abs_diff_eq!(balances[0], 2.0 / 3.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(balances[1], 0.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(balances.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }
}
