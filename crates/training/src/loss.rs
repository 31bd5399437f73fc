use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::TrainingError;

const MASKED_LOGIT: f32 = -1e9;
const NORM_EPS: f64 = 1e-12;

/// Normalized temperature-scaled cross entropy over a batch of positive pairs.
///
/// Both views are L2-normalized and stacked into `2B` rows. Row `i` treats
/// row `i ± B` as its positive and the remaining `2B - 2` rows as negatives;
/// self-similarity is masked out. The loss is averaged over all `2B` rows.
#[derive(Debug, Clone)]
pub struct NtXentLoss {
    temperature: f64,
}

impl NtXentLoss {
    pub fn new(temperature: f64) -> Result<Self, TrainingError> {
        if temperature <= 0.0 {
            return Err(TrainingError::initialization(
                "nt-xent temperature must be greater than zero",
            ));
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn compute(&self, z_i: &Tensor, z_j: &Tensor) -> Result<LossOutput, TrainingError> {
        let (batch, dim) = z_i.dims2()?;
        if z_j.dims() != [batch, dim] {
            return Err(TrainingError::runtime(format!(
                "contrastive views disagree: {:?} vs {:?}",
                z_i.dims(),
                z_j.dims()
            )));
        }
        if batch < 2 {
            return Err(TrainingError::runtime(
                "nt-xent needs at least two pairs per batch",
            ));
        }

        let device = z_i.device();
        let reps = Tensor::cat(
            &[
                l2_normalize(&z_i.to_dtype(DType::F32)?)?,
                l2_normalize(&z_j.to_dtype(DType::F32)?)?,
            ],
            0,
        )?;
        let rows = 2 * batch;
        let similarity = reps
            .matmul(&reps.t()?)?
            .affine(1.0 / self.temperature, 0.0)?;

        let mut mask = vec![0f32; rows * rows];
        for idx in 0..rows {
            mask[idx * rows + idx] = MASKED_LOGIT;
        }
        let mask = Tensor::from_vec(mask, (rows, rows), device)?;
        let logits = (similarity + mask)?;

        let positives: Vec<u32> = (0..rows).map(|idx| ((idx + batch) % rows) as u32).collect();
        let positives = Tensor::from_vec(positives, (rows, 1), device)?;

        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let loss = log_probs.gather(&positives, 1)?.neg()?.mean_all()?;
        let value = loss.to_vec0::<f32>()?;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                loss: value,
                samples: batch,
            },
        })
    }
}

/// Binary cross entropy on raw logits, averaged over every element.
///
/// Uses `max(x, 0) - x * y + ln(1 + exp(-|x|))` so large logits do not overflow.
#[derive(Debug, Clone, Default)]
pub struct BceWithLogitsLoss;

impl BceWithLogitsLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        if logits.dims() != targets.dims() {
            return Err(TrainingError::runtime(format!(
                "logits {:?} and targets {:?} must share a shape",
                logits.dims(),
                targets.dims()
            )));
        }
        let samples = logits.dims().first().copied().unwrap_or(0);
        if logits.elem_count() == 0 {
            return Err(TrainingError::runtime("empty batch passed to bce loss"));
        }

        let x = logits.to_dtype(DType::F32)?;
        let y = targets.to_dtype(DType::F32)?.to_device(x.device())?;
        let softplus = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
        let per_element = ((x.relu()? - (&x * &y)?)? + softplus)?;
        let loss = per_element.mean_all()?;
        let value = loss.to_vec0::<f32>()?;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                loss: value,
                samples,
            },
        })
    }
}

fn l2_normalize(tensor: &Tensor) -> Result<Tensor, TrainingError> {
    let norm = tensor.sqr()?.sum_keepdim(1)?.affine(1.0, NORM_EPS)?.sqrt()?;
    Ok(tensor.broadcast_div(&norm)?)
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    loss: f32,
    samples: usize,
}

impl LossMetrics {
    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn samples(&self) -> usize {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    #[test]
    fn duplicated_orthogonal_views_hit_closed_form() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let batch = 3usize;
        let tau = 0.5;
        let mut one_hot = vec![0f32; batch * batch];
        for idx in 0..batch {
            one_hot[idx * batch + idx] = 1.0;
        }
        let z = Tensor::from_vec(one_hot, (batch, batch), &device)?;

        let out = NtXentLoss::new(tau)?.compute(&z, &z)?;

        let negatives = (2 * batch - 2) as f64;
        let expected = (1.0 + negatives * (-1.0 / tau).exp()).ln();
        assert_abs_diff_eq!(out.metrics.loss() as f64, expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn identical_rows_give_uniform_loss() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let batch = 4usize;
        let z = Tensor::ones((batch, 8), DType::F32, &device)?;

        let out = NtXentLoss::new(0.07)?.compute(&z, &z)?;

        assert_abs_diff_eq!(
            out.metrics.loss() as f64,
            ((2 * batch - 1) as f64).ln(),
            epsilon = 1e-4
        );
        Ok(())
    }

    #[test]
    fn nt_xent_is_scale_invariant_and_differentiable() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let z_i = Tensor::new(&[[1f32, 2.0], [-1.0, 0.5]], &device)?;
        let z_j = Tensor::new(&[[0.5f32, 1.5], [-2.0, 0.1]], &device)?;
        let loss = NtXentLoss::new(0.2)?;

        let base = loss.compute(&z_i, &z_j)?;
        let scaled = loss.compute(&z_i.affine(10.0, 0.0)?, &z_j)?;
        assert_abs_diff_eq!(base.metrics.loss(), scaled.metrics.loss(), epsilon = 1e-4);

        let var = candle_core::Var::from_tensor(&z_i)?;
        let grads = loss.compute(var.as_tensor(), &z_j)?.loss.backward()?;
        assert!(grads.get(var.as_tensor()).is_some());
        Ok(())
    }

    #[test]
    fn nt_xent_rejects_single_pair() -> Result<(), TrainingError> {
        let z = Tensor::ones((1, 4), DType::F32, &Device::Cpu)?;
        assert!(NtXentLoss::new(0.1)?.compute(&z, &z).is_err());
        assert!(NtXentLoss::new(0.0).is_err());
        Ok(())
    }

    #[test]
    fn bce_matches_reference_values() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0f32, 2.0], [-3.0, 100.0]], &device)?;
        let targets = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;

        let out = BceWithLogitsLoss::new().compute(&logits, &targets)?;

        let reference = [
            (2f64).ln(),
            2.0 + (1.0 + (-2f64).exp()).ln(),
            (1.0 + (-3f64).exp()).ln(),
            (1.0 + (-100f64).exp()).ln(),
        ];
        let expected = reference.iter().sum::<f64>() / 4.0;
        assert_abs_diff_eq!(out.metrics.loss() as f64, expected, epsilon = 1e-5);
        assert!(out.metrics.loss().is_finite());
        assert_eq!(out.metrics.samples(), 2);
        Ok(())
    }

    #[test]
    fn bce_rejects_shape_mismatch() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 3), DType::F32, &device)?;
        let targets = Tensor::zeros((2, 2), DType::F32, &device)?;
        assert!(BceWithLogitsLoss::new().compute(&logits, &targets).is_err());
        Ok(())
    }
}
