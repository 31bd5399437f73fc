//! Multi-label classification scores.
//!
//! Predictions and targets are `(batch, num_classes)` multi-hot matrices.
//! [`compute_metrics`] scores a single batch with per-class results combined
//! by class weights; [`MetricsAggregator`] accumulates confusion counts across
//! batches and reports macro averages.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::TrainingError;

pub type MetricMap = BTreeMap<String, f64>;

/// Confusion counts for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassCounts {
    pub tp: f64,
    pub fp: f64,
    pub fn_: f64,
    pub tn: f64,
}

impl ClassCounts {
    fn add(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.tp += 1.0,
            (true, false) => self.fp += 1.0,
            (false, true) => self.fn_ += 1.0,
            (false, false) => self.tn += 1.0,
        }
    }

    fn total(&self) -> f64 {
        self.tp + self.fp + self.fn_ + self.tn
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    pub fn f_beta(&self, beta: f64) -> f64 {
        let p = self.precision();
        let r = self.recall();
        let b2 = beta * beta;
        ratio((1.0 + b2) * p * r, b2 * p + r)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn balanced_accuracy(&self) -> f64 {
        0.5 * (self.recall() + self.specificity())
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Reads a `(batch, classes)` tensor as rows of booleans (`>= 0.5` counts as positive).
pub fn to_multi_hot(tensor: &Tensor) -> Result<Vec<Vec<bool>>, TrainingError> {
    let rows = tensor.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(rows
        .into_iter()
        .map(|row| row.into_iter().map(|v| v >= 0.5).collect())
        .collect())
}

/// Binarizes logits at zero (probability 0.5).
pub fn binarize_logits(logits: &Tensor) -> Result<Tensor, TrainingError> {
    Ok(logits.ge(0f32)?.to_dtype(DType::F32)?)
}

fn count_classes(
    predictions: &[Vec<bool>],
    targets: &[Vec<bool>],
    num_classes: usize,
) -> Result<(Vec<ClassCounts>, usize), TrainingError> {
    if predictions.len() != targets.len() {
        return Err(TrainingError::runtime(format!(
            "prediction rows ({}) and target rows ({}) differ",
            predictions.len(),
            targets.len()
        )));
    }
    let mut counts = vec![ClassCounts::default(); num_classes];
    let mut exact = 0usize;
    for (pred_row, true_row) in predictions.iter().zip(targets) {
        if pred_row.len() != num_classes || true_row.len() != num_classes {
            return Err(TrainingError::runtime(format!(
                "expected {} classes per row, got {} and {}",
                num_classes,
                pred_row.len(),
                true_row.len()
            )));
        }
        for (class, (&p, &t)) in pred_row.iter().zip(true_row).enumerate() {
            counts[class].add(p, t);
        }
        if pred_row == true_row {
            exact += 1;
        }
    }
    Ok((counts, exact))
}

fn summarize(counts: &[ClassCounts], weights: &[f64], exact: usize, rows: usize) -> MetricMap {
    let weighted = |f: &dyn Fn(&ClassCounts) -> f64| -> f64 {
        counts.iter().zip(weights).map(|(c, w)| w * f(c)).sum()
    };
    let mut metrics = MetricMap::new();
    metrics.insert("precision".into(), weighted(&|c| c.precision()));
    metrics.insert("recall".into(), weighted(&|c| c.recall()));
    metrics.insert("f1".into(), weighted(&|c| c.f_beta(1.0)));
    metrics.insert("f2".into(), weighted(&|c| c.f_beta(2.0)));
    metrics.insert("accuracy".into(), weighted(&|c| c.accuracy()));
    metrics.insert("balanced_accuracy".into(), weighted(&|c| c.balanced_accuracy()));
    metrics.insert("subset_accuracy".into(), ratio(exact as f64, rows as f64));
    metrics
}

/// Scores one batch; per-class scores are combined with `weights` (one per class).
pub fn compute_metrics(
    predictions: &Tensor,
    targets: &Tensor,
    weights: &Tensor,
) -> Result<MetricMap, TrainingError> {
    let weights: Vec<f64> = weights
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?
        .into_iter()
        .map(f64::from)
        .collect();
    let predictions = to_multi_hot(predictions)?;
    let targets = to_multi_hot(targets)?;
    let (counts, exact) = count_classes(&predictions, &targets, weights.len())?;
    Ok(summarize(&counts, &weights, exact, predictions.len()))
}

/// Running confusion counts over many batches, reported as unweighted macro averages.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    num_classes: usize,
    batch_size: usize,
    counts: Vec<ClassCounts>,
    exact: usize,
    rows: usize,
}

impl MetricsAggregator {
    pub fn new(num_classes: usize, batch_size: usize) -> Self {
        Self {
            num_classes,
            batch_size,
            counts: vec![ClassCounts::default(); num_classes],
            exact: 0,
            rows: 0,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Expected rows per step.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Rows seen since the last reset.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn step(&mut self, predictions: &Tensor, targets: &Tensor) -> Result<(), TrainingError> {
        let predictions = to_multi_hot(predictions)?;
        let targets = to_multi_hot(targets)?;
        let (counts, exact) = count_classes(&predictions, &targets, self.num_classes)?;
        for (total, batch) in self.counts.iter_mut().zip(counts) {
            total.tp += batch.tp;
            total.fp += batch.fp;
            total.fn_ += batch.fn_;
            total.tn += batch.tn;
        }
        self.exact += exact;
        self.rows += predictions.len();
        Ok(())
    }

    pub fn compute(&self) -> MetricMap {
        let uniform = vec![1.0 / self.num_classes.max(1) as f64; self.num_classes];
        summarize(&self.counts, &uniform, self.exact, self.rows)
    }

    pub fn reset(&mut self) {
        self.counts = vec![ClassCounts::default(); self.num_classes];
        self.exact = 0;
        self.rows = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn tensor(rows: &[[f32; 3]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn perfect_predictions_score_one() -> Result<(), TrainingError> {
        let y = tensor(&[[1.0, 0.0, 1.0], [0.0, 1.0, 0.0]]);
        let weights = Tensor::new(&[0.25f32, 0.25, 0.5], &Device::Cpu)?;
        let metrics = compute_metrics(&y, &y, &weights)?;
        assert_abs_diff_eq!(metrics["precision"], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics["f2"], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(metrics["subset_accuracy"], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(metrics["balanced_accuracy"], 1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn class_weights_pick_the_weighted_class() -> Result<(), TrainingError> {
        // class 0 perfect, class 1 always wrong, class 2 ignored by weights
        let pred = tensor(&[[1.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        let truth = tensor(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        let only_first = Tensor::new(&[1f32, 0.0, 0.0], &Device::Cpu)?;
        let only_second = Tensor::new(&[0f32, 1.0, 0.0], &Device::Cpu)?;

        let good = compute_metrics(&pred, &truth, &only_first)?;
        let bad = compute_metrics(&pred, &truth, &only_second)?;

        assert_abs_diff_eq!(good["f1"], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(good["accuracy"], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bad["f1"], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bad["accuracy"], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(good["subset_accuracy"], 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn f2_weights_recall_over_precision() {
        let counts = ClassCounts {
            tp: 1.0,
            fp: 3.0,
            fn_: 0.0,
            tn: 0.0,
        };
        // p = 0.25, r = 1 -> f2 = 5 * 0.25 / (4 * 0.25 + 1) = 0.625
        assert_abs_diff_eq!(counts.f_beta(2.0), 0.625, epsilon = 1e-12);
        assert_abs_diff_eq!(counts.f_beta(1.0), 0.4, epsilon = 1e-12);
    }

    #[test]
    fn aggregator_accumulates_and_resets() -> Result<(), TrainingError> {
        let mut agg = MetricsAggregator::new(3, 2);
        let truth = tensor(&[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        agg.step(&truth, &truth)?;
        agg.step(&tensor(&[[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]]), &truth)?;
        assert_eq!(agg.rows(), 4);

        let metrics = agg.compute();
        assert_abs_diff_eq!(metrics["subset_accuracy"], 0.5, epsilon = 1e-12);
        // classes 0 and 1: recall 0.5; class 2 has no positives
        assert_abs_diff_eq!(metrics["recall"], 1.0 / 3.0, epsilon = 1e-9);

        agg.reset();
        assert_eq!(agg.rows(), 0);
        assert_abs_diff_eq!(agg.compute()["precision"], 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn binarizes_at_zero_logit() -> Result<(), TrainingError> {
        let logits = Tensor::new(&[[-0.1f32, 0.0, 2.0]], &Device::Cpu)?;
        assert_eq!(binarize_logits(&logits)?.to_vec2::<f32>()?, vec![vec![0.0, 1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn rejects_class_count_mismatch() {
        let y = tensor(&[[1.0, 0.0, 1.0]]);
        let weights = Tensor::new(&[0.5f32, 0.5], &Device::Cpu).unwrap();
        assert!(compute_metrics(&y, &y, &weights).is_err());
    }
}
