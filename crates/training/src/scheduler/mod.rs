use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Learning-rate policy advanced once per completed epoch.
pub trait LRScheduler: Send {
    /// Advances one epoch and returns the new learning rate.
    fn step(&mut self) -> f64;

    /// Rate produced by the most recent step (the base rate before any step).
    fn learning_rate(&self) -> f64;

    fn snapshot(&self) -> SchedulerState;

    fn restore(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

/// Serializable scheduler position stored as `scheduler.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    pub last_epoch: usize,
    pub base_lr: f64,
    pub current_lr: f64,
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    CosineAnnealing {
        base_lr: f64,
        t_max: usize,
        eta_min: f64,
    },
}

impl SchedulerConfig {
    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::CosineAnnealing {
                base_lr,
                t_max,
                eta_min,
            } => Ok(Box::new(CosineAnnealing::new(base_lr, t_max, eta_min)?)),
        }
    }
}

/// Cosine annealing without restarts:
/// `eta_min + (base_lr - eta_min) * (1 + cos(pi * epoch / t_max)) / 2`.
#[derive(Debug, Clone)]
pub struct CosineAnnealing {
    base_lr: f64,
    eta_min: f64,
    t_max: usize,
    last_epoch: usize,
    current_lr: f64,
}

impl CosineAnnealing {
    pub fn new(base_lr: f64, t_max: usize, eta_min: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if t_max == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires t_max greater than zero",
            ));
        }
        if eta_min < 0.0 || eta_min > base_lr {
            return Err(TrainingError::initialization(
                "scheduler eta_min must be in [0, base_lr]",
            ));
        }
        Ok(Self {
            base_lr,
            eta_min,
            t_max,
            last_epoch: 0,
            current_lr: base_lr,
        })
    }

    /// Closed-form cosine; past `t_max` the rate climbs back towards `base_lr` with period `2 * t_max`.
    fn compute_lr(&self, epoch: usize) -> f64 {
        let progress = epoch as f64 / self.t_max as f64;
        let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
        self.eta_min + (self.base_lr - self.eta_min) * cosine
    }
}

impl LRScheduler for CosineAnnealing {
    fn step(&mut self) -> f64 {
        self.last_epoch = self.last_epoch.saturating_add(1);
        self.current_lr = self.compute_lr(self.last_epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: "cosine_annealing".to_string(),
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
            current_lr: self.current_lr,
        }
    }

    fn restore(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.kind != "cosine_annealing" {
            return Err(TrainingError::checkpoint(format!(
                "scheduler kind mismatch: checkpoint has '{}'",
                state.kind
            )));
        }
        self.last_epoch = state.last_epoch;
        self.base_lr = state.base_lr;
        self.current_lr = self.compute_lr(self.last_epoch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaches_eta_min_at_t_max() -> Result<(), TrainingError> {
        let mut sched = CosineAnnealing::new(1.0, 4, 0.0)?;
        assert_eq!(sched.learning_rate(), 1.0);
        let rates: Vec<f64> = (0..4).map(|_| sched.step()).collect();
        approx::assert_abs_diff_eq!(rates[1], 0.5, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(rates[3], 0.0, epsilon = 1e-12);
        assert!(rates[0] < 1.0 && rates[0] > rates[1]);
        Ok(())
    }

    #[test]
    fn keeps_cycling_past_t_max() -> Result<(), TrainingError> {
        let mut sched = CosineAnnealing::new(1.0, 4, 0.1)?;
        let rates: Vec<f64> = (0..8).map(|_| sched.step()).collect();
        approx::assert_abs_diff_eq!(rates[3], 0.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(rates[4], rates[2], epsilon = 1e-12);
        approx::assert_abs_diff_eq!(rates[5], 0.55, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(rates[7], 1.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn snapshot_restores_position() -> Result<(), TrainingError> {
        let mut sched = CosineAnnealing::new(0.3, 800, 0.0)?;
        for _ in 0..10 {
            sched.step();
        }
        let snapshot = sched.snapshot();
        let mut fresh = CosineAnnealing::new(0.3, 800, 0.0)?;
        fresh.restore(&snapshot)?;
        assert_eq!(fresh.learning_rate(), sched.learning_rate());
        assert_eq!(fresh.step(), sched.step());
        Ok(())
    }
}
