use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

/// Dynamic loss-scale policy for half-precision runs.
#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Clean steps needed before the scale grows.
    pub growth_interval: u32,
    pub floor: f32,
    pub ceiling: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            init_scale: 32_768.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            floor: 1.0,
            ceiling: 16_777_216.0,
        }
    }
}

impl LossScaleConfig {
    fn normalized(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.floor <= 0.0 {
            self.floor = 1.0;
        }
        self.ceiling = self.ceiling.max(self.floor);
        self.init_scale = self.init_scale.clamp(self.floor, self.ceiling);
        self
    }
}

/// Serializable snapshot stored next to the optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: u32,
    #[serde(default)]
    pub skipped_steps: u64,
}

#[derive(Debug, Clone)]
struct DynamicScale {
    policy: LossScaleConfig,
    scale: f32,
    stable_steps: u32,
}

/// Loss scaling for half-precision gradients; a pass-through under fp32.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    dynamic: Option<DynamicScale>,
    skipped_steps: u64,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(policy: LossScaleConfig, precision: Precision) -> Self {
        let dynamic = matches!(precision, Precision::Fp16 | Precision::Bf16).then(|| {
            let policy = policy.normalized();
            DynamicScale {
                scale: policy.init_scale,
                stable_steps: 0,
                policy,
            }
        });
        Self {
            dynamic,
            skipped_steps: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.dynamic.as_ref().map_or(1.0, |dynamic| dynamic.scale)
    }

    /// Optimizer steps dropped because of non-finite gradients.
    pub fn skipped_steps(&self) -> u64 {
        self.skipped_steps
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.dynamic {
            Some(dynamic) => Ok(loss.affine(f64::from(dynamic.scale), 0.0)?),
            None => Ok(loss.clone()),
        }
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        match &self.dynamic {
            Some(dynamic) => Ok(grad.affine(1.0 / f64::from(dynamic.scale), 0.0)?),
            None => Ok(grad.clone()),
        }
    }

    /// Records the outcome of one optimizer step: an overflow halves the scale,
    /// `growth_interval` clean steps in a row grow it.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.skipped_steps += 1;
        }
        let Some(dynamic) = self.dynamic.as_mut() else {
            return;
        };
        let policy = &dynamic.policy;
        if found_inf {
            dynamic.scale = (dynamic.scale * policy.backoff_factor).max(policy.floor);
            dynamic.stable_steps = 0;
            return;
        }
        dynamic.stable_steps += 1;
        if dynamic.stable_steps >= policy.growth_interval {
            dynamic.scale = (dynamic.scale * policy.growth_factor).min(policy.ceiling);
            dynamic.stable_steps = 0;
        }
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            enabled: self.is_enabled(),
            loss_scale: self.loss_scale(),
            stable_steps: self.dynamic.as_ref().map_or(0, |dynamic| dynamic.stable_steps),
            skipped_steps: self.skipped_steps,
        }
    }

    /// Restores a snapshot. Returns `false`, keeping the current scale, when the
    /// snapshot was taken under another precision mode.
    pub fn load_state(&mut self, snapshot: &GradientScalerState) -> bool {
        if snapshot.enabled != self.is_enabled() {
            return false;
        }
        if let Some(dynamic) = self.dynamic.as_mut() {
            dynamic.scale = snapshot
                .loss_scale
                .clamp(dynamic.policy.floor, dynamic.policy.ceiling);
            dynamic.stable_steps = snapshot.stable_steps;
        }
        self.skipped_steps = snapshot.skipped_steps;
        true
    }
}

/// True when any element is NaN or infinite.
pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let total = tensor.to_dtype(DType::F32)?.abs()?.sum_all()?.to_scalar::<f32>()?;
    Ok(!total.is_finite())
}
