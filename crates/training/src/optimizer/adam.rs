use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;

use super::{
    apply_groups, checked_groups, flatten_to_vec, grad_f32, group_states, tensor_from_buffer,
    weight_f32, write_weight, Gradients, Optimizer, OptimizerState, ParamGroup, ParameterState, EPS,
};
use crate::TrainingError;

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug)]
struct Moments {
    first: Tensor,
    second: Tensor,
}

/// Bias-corrected Adam with L2 weight decay folded into the gradient.
#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    groups: Vec<ParamGroup>,
    moments: HashMap<String, Moments>,
    step: usize,
}

impl Adam {
    pub fn new(groups: Vec<ParamGroup>, config: AdamConfig) -> Result<Self, TrainingError> {
        if groups.iter().all(|group| group.params.is_empty()) {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if !(0.0..1.0).contains(&config.beta1) || !(0.0..1.0).contains(&config.beta2) {
            return Err(TrainingError::initialization("adam betas must be in [0, 1)"));
        }
        Ok(Self {
            config,
            groups,
            moments: HashMap::new(),
            step: 0,
        })
    }
}

impl Optimizer for Adam {
    fn kind(&self) -> String {
        "adam".to_string()
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, grads: &mut Gradients) -> Result<(), TrainingError> {
        self.step += 1;
        let AdamConfig {
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for group in &self.groups {
            for param in &group.params {
                let Some(grad) = grad_f32(grads, &param.var)? else {
                    continue;
                };
                let weight = weight_f32(&param.var)?;
                let grad = if group.weight_decay != 0.0 {
                    (grad + weight.affine(group.weight_decay, 0.0)?)?
                } else {
                    grad
                };

                let (prev_m, prev_v) = match self.moments.remove(&param.name) {
                    Some(moments) => (moments.first, moments.second),
                    None => (grad.zeros_like()?, grad.zeros_like()?),
                };
                let new_m = (prev_m.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
                let new_v =
                    (prev_v.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;

                let m_hat = new_m.affine(scale_m, 0.0)?;
                let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, epsilon)?;
                let update = m_hat.div(&denom)?.affine(group.lr, 0.0)?;
                write_weight(&param.var, &(weight - update)?)?;

                self.moments.insert(
                    param.name.clone(),
                    Moments {
                        first: new_m,
                        second: new_v,
                    },
                );
            }
        }
        Ok(())
    }

    fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::new();
        for group in &self.groups {
            for param in &group.params {
                let numel = param.var.elem_count();
                let mut buffers = BTreeMap::new();
                if let Some(moments) = self.moments.get(&param.name) {
                    buffers.insert(EXP_AVG.to_string(), flatten_to_vec(&moments.first, numel)?);
                    buffers.insert(
                        EXP_AVG_SQ.to_string(),
                        flatten_to_vec(&moments.second, numel)?,
                    );
                }
                parameters.push(ParameterState {
                    name: param.name.clone(),
                    shape: param.var.dims().to_vec(),
                    buffers,
                });
            }
        }
        Ok(OptimizerState {
            kind: self.kind(),
            step: self.step,
            groups: group_states(&self.groups),
            parameters,
        })
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let saved_groups = checked_groups(&self.kind(), &self.groups, &state)?;
        let mut by_name: HashMap<String, ParameterState> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();
        let mut moments = HashMap::new();
        for group in &self.groups {
            for param in &group.params {
                let mut saved = by_name.remove(&param.name).ok_or_else(|| {
                    TrainingError::checkpoint(format!(
                        "optimizer state missing parameter '{}'",
                        param.name
                    ))
                })?;
                if saved.shape != param.var.dims() {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state shape mismatch for '{}'",
                        param.name
                    )));
                }
                match (saved.buffers.remove(EXP_AVG), saved.buffers.remove(EXP_AVG_SQ)) {
                    (Some(first), Some(second)) => {
                        moments.insert(
                            param.name.clone(),
                            Moments {
                                first: tensor_from_buffer(&param.name, first, &param.var)?,
                                second: tensor_from_buffer(&param.name, second, &param.var)?,
                            },
                        );
                    }
                    (None, None) => {}
                    _ => {
                        return Err(TrainingError::checkpoint(format!(
                            "optimizer state for '{}' has only one of the two moments",
                            param.name
                        )))
                    }
                }
            }
        }
        if !by_name.is_empty() {
            return Err(TrainingError::checkpoint(
                "optimizer state has extra parameters not present in the model",
            ));
        }
        apply_groups(&mut self.groups, &saved_groups);
        self.moments = moments;
        self.step = state.step;
        Ok(())
    }
}
