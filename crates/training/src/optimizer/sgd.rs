use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;

use super::{
    apply_groups, checked_groups, flatten_to_vec, grad_f32, group_states, tensor_from_buffer,
    weight_f32, write_weight, Gradients, Optimizer, OptimizerState, ParamGroup, ParameterState,
};
use crate::TrainingError;

const MOMENTUM_BUFFER: &str = "momentum_buffer";

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub momentum: f64,
    pub dampening: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            dampening: 0.0,
            nesterov: false,
        }
    }
}

/// Stochastic gradient descent with heavy-ball or Nesterov momentum and
/// coupled L2 weight decay.
///
/// The momentum buffer is seeded with the first gradient it sees, so the
/// first update equals a plain SGD step.
#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    groups: Vec<ParamGroup>,
    momentum: HashMap<String, Tensor>,
    step: usize,
}

impl Sgd {
    pub fn new(groups: Vec<ParamGroup>, config: SgdConfig) -> Result<Self, TrainingError> {
        if groups.iter().all(|group| group.params.is_empty()) {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(TrainingError::initialization(
                "nesterov momentum requires a positive momentum and zero dampening",
            ));
        }
        Ok(Self {
            config,
            groups,
            momentum: HashMap::new(),
            step: 0,
        })
    }

    pub fn config(&self) -> SgdConfig {
        self.config
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> String {
        "sgd".to_string()
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, grads: &mut Gradients) -> Result<(), TrainingError> {
        let SgdConfig {
            momentum,
            dampening,
            nesterov,
        } = self.config;
        for group in &self.groups {
            for param in &group.params {
                let Some(grad) = grad_f32(grads, &param.var)? else {
                    continue;
                };
                let weight = weight_f32(&param.var)?;
                let mut d_p = if group.weight_decay != 0.0 {
                    (grad + weight.affine(group.weight_decay, 0.0)?)?
                } else {
                    grad
                };
                if momentum != 0.0 {
                    let buf = match self.momentum.remove(&param.name) {
                        Some(prev) => (prev.affine(momentum, 0.0)?
                            + d_p.affine(1.0 - dampening, 0.0)?)?,
                        None => d_p.clone(),
                    };
                    d_p = if nesterov {
                        (d_p + buf.affine(momentum, 0.0)?)?
                    } else {
                        buf.clone()
                    };
                    self.momentum.insert(param.name.clone(), buf);
                }
                let next = (weight - d_p.affine(group.lr, 0.0)?)?;
                write_weight(&param.var, &next)?;
            }
        }
        self.step += 1;
        Ok(())
    }

    fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::new();
        for group in &self.groups {
            for param in &group.params {
                let mut buffers = BTreeMap::new();
                if let Some(buf) = self.momentum.get(&param.name) {
                    buffers.insert(
                        MOMENTUM_BUFFER.to_string(),
                        flatten_to_vec(buf, param.var.elem_count())?,
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
        let mut momentum = HashMap::new();
        for group in &self.groups {
            for param in &group.params {
                let saved = by_name.remove(&param.name).ok_or_else(|| {
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
                if let Some(values) = saved.buffers.get(MOMENTUM_BUFFER) {
                    let tensor = tensor_from_buffer(&param.name, values.clone(), &param.var)?;
                    momentum.insert(param.name.clone(), tensor);
                }
            }
        }
        if !by_name.is_empty() {
            return Err(TrainingError::checkpoint(
                "optimizer state has extra parameters not present in the model",
            ));
        }
        apply_groups(&mut self.groups, &saved_groups);
        self.momentum = momentum;
        self.step = state.step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::NamedVar;
    use candle_core::{Device, Var};

    fn single_group(var: &Var, lr: f64, weight_decay: f64) -> Vec<ParamGroup> {
        vec![ParamGroup {
            params: vec![NamedVar {
                name: "w".into(),
                var: var.clone(),
            }],
            lr,
            weight_decay,
        }]
    }

    fn grads_for(var: &Var, grad: &[f32]) -> Result<Gradients, TrainingError> {
        let loss = (var.as_tensor() * Tensor::new(grad, &Device::Cpu)?)?.sum_all()?;
        Ok(Gradients::from_store(&loss.backward()?, &[var.clone()]))
    }

    #[test]
    fn first_step_is_plain_sgd_then_momentum_accumulates() -> Result<(), TrainingError> {
        let var = Var::new(&[1f32, 1.0], &Device::Cpu)?;
        let mut opt = Sgd::new(single_group(&var, 0.1, 0.0), SgdConfig::default())?;

        let mut grads = grads_for(&var, &[1.0, 2.0])?;
        opt.step(&mut grads)?;
        let after_first = var.as_tensor().to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(after_first[0], 0.9, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(after_first[1], 0.8, epsilon = 1e-6);

        let mut grads = grads_for(&var, &[1.0, 2.0])?;
        opt.step(&mut grads)?;
        // buf = 0.9 * g + g = 1.9 g
        let after_second = var.as_tensor().to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(after_second[0], 0.9 - 0.19, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(after_second[1], 0.8 - 0.38, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn nesterov_looks_ahead() -> Result<(), TrainingError> {
        let var = Var::new(&[0f32], &Device::Cpu)?;
        let config = SgdConfig {
            nesterov: true,
            ..SgdConfig::default()
        };
        let mut opt = Sgd::new(single_group(&var, 1.0, 0.0), config)?;
        let mut grads = grads_for(&var, &[1.0])?;
        opt.step(&mut grads)?;
        // d_p = g + 0.9 * buf with buf = g
        approx::assert_abs_diff_eq!(var.as_tensor().to_vec1::<f32>()?[0], -1.9, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn coupled_weight_decay_adds_to_gradient() -> Result<(), TrainingError> {
        let var = Var::new(&[2f32], &Device::Cpu)?;
        let config = SgdConfig {
            momentum: 0.0,
            ..SgdConfig::default()
        };
        let mut opt = Sgd::new(single_group(&var, 0.5, 0.1), config)?;
        let mut grads = grads_for(&var, &[1.0])?;
        opt.step(&mut grads)?;
        // 2 - 0.5 * (1 + 0.1 * 2)
        approx::assert_abs_diff_eq!(var.as_tensor().to_vec1::<f32>()?[0], 1.4, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn state_round_trip_restores_momentum() -> Result<(), TrainingError> {
        let var = Var::new(&[1f32, -1.0], &Device::Cpu)?;
        let mut opt = Sgd::new(single_group(&var, 0.1, 0.0), SgdConfig::default())?;
        let mut grads = grads_for(&var, &[0.5, 0.5])?;
        opt.step(&mut grads)?;
        let state = opt.state()?;

        let other = Var::new(&[1f32, -1.0], &Device::Cpu)?;
        let mut restored = Sgd::new(single_group(&other, 0.0, 0.0), SgdConfig::default())?;
        restored.load_state(state.clone())?;

        assert_eq!(restored.state()?, state);
        assert_eq!(restored.learning_rate(), 0.1);
        Ok(())
    }

    #[test]
    fn skips_parameters_without_gradient() -> Result<(), TrainingError> {
        let var = Var::new(&[3f32], &Device::Cpu)?;
        let unrelated = Var::new(&[1f32], &Device::Cpu)?;
        let mut opt = Sgd::new(single_group(&var, 0.1, 0.0), SgdConfig::default())?;
        let store = unrelated.as_tensor().sum_all()?.backward()?;
        let mut grads = Gradients::from_store(&store, &[var.clone()]);
        assert!(grads.is_empty());
        opt.step(&mut grads)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![3.0]);
        assert!(opt.state()?.parameters[0].buffers.is_empty());
        Ok(())
    }

    #[test]
    fn rejected_state_leaves_optimizer_untouched() -> Result<(), TrainingError> {
        let var = Var::new(&[1f32, -1.0], &Device::Cpu)?;
        let mut trained = Sgd::new(single_group(&var, 0.3, 0.0), SgdConfig::default())?;
        trained.step(&mut grads_for(&var, &[1.0, 1.0])?)?;
        let mut state = trained.state()?;
        state.parameters[0].shape = vec![3];

        let other = Var::new(&[1f32, -1.0], &Device::Cpu)?;
        let mut fresh = Sgd::new(single_group(&other, 0.05, 0.0), SgdConfig::default())?;
        let before = fresh.state()?;
        assert!(fresh.load_state(state).is_err());
        assert_eq!(fresh.state()?, before);
        assert_eq!(fresh.learning_rate(), 0.05);
        Ok(())
    }
}
