use std::collections::{BTreeMap, HashMap};

pub mod adam;
pub mod lars;
pub mod scaler;
pub mod sgd;

pub use adam::{Adam, AdamConfig};
pub use lars::Lars;
pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};
pub use sgd::{Sgd, SgdConfig};

use candle_core::{backprop::GradStore, DType, Tensor, TensorId, Var};
use serde::{Deserialize, Serialize};
use simclr_model::Param;

use crate::TrainingError;

pub(crate) const EPS: f64 = 1e-12;

/// Parameter handle tracked by an optimizer.
#[derive(Debug, Clone)]
pub struct NamedVar {
    pub name: String,
    pub var: Var,
}

/// Parameters sharing a learning rate and weight decay.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<NamedVar>,
    pub lr: f64,
    pub weight_decay: f64,
}

/// Splits trainable parameters into a decayed group and a non-decayed group.
///
/// Biases and every 1-D tensor are excluded from weight decay. Empty groups are dropped.
pub fn add_weight_decay<'a>(
    params: impl IntoIterator<Item = &'a Param>,
    lr: f64,
    weight_decay: f64,
) -> Vec<ParamGroup> {
    let mut no_decay = Vec::new();
    let mut decay = Vec::new();
    for param in params {
        if !param.is_trainable() {
            continue;
        }
        let named = NamedVar {
            name: param.name().to_string(),
            var: param.var().clone(),
        };
        if param.var().rank() <= 1 || param.name().ends_with(".bias") {
            no_decay.push(named);
        } else {
            decay.push(named);
        }
    }
    [(no_decay, 0.0), (decay, weight_decay)]
        .into_iter()
        .filter(|(params, _)| !params.is_empty())
        .map(|(params, weight_decay)| ParamGroup {
            params,
            lr,
            weight_decay,
        })
        .collect()
}

/// Gradients of tracked parameters, cut loose from the backward store that produced them.
///
/// A `GradStore` also holds gradients for every intermediate tensor of the graph;
/// only the entries of the listed variables survive here.
#[derive(Debug, Clone, Default)]
pub struct Gradients {
    grads: HashMap<TensorId, Tensor>,
}

impl Gradients {
    pub fn from_store(store: &GradStore, vars: &[Var]) -> Self {
        let grads = vars
            .iter()
            .filter_map(|var| store.get(var.as_tensor()).map(|grad| (var.id(), grad.clone())))
            .collect();
        Self { grads }
    }

    /// Adds the tracked gradients of one more backward pass into the running sums.
    pub fn accumulate(&mut self, store: &GradStore, vars: &[Var]) -> Result<(), TrainingError> {
        for var in vars {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let summed = match self.grads.remove(&var.id()) {
                Some(existing) => existing.add(grad)?,
                None => grad.clone(),
            };
            self.grads.insert(var.id(), summed);
        }
        Ok(())
    }

    pub fn get(&self, var: &Var) -> Option<&Tensor> {
        self.grads.get(&var.id())
    }

    pub fn insert(&mut self, var: &Var, grad: Tensor) -> Option<Tensor> {
        self.grads.insert(var.id(), grad)
    }

    pub fn remove(&mut self, var: &Var) -> Option<Tensor> {
        self.grads.remove(&var.id())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// Update rule bound to a fixed set of parameter groups.
pub trait Optimizer: Send {
    /// Short identifier stored in checkpoints (`sgd`, `adam`, `lars-sgd`).
    fn kind(&self) -> String;

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Applies one update. Gradients of tracked parameters may be rewritten in place.
    fn step(&mut self, grads: &mut Gradients) -> Result<(), TrainingError>;

    fn state(&self) -> Result<OptimizerState, TrainingError>;

    fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError>;

    fn learning_rate(&self) -> f64 {
        self.param_groups().first().map_or(0.0, |group| group.lr)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        for group in self.param_groups_mut() {
            group.lr = lr;
        }
    }

    /// Tracked variables across all groups.
    fn vars(&self) -> Vec<Var> {
        self.param_groups()
            .iter()
            .flat_map(|group| group.params.iter().map(|param| param.var.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: String,
    pub step: usize,
    pub groups: Vec<GroupState>,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub lr: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    /// Named state buffers, e.g. `momentum_buffer` or `exp_avg`.
    pub buffers: BTreeMap<String, Vec<f32>>,
}

pub(crate) fn group_states(groups: &[ParamGroup]) -> Vec<GroupState> {
    groups
        .iter()
        .map(|group| GroupState {
            lr: group.lr,
            weight_decay: group.weight_decay,
        })
        .collect()
}

/// Checks kind and group layout; returns the group hyperparameters to apply
/// once the rest of the state has been accepted.
pub(crate) fn checked_groups(
    expected_kind: &str,
    groups: &[ParamGroup],
    state: &OptimizerState,
) -> Result<Vec<GroupState>, TrainingError> {
    if state.kind != expected_kind {
        return Err(TrainingError::checkpoint(format!(
            "optimizer kind mismatch: checkpoint has '{}', engine uses '{}'",
            state.kind, expected_kind
        )));
    }
    if state.groups.len() != groups.len() {
        return Err(TrainingError::checkpoint(format!(
            "optimizer group count mismatch: checkpoint has {}, engine uses {}",
            state.groups.len(),
            groups.len()
        )));
    }
    Ok(state.groups.clone())
}

pub(crate) fn apply_groups(groups: &mut [ParamGroup], saved: &[GroupState]) {
    for (group, saved) in groups.iter_mut().zip(saved) {
        group.lr = saved.lr;
        group.weight_decay = saved.weight_decay;
    }
}

/// Gradient for `var` as F32, if one was produced.
pub(crate) fn grad_f32(grads: &Gradients, var: &Var) -> Result<Option<Tensor>, TrainingError> {
    match grads.get(var) {
        Some(grad) => Ok(Some(grad.to_dtype(DType::F32)?)),
        None => Ok(None),
    }
}

/// Current value of `var` as a detached F32 tensor.
pub(crate) fn weight_f32(var: &Var) -> Result<Tensor, TrainingError> {
    Ok(var.as_tensor().detach().to_dtype(DType::F32)?)
}

pub(crate) fn write_weight(var: &Var, value: &Tensor) -> Result<(), TrainingError> {
    var.set(&value.to_dtype(var.dtype())?)?;
    Ok(())
}

pub(crate) fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok((value as f64).sqrt())
}

pub(crate) fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during serialization",
        ));
    }
    Ok(flat)
}

pub(crate) fn tensor_from_buffer(
    name: &str,
    values: Vec<f32>,
    like: &Var,
) -> Result<Tensor, TrainingError> {
    let expected = like.elem_count();
    if values.len() != expected {
        return Err(TrainingError::checkpoint(format!(
            "optimizer state size mismatch for '{}' ({} != {})",
            name,
            values.len(),
            expected
        )));
    }
    Ok(Tensor::from_vec(values, expected, like.device())?.reshape(like.dims())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn biases_and_vectors_skip_weight_decay() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let weight = Param::new("fc.weight", &Tensor::ones((2, 3), DType::F32, &device)?)?;
        let bias = Param::new("fc.bias", &Tensor::zeros(2, DType::F32, &device)?)?;
        let mut frozen = Param::new("enc.weight", &Tensor::ones((2, 2), DType::F32, &device)?)?;
        frozen.set_trainable(false);

        let groups = add_weight_decay([&weight, &bias, &frozen], 0.1, 2e-5);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].weight_decay, 0.0);
        assert_eq!(groups[0].params[0].name, "fc.bias");
        assert_eq!(groups[1].weight_decay, 2e-5);
        assert_eq!(groups[1].params.len(), 1);
        assert_eq!(groups[1].params[0].name, "fc.weight");
        Ok(())
    }

    #[test]
    fn gradients_keep_only_tracked_variables() -> Result<(), TrainingError> {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, 2.0], &device)?;
        let frozen = Var::new(&[3f32], &device)?;
        let hidden = (w.as_tensor() * 2.0)?;
        let loss = ((hidden * 3.0)?.sum_all()? + frozen.as_tensor().sum_all()?)?;
        let store = loss.backward()?;
        assert!(store.get_ids().count() > 2);

        let mut grads = Gradients::from_store(&store, &[w.clone()]);
        assert_eq!(grads.len(), 1);
        assert!(grads.get(&frozen).is_none());

        grads.accumulate(&store, &[w.clone()])?;
        drop(store);
        let summed = grads.get(&w).map(|grad| grad.to_vec1::<f32>()).transpose()?;
        assert_eq!(summed, Some(vec![12.0, 12.0]));
        Ok(())
    }
}
