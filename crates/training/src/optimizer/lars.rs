//! Layer-wise adaptive rate scaling around a base optimizer.
//!
//! Each parameter's gradient is rescaled by a trust ratio derived from the
//! parameter and gradient norms before the base optimizer runs. Weight decay
//! is folded into the rescaled gradient here, so the base optimizer steps with
//! its group weight decay temporarily set to zero.

use super::{
    grad_f32, tensor_l2_norm, weight_f32, Gradients, Optimizer, OptimizerState, ParamGroup,
};
use crate::TrainingError;

pub const DEFAULT_TRUST_COEF: f64 = 1e-3;
pub const DEFAULT_EPS: f64 = 1e-8;

#[derive(Debug)]
pub struct Lars<O> {
    base: O,
    trust_coef: f64,
    eps: f64,
}

impl<O: Optimizer> Lars<O> {
    pub fn new(base: O, trust_coef: f64) -> Self {
        Self {
            base,
            trust_coef,
            eps: DEFAULT_EPS,
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn base(&self) -> &O {
        &self.base
    }

    /// `trust_coef * ||w|| / (||g|| + wd * ||w|| + eps)`, or 1 when either norm is zero.
    pub fn trust_ratio(&self, weight_norm: f64, grad_norm: f64, weight_decay: f64) -> f64 {
        if weight_norm != 0.0 && grad_norm != 0.0 {
            self.trust_coef * weight_norm / (grad_norm + weight_decay * weight_norm + self.eps)
        } else {
            1.0
        }
    }

    fn rescale_gradients(&self, grads: &mut Gradients) -> Result<(), TrainingError> {
        for group in self.base.param_groups() {
            for param in &group.params {
                let Some(grad) = grad_f32(grads, &param.var)? else {
                    continue;
                };
                let weight = weight_f32(&param.var)?;
                let ratio = self.trust_ratio(
                    tensor_l2_norm(&weight)?,
                    tensor_l2_norm(&grad)?,
                    group.weight_decay,
                );
                let decayed = if group.weight_decay != 0.0 {
                    (grad + weight.affine(group.weight_decay, 0.0)?)?
                } else {
                    grad
                };
                let effective = if ratio != 1.0 {
                    decayed.affine(ratio, 0.0)?
                } else {
                    decayed
                };
                grads.insert(&param.var, effective);
            }
        }
        Ok(())
    }
}

impl<O: Optimizer> Optimizer for Lars<O> {
    fn kind(&self) -> String {
        format!("lars-{}", self.base.kind())
    }

    fn param_groups(&self) -> &[ParamGroup] {
        self.base.param_groups()
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        self.base.param_groups_mut()
    }

    fn step(&mut self, grads: &mut Gradients) -> Result<(), TrainingError> {
        self.rescale_gradients(grads)?;

        let saved: Vec<f64> = self
            .base
            .param_groups_mut()
            .iter_mut()
            .map(|group| std::mem::replace(&mut group.weight_decay, 0.0))
            .collect();
        let outcome = self.base.step(grads);
        for (group, weight_decay) in self.base.param_groups_mut().iter_mut().zip(saved) {
            group.weight_decay = weight_decay;
        }
        outcome
    }

    fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut state = self.base.state()?;
        state.kind = self.kind();
        Ok(state)
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<(), TrainingError> {
        let expected = self.kind();
        if state.kind != expected {
            return Err(TrainingError::checkpoint(format!(
                "optimizer kind mismatch: checkpoint has '{}', engine uses '{}'",
                state.kind, expected
            )));
        }
        state.kind = self.base.kind();
        self.base.load_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{NamedVar, Sgd, SgdConfig};
    use candle_core::{Device, Tensor, Var};

    fn sgd(var: &Var, weight_decay: f64) -> Result<Sgd, TrainingError> {
        Sgd::new(
            vec![ParamGroup {
                params: vec![NamedVar {
                    name: "w".into(),
                    var: var.clone(),
                }],
                lr: 0.5,
                weight_decay,
            }],
            SgdConfig::default(),
        )
    }

    fn linear_grads(var: &Var, coef: &[f32]) -> Result<Gradients, TrainingError> {
        let loss = (var.as_tensor() * Tensor::new(coef, &Device::Cpu)?)?.sum_all()?;
        Ok(Gradients::from_store(&loss.backward()?, &[var.clone()]))
    }

    #[test]
    fn zero_gradient_matches_base_optimizer() -> Result<(), TrainingError> {
        let wrapped_var = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let plain_var = Var::new(&[1f32, 2.0], &Device::Cpu)?;
        let mut wrapped = Lars::new(sgd(&wrapped_var, 0.1)?, DEFAULT_TRUST_COEF);
        let mut plain = sgd(&plain_var, 0.1)?;

        let mut grads = linear_grads(&wrapped_var, &[0.0, 0.0])?;
        wrapped.step(&mut grads)?;
        let mut grads = linear_grads(&plain_var, &[0.0, 0.0])?;
        plain.step(&mut grads)?;

        let a = wrapped_var.as_tensor().to_vec1::<f32>()?;
        let b = plain_var.as_tensor().to_vec1::<f32>()?;
        for (x, y) in a.iter().zip(&b) {
            approx::assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
        // 1 - 0.5 * 0.1 * 1
        approx::assert_abs_diff_eq!(a[0], 0.95, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn applies_trust_ratio_and_restores_weight_decay() -> Result<(), TrainingError> {
        // ||w|| = 5, g = (0, 1), wd = 0
        let var = Var::new(&[3f32, 4.0], &Device::Cpu)?;
        let mut opt = Lars::new(sgd(&var, 0.0)?, 0.1).with_eps(0.0);
        let mut grads = linear_grads(&var, &[0.0, 1.0])?;
        opt.step(&mut grads)?;
        // ratio = 0.1 * 5 / 1 = 0.5, update = lr * 0.5 * g
        let values = var.as_tensor().to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(values[0], 3.0, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(values[1], 4.0 - 0.25, epsilon = 1e-6);

        let decayed = Var::new(&[3f32, 4.0], &Device::Cpu)?;
        let mut opt = Lars::new(sgd(&decayed, 0.2)?, 0.1);
        let mut grads = linear_grads(&decayed, &[0.0, 1.0])?;
        opt.step(&mut grads)?;
        assert_eq!(opt.param_groups()[0].weight_decay, 0.2);
        Ok(())
    }

    #[test]
    fn trust_ratio_is_neutral_for_zero_norms() -> Result<(), TrainingError> {
        let var = Var::new(&[0f32], &Device::Cpu)?;
        let opt = Lars::new(sgd(&var, 0.0)?, DEFAULT_TRUST_COEF);
        assert_eq!(opt.trust_ratio(0.0, 2.0, 0.1), 1.0);
        assert_eq!(opt.trust_ratio(2.0, 0.0, 0.1), 1.0);
        approx::assert_abs_diff_eq!(
            opt.trust_ratio(2.0, 1.0, 0.5),
            DEFAULT_TRUST_COEF * 2.0 / (1.0 + 1.0 + DEFAULT_EPS),
            epsilon = 1e-12
        );
        Ok(())
    }

    #[test]
    fn state_is_tagged_and_forwarded() -> Result<(), TrainingError> {
        let var = Var::new(&[1f32], &Device::Cpu)?;
        let mut opt = Lars::new(sgd(&var, 0.0)?, DEFAULT_TRUST_COEF);
        let mut grads = linear_grads(&var, &[1.0])?;
        opt.step(&mut grads)?;
        let state = opt.state()?;
        assert_eq!(state.kind, "lars-sgd");
        opt.load_state(state.clone())?;
        assert_eq!(opt.state()?, state);
        opt.set_learning_rate(0.01);
        assert_eq!(opt.base().learning_rate(), 0.01);
        Ok(())
    }
}
