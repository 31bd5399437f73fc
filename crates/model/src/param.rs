//! Named learnable tensors with trainability gating.
//!
//! Every layer stores its weights as [`Param`]s. A frozen parameter still
//! participates in the forward pass, but it is detached from the autograd
//! graph so `backward()` never produces a gradient for it. Optimizers are
//! built from [`Parameterized::trainable_parameters`] only.

use candle_core::{DType, Result, Tensor, Var};
use rand::{distributions::Uniform, rngs::StdRng, Rng};

/// Learnable tensor identified by a dotted name such as `encoder.stem.weight`.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    var: Var,
    trainable: bool,
}

impl Param {
    /// Wraps `tensor` as a trainable variable.
    pub fn new(name: impl Into<String>, tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            var: Var::from_tensor(tensor)?,
            trainable: true,
        })
    }

    /// Samples `U(-bound, bound)` from `rng` into an F32 variable of `shape`.
    pub fn uniform(
        name: impl Into<String>,
        shape: &[usize],
        bound: f64,
        rng: &mut StdRng,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        let values: Vec<f32> = if bound > 0.0 {
            let dist = Uniform::new_inclusive(-bound as f32, bound as f32);
            (0..numel).map(|_| rng.sample(dist)).collect()
        } else {
            vec![0.0; numel]
        };
        let tensor = Tensor::from_vec(values, shape, device)?;
        Self::new(name, &tensor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    pub fn elem_count(&self) -> usize {
        self.var.elem_count()
    }

    /// Tensor used by the forward pass, cast to `dtype`.
    ///
    /// Frozen parameters are detached so they never receive gradients.
    pub fn value(&self, dtype: DType) -> Result<Tensor> {
        let tensor = if self.trainable {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        };
        tensor.to_dtype(dtype)
    }

    /// Overwrites the stored value, keeping the variable's dtype.
    pub fn assign(&self, value: &Tensor) -> Result<()> {
        if value.dims() != self.var.dims() {
            return Err(candle_core::Error::Msg(format!(
                "parameter {} expects shape {:?} but got {:?}",
                self.name,
                self.var.dims(),
                value.dims()
            )));
        }
        self.var.set(&value.to_dtype(self.var.dtype())?)
    }
}

/// Anything that owns a set of [`Param`]s.
pub trait Parameterized {
    /// Every parameter in a stable order.
    fn parameters(&self) -> Vec<&Param>;

    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    /// Parameters that currently receive gradients.
    fn trainable_parameters(&self) -> Vec<&Param> {
        self.parameters()
            .into_iter()
            .filter(|param| param.is_trainable())
            .collect()
    }

    /// Number of trainable tensors (not elements).
    fn trainable_count(&self) -> usize {
        self.trainable_parameters().len()
    }

    fn set_trainable(&mut self, trainable: bool) {
        for param in self.parameters_mut() {
            param.set_trainable(trainable);
        }
    }

    /// `(name, var)` pairs as used by checkpoints.
    fn named_parameters(&self) -> Vec<(String, Var)> {
        self.parameters()
            .into_iter()
            .map(|param| (param.name().to_string(), param.var().clone()))
            .collect()
    }

    /// Total number of scalar weights.
    fn num_elements(&self) -> usize {
        self.parameters().iter().map(|param| param.elem_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    #[test]
    fn frozen_parameter_receives_no_gradient() -> Result<()> {
        let device = Device::Cpu;
        let mut frozen = Param::new("a", &Tensor::new(&[1f32, 2.0], &device)?)?;
        let live = Param::new("b", &Tensor::new(&[3f32, 4.0], &device)?)?;
        frozen.set_trainable(false);

        let out = (frozen.value(DType::F32)? * live.value(DType::F32)?)?.sum_all()?;
        let grads = out.backward()?;

        assert!(grads.get(frozen.var().as_tensor()).is_none());
        let grad = grads
            .get(live.var().as_tensor())
            .map(|g| g.to_vec1::<f32>())
            .transpose()?;
        assert_eq!(grad, Some(vec![1.0, 2.0]));
        Ok(())
    }

    #[test]
    fn uniform_init_is_seeded_and_bounded() -> Result<()> {
        let device = Device::Cpu;
        let a = Param::uniform("w", &[4, 3], 0.5, &mut StdRng::seed_from_u64(7), &device)?;
        let b = Param::uniform("w", &[4, 3], 0.5, &mut StdRng::seed_from_u64(7), &device)?;
        let av = a.var().as_tensor().flatten_all()?.to_vec1::<f32>()?;
        let bv = b.var().as_tensor().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(av, bv);
        assert!(av.iter().all(|v| v.abs() <= 0.5));
        Ok(())
    }

    #[test]
    fn assign_rejects_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let param = Param::new("w", &Tensor::zeros((2, 2), DType::F32, &device)?)?;
        assert!(param.assign(&Tensor::zeros(3, DType::F32, &device)?).is_err());
        param.assign(&Tensor::ones((2, 2), DType::F32, &device)?)?;
        assert_eq!(param.var().as_tensor().sum_all()?.to_scalar::<f32>()?, 4.0);
        Ok(())
    }
}
