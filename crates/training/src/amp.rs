use candle_core::{DType, Device, Tensor};

use crate::{config::Precision, TrainingError};

/// Forward-pass precision. Master weights stay in F32; inputs (and, inside the
/// layers, weights) are cast to the compute dtype, and losses are evaluated in F32.
///
/// Reduced precision is only used on accelerators; on CPU the context stays in F32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmpContext {
    compute_dtype: DType,
}

impl AmpContext {
    pub fn new(precision: Precision, device: &Device) -> Self {
        let compute_dtype = if device.is_cpu() {
            DType::F32
        } else {
            precision.compute_dtype()
        };
        Self { compute_dtype }
    }

    pub fn full_precision() -> Self {
        Self {
            compute_dtype: DType::F32,
        }
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub fn is_reduced(&self) -> bool {
        self.compute_dtype != DType::F32
    }

    /// Moves a batch tensor to `device` in the compute dtype.
    pub fn prepare(&self, tensor: &Tensor, device: &Device) -> Result<Tensor, TrainingError> {
        Ok(tensor.to_device(device)?.to_dtype(self.compute_dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_stays_in_full_precision() -> Result<(), TrainingError> {
        let ctx = AmpContext::new(Precision::Fp16, &Device::Cpu);
        assert!(!ctx.is_reduced());
        let x = Tensor::ones((2, 2), DType::F64, &Device::Cpu)?;
        assert_eq!(ctx.prepare(&x, &Device::Cpu)?.dtype(), DType::F32);
        Ok(())
    }
}
