//! Dense and convolutional layers built on [`Param`].
//!
//! Weights are stored in F32 and cast to the activation dtype on every call,
//! which lets the same layer run under F32, F16 or BF16 compute. Initialisation
//! follows the Kaiming-uniform recipe with `a = sqrt(5)` for weights and
//! `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for biases.

use candle_core::{Device, Error, Result, Tensor};
use rand::rngs::StdRng;

use crate::param::{Param, Parameterized};

fn kaiming_bound(fan_in: usize) -> f64 {
    // gain = sqrt(2 / (1 + a^2)) with a = sqrt(5), bound = sqrt(3) * gain / sqrt(fan_in)
    let gain = (2.0f64 / 6.0).sqrt();
    3.0f64.sqrt() * gain / (fan_in.max(1) as f64).sqrt()
}

fn bias_bound(fan_in: usize) -> f64 {
    1.0 / (fan_in.max(1) as f64).sqrt()
}

/// Fully connected layer mapping `(batch, in_dim)` to `(batch, out_dim)`.
#[derive(Debug, Clone)]
pub struct Dense {
    weight: Param,
    bias: Option<Param>,
    in_dim: usize,
    out_dim: usize,
}

impl Dense {
    /// Creates a freshly initialised layer whose parameters are named `{prefix}.weight` / `{prefix}.bias`.
    pub fn new(
        prefix: &str,
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::Msg(format!(
                "{prefix}: dense dimensions must be positive (got {in_dim} -> {out_dim})"
            )));
        }
        let weight = Param::uniform(
            format!("{prefix}.weight"),
            &[out_dim, in_dim],
            kaiming_bound(in_dim),
            rng,
            device,
        )?;
        let bias = if bias {
            Some(Param::uniform(
                format!("{prefix}.bias"),
                &[out_dim],
                bias_bound(in_dim),
                rng,
                device,
            )?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (_, features) = input.dims2()?;
        if features != self.in_dim {
            return Err(Error::Msg(format!(
                "{} expects {} input features, got {features}",
                self.weight.name(),
                self.in_dim
            )));
        }
        let weight = self.weight.value(input.dtype())?;
        let out = input.matmul(&weight.t()?)?;
        match &self.bias {
            Some(bias) => out.broadcast_add(&bias.value(input.dtype())?),
            None => Ok(out),
        }
    }
}

impl Parameterized for Dense {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

/// Square-kernel 2-D convolution over `(batch, channels, h, w)` inputs.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Param,
    bias: Option<Param>,
    stride: usize,
    padding: usize,
    in_channels: usize,
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 || kernel == 0 || stride == 0 {
            return Err(Error::Msg(format!(
                "{prefix}: convolution sizes must be positive"
            )));
        }
        let fan_in = in_channels * kernel * kernel;
        let weight = Param::uniform(
            format!("{prefix}.weight"),
            &[out_channels, in_channels, kernel, kernel],
            kaiming_bound(fan_in),
            rng,
            device,
        )?;
        let bias = if bias {
            Some(Param::uniform(
                format!("{prefix}.bias"),
                &[out_channels],
                bias_bound(fan_in),
                rng,
                device,
            )?)
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
            in_channels,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (_, channels, _, _) = input.dims4()?;
        if channels != self.in_channels {
            return Err(Error::Msg(format!(
                "{} expects {} channels, got {channels}",
                self.weight.name(),
                self.in_channels
            )));
        }
        let weight = self.weight.value(input.dtype())?;
        let out = input.conv2d(&weight, self.padding, self.stride, 1, 1)?;
        match &self.bias {
            Some(bias) => {
                let bias = bias.value(input.dtype())?.reshape((1, (), 1, 1))?;
                out.broadcast_add(&bias)
            }
            None => Ok(out),
        }
    }
}

impl Parameterized for Conv2d {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}
