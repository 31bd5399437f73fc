use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;

use crate::{
    layers::Conv2d,
    param::{Param, Parameterized},
};

/// Basic residual block: two 3x3 convolutions plus a 1x1 projection shortcut
/// whenever the stride or width changes.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    shortcut: Option<Conv2d>,
}

impl ResidualBlock {
    pub fn new(
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let conv1 = Conv2d::new(
            &format!("{prefix}.conv1"),
            in_channels,
            out_channels,
            3,
            stride,
            1,
            true,
            rng,
            device,
        )?;
        let conv2 = Conv2d::new(
            &format!("{prefix}.conv2"),
            out_channels,
            out_channels,
            3,
            1,
            1,
            true,
            rng,
            device,
        )?;
        let shortcut = if stride != 1 || in_channels != out_channels {
            Some(Conv2d::new(
                &format!("{prefix}.shortcut"),
                in_channels,
                out_channels,
                1,
                stride,
                0,
                false,
                rng,
                device,
            )?)
        } else {
            None
        };
        Ok(Self {
            conv1,
            conv2,
            shortcut,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let hidden = self.conv1.forward(input)?.relu()?;
        let hidden = self.conv2.forward(&hidden)?;
        let residual = match &self.shortcut {
            Some(proj) => proj.forward(input)?,
            None => input.clone(),
        };
        (hidden + residual)?.relu()
    }
}

impl Parameterized for ResidualBlock {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.conv1.parameters();
        params.extend(self.conv2.parameters());
        if let Some(proj) = &self.shortcut {
            params.extend(proj.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.conv1.parameters_mut();
        params.extend(self.conv2.parameters_mut());
        if let Some(proj) = &mut self.shortcut {
            params.extend(proj.parameters_mut());
        }
        params
    }
}
