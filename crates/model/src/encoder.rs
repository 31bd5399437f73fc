//! Residual convolutional backbone.
//!
//! Input is `(batch, in_channels, h, w)`; output is the globally average
//! pooled feature vector `(batch, output_dim)`. The backbone is treated as an
//! opaque differentiable function by the training code, which only relies on
//! [`ResidualEncoder::output_dim`] and the parameter list.

use candle_core::{Device, Error, Result, Tensor};
use rand::rngs::StdRng;

use crate::{
    block::ResidualBlock,
    config::EncoderConfig,
    layers::Conv2d,
    param::{Param, Parameterized},
};

#[derive(Debug, Clone)]
pub struct ResidualEncoder {
    config: EncoderConfig,
    stem: Conv2d,
    stages: Vec<ResidualBlock>,
}

impl ResidualEncoder {
    /// Builds the encoder with parameters named `{prefix}.stem.*`, `{prefix}.stages.{i}.*`.
    pub fn new(
        prefix: &str,
        config: &EncoderConfig,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let stem = Conv2d::new(
            &format!("{prefix}.stem"),
            config.in_channels,
            config.stem_channels,
            3,
            2,
            1,
            true,
            rng,
            device,
        )?;
        let mut stages = Vec::with_capacity(config.stage_channels.len());
        let mut in_channels = config.stem_channels;
        for (idx, &out_channels) in config.stage_channels.iter().enumerate() {
            let stride = if idx == 0 { 1 } else { 2 };
            stages.push(ResidualBlock::new(
                &format!("{prefix}.stages.{idx}"),
                in_channels,
                out_channels,
                stride,
                rng,
                device,
            )?);
            in_channels = out_channels;
        }
        Ok(Self {
            config: config.clone(),
            stem,
            stages,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn output_dim(&self) -> usize {
        self.config.output_dim()
    }

    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        if images.rank() != 4 {
            return Err(Error::Msg(format!(
                "encoder expects (batch, bands, h, w) input, got {:?}",
                images.dims()
            )));
        }
        let mut hidden = self.stem.forward(images)?.relu()?;
        for stage in &self.stages {
            hidden = stage.forward(&hidden)?;
        }
        hidden.mean(3)?.mean(2)
    }
}

impl Parameterized for ResidualEncoder {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.stem.parameters();
        for stage in &self.stages {
            params.extend(stage.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.stem.parameters_mut();
        for stage in &mut self.stages {
            params.extend(stage.parameters_mut());
        }
        params
    }
}
