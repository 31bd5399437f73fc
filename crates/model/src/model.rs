use candle_core::{Device, Error, Result, Tensor};
use rand::rngs::StdRng;

use crate::{
    config::ModelConfig,
    encoder::ResidualEncoder,
    heads::ProjectionHead,
    layers::Dense,
    param::{Param, Parameterized},
};

/// Backbone plus projection head, used for contrastive pretraining.
#[derive(Debug, Clone)]
pub struct PretrainNet {
    config: ModelConfig,
    encoder: ResidualEncoder,
    projection: ProjectionHead,
}

impl PretrainNet {
    /// Builds the network with parameters named `encoder.*` and `projection.*`.
    pub fn new(config: &ModelConfig, rng: &mut StdRng, device: &Device) -> Result<Self> {
        config.validate()?;
        let encoder = ResidualEncoder::new("encoder", &config.encoder, rng, device)?;
        let projection = ProjectionHead::new(
            "projection",
            encoder.output_dim(),
            config.fc_hid_dim,
            config.fc_out_dim,
            rng,
            device,
        )?;
        Ok(Self {
            config: config.clone(),
            encoder,
            projection,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &ResidualEncoder {
        &self.encoder
    }

    /// Embeds both augmented views in one pass and returns `(z_i, z_j)`.
    pub fn forward_pair(&self, x_i: &Tensor, x_j: &Tensor) -> Result<(Tensor, Tensor)> {
        if x_i.dims() != x_j.dims() {
            return Err(Error::Msg(format!(
                "views must share a shape, got {:?} and {:?}",
                x_i.dims(),
                x_j.dims()
            )));
        }
        let batch = x_i.dim(0)?;
        let stacked = Tensor::cat(&[x_i, x_j], 0)?;
        let features = self.encoder.forward(&stacked)?;
        let embeddings = self.projection.forward(&features)?;
        Ok((embeddings.narrow(0, 0, batch)?, embeddings.narrow(0, batch, batch)?))
    }

    /// Consumes the pretraining network, keeping the backbone and dropping the projection head.
    pub fn into_classifier(self, head: Dense) -> Result<ClassifierNet> {
        if head.in_dim() != self.encoder.output_dim() {
            return Err(Error::Msg(format!(
                "classification head expects {} features but encoder produces {}",
                head.in_dim(),
                self.encoder.output_dim()
            )));
        }
        Ok(ClassifierNet {
            config: self.config,
            encoder: self.encoder,
            head,
        })
    }
}

impl Parameterized for PretrainNet {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.encoder.parameters();
        params.extend(self.projection.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.encoder.parameters_mut();
        params.extend(self.projection.parameters_mut());
        params
    }
}

/// Backbone plus linear head producing multi-label logits.
#[derive(Debug, Clone)]
pub struct ClassifierNet {
    config: ModelConfig,
    encoder: ResidualEncoder,
    head: Dense,
}

impl ClassifierNet {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn encoder(&self) -> &ResidualEncoder {
        &self.encoder
    }

    pub fn encoder_mut(&mut self) -> &mut ResidualEncoder {
        &mut self.encoder
    }

    pub fn head(&self) -> &Dense {
        &self.head
    }

    pub fn num_classes(&self) -> usize {
        self.head.out_dim()
    }

    /// Logits shaped `(batch, num_classes)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let features = self.encoder.forward(images)?;
        self.head.forward(&features)
    }
}

impl Parameterized for ClassifierNet {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.encoder.parameters();
        params.extend(self.head.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.encoder.parameters_mut();
        params.extend(self.head.parameters_mut());
        params
    }
}
