use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;

use crate::{
    layers::Dense,
    param::{Param, Parameterized},
};

/// Two-layer MLP mapping encoder features to the contrastive embedding space.
#[derive(Debug, Clone)]
pub struct ProjectionHead {
    fc1: Dense,
    fc2: Dense,
}

impl ProjectionHead {
    pub fn new(
        prefix: &str,
        in_dim: usize,
        hidden_dim: usize,
        out_dim: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            fc1: Dense::new(&format!("{prefix}.fc1"), in_dim, hidden_dim, true, rng, device)?,
            fc2: Dense::new(&format!("{prefix}.fc2"), hidden_dim, out_dim, true, rng, device)?,
        })
    }

    pub fn out_dim(&self) -> usize {
        self.fc2.out_dim()
    }

    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(features)?.relu()?;
        self.fc2.forward(&hidden)
    }
}

impl Parameterized for ProjectionHead {
    fn parameters(&self) -> Vec<&Param> {
        let mut params = self.fc1.parameters();
        params.extend(self.fc2.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.fc1.parameters_mut();
        params.extend(self.fc2.parameters_mut());
        params
    }
}

/// Linear classification head attached during downstream evaluation.
pub fn classification_head(
    in_dim: usize,
    num_classes: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Dense> {
    Dense::new("head", in_dim, num_classes, true, rng, device)
}
