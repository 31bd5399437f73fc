use candle_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Number of Sentinel-2 bands stacked into every patch.
pub const INPUT_BANDS: usize = 10;
/// Side length of a BigEarthNet patch at 10 m resolution.
pub const INPUT_SIZE: usize = 120;

/// Architecture of the residual convolutional encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Input channels (spectral bands).
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// Width of the stride-2 stem convolution.
    pub stem_channels: usize,
    /// Output width of each residual stage. Every stage after the first downsamples by 2.
    pub stage_channels: Vec<usize>,
}

fn default_in_channels() -> usize {
    INPUT_BANDS
}

impl EncoderConfig {
    /// Resolves one of the named presets (`resnet-tiny`, `resnet-small`, `resnet18`).
    pub fn preset(name: &str) -> Result<Self> {
        let (stem, stages): (usize, &[usize]) = match name {
            "resnet-tiny" => (8, &[8, 16]),
            "resnet-small" => (32, &[32, 64, 128, 256]),
            "resnet18" => (64, &[64, 128, 256, 512]),
            other => {
                return Err(Error::Msg(format!(
                    "unknown backbone `{other}` (expected resnet-tiny, resnet-small or resnet18)"
                )))
            }
        };
        Ok(Self {
            in_channels: INPUT_BANDS,
            stem_channels: stem,
            stage_channels: stages.to_vec(),
        })
    }

    /// Dimension of the pooled feature vector.
    pub fn output_dim(&self) -> usize {
        self.stage_channels.last().copied().unwrap_or(self.stem_channels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.stem_channels == 0 {
            return Err(Error::Msg("stem_channels must be greater than zero".into()));
        }
        if self.stage_channels.is_empty() {
            return Err(Error::Msg("at least one residual stage is required".into()));
        }
        if self.stage_channels.iter().any(|&c| c == 0) {
            return Err(Error::Msg("stage widths must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Shapes of the networks used during pretraining and downstream evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub encoder: EncoderConfig,
    /// Hidden width of the projection head.
    pub fc_hid_dim: usize,
    /// Output width of the projection head (contrastive embedding size).
    pub fc_out_dim: usize,
}

impl ModelConfig {
    /// Validates dimensions before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        self.encoder.validate()?;
        if self.fc_hid_dim == 0 {
            return Err(Error::Msg("fc_hid_dim must be greater than zero".into()));
        }
        if self.fc_out_dim == 0 {
            return Err(Error::Msg("fc_out_dim must be greater than zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_report_output_dim() -> Result<()> {
        assert_eq!(EncoderConfig::preset("resnet18")?.output_dim(), 512);
        assert_eq!(EncoderConfig::preset("resnet-tiny")?.output_dim(), 16);
        assert!(EncoderConfig::preset("vit").is_err());
        Ok(())
    }

    #[test]
    fn rejects_empty_stages() {
        let config = EncoderConfig {
            in_channels: 10,
            stem_channels: 4,
            stage_channels: Vec::new(),
        };
        assert!(config.validate().is_err());
    }
}
