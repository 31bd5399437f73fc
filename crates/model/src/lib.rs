pub mod block;
pub mod config;
pub mod encoder;
pub mod heads;
pub mod layers;
pub mod model;
pub mod param;

pub use block::ResidualBlock;
pub use config::{EncoderConfig, ModelConfig, INPUT_BANDS, INPUT_SIZE};
pub use encoder::ResidualEncoder;
pub use heads::{classification_head, ProjectionHead};
pub use layers::{Conv2d, Dense};
pub use model::{ClassifierNet, PretrainNet};
pub use param::{Param, Parameterized};
