pub mod amp;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod engine;
pub mod export;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod orchestrator;
pub mod scheduler;

pub use checkpoint::{CheckpointDescriptor, CheckpointManifest, CheckpointPhase};
pub use config::{LogFormat, Precision, TrainingConfig, TrainingError};
pub use data::{Batch, BatchStream, PatchLoader, TensorStream};
pub use engine::{select_device, DownstreamMode, Engine, EpochOutcome};
pub use export::{export_backbone, load_backbone};
pub use logging::{MemorySink, MetricSink, RunLogger};
pub use loss::{BceWithLogitsLoss, LossMetrics, LossOutput, NtXentLoss};
pub use metrics::{MetricMap, MetricsAggregator};
pub use optimizer::{Lars, Optimizer, OptimizerState};
pub use orchestrator::{learn, RunSummary};
pub use scheduler::{LRScheduler, SchedulerConfig};
