//! End-to-end driver: splits, pretraining, optional probe or fine-tune, checkpoints.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    data::{split_datasets, BatchStream, LoaderOptions, PatchDataset, PatchLoader, SplitPaths},
    engine::{select_device, EpochOutcome, NUM_TRANSFORMS},
    logging::{connect_with_retry, RunLogger, CONNECT_BACKOFF},
    metrics::MetricMap,
    Engine, TrainingConfig, TrainingError,
};

pub const DRYRUN_SUFFIX: &str = "dryrun";
pub const TIMEOUT_SUFFIX: &str = "timeout";
pub const DONE_SUFFIX: &str = "done";
pub const HEAD_DONE_SUFFIX: &str = "with_new_head_done";

/// Directories owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// `checkpoint_dir/{experiment_name}`; checkpoints and split lists live here.
    pub run_dir: PathBuf,
    /// `log_dir/{experiment_name}`.
    pub log_dir: PathBuf,
    pub splits: SplitPaths,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub experiment_name: String,
    pub paths: RunPaths,
    pub pretrain_test: Option<MetricMap>,
    pub downstream_test: Option<MetricMap>,
    /// Last checkpoint directory written.
    pub last_checkpoint: Option<PathBuf>,
    pub interrupted: bool,
}

/// Runs the whole experiment, reporting to the sinks listed in `runtime.log_formats`.
///
/// `shutdown` is polled between batches; when raised, a `timeout` checkpoint is written and
/// the run stops.
pub fn learn(config: TrainingConfig, shutdown: Arc<AtomicBool>) -> Result<RunSummary, TrainingError> {
    let formats = config.runtime.log_formats.clone();
    learn_with(config, shutdown, move |name, dir| RunLogger::open(name, &formats, dir))
}

/// Raises `shutdown` when the process is asked to terminate.
///
/// ctrlc's `termination` feature routes SIGTERM, SIGINT and SIGHUP to the same handler, so
/// all three count as a termination request; nothing else is trapped. One handler per process.
pub fn install_termination_handler(shutdown: Arc<AtomicBool>) -> Result<(), TrainingError> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))
}

/// [`learn`] with a caller-provided dashboard connection, retried every
/// [`CONNECT_BACKOFF`] until it succeeds.
pub fn learn_with<F>(
    config: TrainingConfig,
    shutdown: Arc<AtomicBool>,
    mut connect: F,
) -> Result<RunSummary, TrainingError>
where
    F: FnMut(&str, &Path) -> Result<RunLogger, TrainingError>,
{
    config.validate()?;
    let uuid = config
        .experiment
        .uuid
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let name = config.experiment_name(&uuid);
    let run_dir = config.runtime.checkpoint_dir.join(&name);
    let log_dir = config.runtime.log_dir.join(&name);
    info!(experiment = %name, run_dir = %run_dir.display(), "starting run");

    let splits = split_datasets(&config.data, config.experiment.seed, &run_dir)?;
    let paths = RunPaths {
        run_dir: run_dir.clone(),
        log_dir: log_dir.clone(),
        splits,
    };
    let streams = Streams::build(&config, &paths.splits)?;

    let device = select_device(config.runtime.cuda);
    let mut engine = Engine::new(config.clone(), device, shutdown.clone())?;
    let mut summary = RunSummary {
        experiment_name: name.clone(),
        paths,
        pretrain_test: None,
        downstream_test: None,
        last_checkpoint: None,
        interrupted: false,
    };
    summary.last_checkpoint = Some(engine.save_checkpoint(&run_dir, Some(DRYRUN_SUFFIX))?.directory);

    let logger = connect_with_retry(|| connect(&name, &log_dir), CONNECT_BACKOFF, &shutdown)?;
    info!(sinks = ?logger.sink_names(), "metric sinks ready");
    engine.set_logger(logger);

    let Streams {
        mut pretrain,
        downstream,
    } = streams;

    let save_freq = config.runtime.save_freq.max(1) as u64;
    while (engine.epoch_count() as i64) <= config.runtime.epochs {
        let outcome = engine.train_epoch(&mut pretrain.train, &mut pretrain.val)?;
        if outcome == EpochOutcome::Interrupted {
            return stop_on_timeout(&mut engine, &run_dir, summary);
        }
        if engine.epoch_count() % save_freq == 0 {
            summary.last_checkpoint = Some(engine.save_checkpoint(&run_dir, None)?.directory);
        }
    }

    let pretrain_test = engine.test(&mut pretrain.test)?;
    info!(loss = pretrain_test.get("loss").copied(), "pretraining test done");
    summary.pretrain_test = Some(pretrain_test);
    if shutdown.load(Ordering::SeqCst) {
        return stop_on_timeout(&mut engine, &run_dir, summary);
    }
    if engine.epoch_count() > 0 {
        summary.last_checkpoint = Some(engine.save_checkpoint(&run_dir, Some(DONE_SUFFIX))?.directory);
    }

    if let Some(mut downstream) = downstream {
        engine.renew_head()?;
        while (engine.epoch_count() as i64) <= config.downstream.ftop_epochs {
            let outcome = engine.finetune_or_train_probe(&mut downstream.train, &mut downstream.val)?;
            if outcome == EpochOutcome::Interrupted {
                return stop_on_timeout(&mut engine, &run_dir, summary);
            }
        }
        let aggregate = engine.test_finetuned_or_probed_model(&mut downstream.test)?;
        info!(?aggregate, "downstream test done");
        summary.downstream_test = Some(aggregate);
        if shutdown.load(Ordering::SeqCst) {
            return stop_on_timeout(&mut engine, &run_dir, summary);
        }
        summary.last_checkpoint =
            Some(engine.save_checkpoint(&run_dir, Some(HEAD_DONE_SUFFIX))?.directory);
    }

    engine.logger_mut().flush()?;
    info!(experiment = %name, "run finished");
    Ok(summary)
}

fn stop_on_timeout(
    engine: &mut Engine,
    run_dir: &Path,
    mut summary: RunSummary,
) -> Result<RunSummary, TrainingError> {
    warn!("termination requested; writing timeout checkpoint");
    let descriptor = engine.save_checkpoint(run_dir, Some(TIMEOUT_SUFFIX))?;
    engine.logger_mut().flush()?;
    summary.last_checkpoint = Some(descriptor.directory);
    summary.interrupted = true;
    Ok(summary)
}

struct StreamSet {
    train: PatchLoader,
    val: PatchLoader,
    test: PatchLoader,
}

struct Streams {
    pretrain: StreamSet,
    downstream: Option<StreamSet>,
}

impl Streams {
    fn build(config: &TrainingConfig, splits: &SplitPaths) -> Result<Self, TrainingError> {
        let root = &config.data.data_path;
        let train = Arc::new(PatchDataset::from_split_file(root, &splits.train)?);
        let val = Arc::new(PatchDataset::from_split_file(root, &splits.val)?);
        let test = Arc::new(PatchDataset::from_split_file(root, &splits.test)?);

        let pretrain_options = LoaderOptions {
            batch_size: config.data.batch_size,
            num_transforms: NUM_TRANSFORMS,
            with_labels: false,
            shuffle: true,
            augment: true,
            seed: config.experiment.seed,
            num_workers: config.data.num_workers,
            num_classes: config.downstream.num_classes,
        };
        let pretrain = StreamSet {
            train: PatchLoader::new(train.clone(), pretrain_options.clone())?,
            val: PatchLoader::new(
                val.clone(),
                LoaderOptions {
                    shuffle: false,
                    ..pretrain_options.clone()
                },
            )?,
            test: PatchLoader::new(
                test.clone(),
                LoaderOptions {
                    shuffle: false,
                    ..pretrain_options
                },
            )?,
        };

        let downstream = if config.wants_downstream() {
            let train_options = LoaderOptions {
                batch_size: config.downstream.ftop_batch_size,
                num_transforms: 1,
                with_labels: true,
                shuffle: true,
                augment: true,
                seed: config.experiment.seed,
                num_workers: config.data.num_workers,
                num_classes: config.downstream.num_classes,
            };
            let eval_options = LoaderOptions {
                shuffle: false,
                augment: false,
                ..train_options.clone()
            };
            Some(StreamSet {
                train: PatchLoader::new(train, train_options)?,
                val: PatchLoader::new(val, eval_options.clone())?,
                test: PatchLoader::new(test, eval_options)?,
            })
        } else {
            None
        };

        info!(
            pretrain_batches = pretrain.train.len(),
            downstream_batches = downstream.as_ref().map(|set| set.train.len()),
            "data streams ready"
        );
        Ok(Self {
            pretrain,
            downstream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn termination_handler_is_installed_once() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(install_termination_handler(flag.clone()).is_ok());
        assert!(matches!(
            install_termination_handler(flag.clone()),
            Err(TrainingError::Runtime(_))
        ));
        assert!(!flag.load(Ordering::SeqCst));
    }
}
