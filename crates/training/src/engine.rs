//! The training engine: one mutable owner of model, optimizer, scheduler,
//! loss scaler and counters, moving from contrastive pretraining to a
//! downstream classifier (linear probe or fine-tuning) exactly once.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor, Var,
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, SeedableRng};
use simclr_model::{classification_head, ClassifierNet, Parameterized, PretrainNet};
use tracing::{debug, info, warn};

use crate::{
    amp::AmpContext,
    checkpoint::{self, CheckpointDescriptor, CheckpointPhase, LoadedCheckpoint, SaveRequest},
    data::{next_cycled, split_views, Batch, BatchStream},
    logging::RunLogger,
    loss::{BceWithLogitsLoss, LossOutput, NtXentLoss},
    metrics::{binarize_logits, compute_metrics, MetricMap, MetricsAggregator},
    optimizer::{
        add_weight_decay, lars::DEFAULT_TRUST_COEF, scaler::contains_non_finite, Adam,
        AdamConfig, GradientScaler, GradientScalerState, Gradients, Lars, Optimizer, Sgd,
        SgdConfig,
    },
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Augmented views per pretraining sample.
pub const NUM_TRANSFORMS: usize = 2;

const DOWNSTREAM_WEIGHT_DECAY: f64 = 2e-5;
const PROBE_LR: f64 = 1.6;
const FINETUNE_LR: f64 = 0.8;
const DOWNSTREAM_MOMENTUM: f64 = 0.9;
const LARS_MOMENTUM: f64 = 0.9;
const LARS_BASE_LR: f64 = 0.3;
const LARS_REFERENCE_BATCH: f64 = 256.0;

/// Picks an accelerator when asked for one and available, otherwise the CPU.
pub fn select_device(prefer_gpu: bool) -> Device {
    if !prefer_gpu {
        info!("gpu disabled by configuration; using CPU");
        return Device::Cpu;
    }
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    debug!(cuda_available, metal_available, "device detection");

    if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => warn!(%err, "cuda reported available but initialization failed"),
        }
    } else if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => warn!(%err, "failed to initialize metal device"),
        }
    }
    warn!("no GPU backend available; using CPU");
    Device::Cpu
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamMode {
    LinearProbe,
    FineTune,
}

impl DownstreamMode {
    pub fn from_config(config: &TrainingConfig) -> Option<Self> {
        if config.downstream.linear_probe {
            Some(Self::LinearProbe)
        } else if config.downstream.fine_tuning {
            Some(Self::FineTune)
        } else {
            None
        }
    }

    fn learning_rate(self) -> f64 {
        match self {
            Self::LinearProbe => PROBE_LR,
            Self::FineTune => FINETUNE_LR,
        }
    }

    fn checkpoint_phase(self) -> CheckpointPhase {
        match self {
            Self::LinearProbe => CheckpointPhase::Probe,
            Self::FineTune => CheckpointPhase::Finetune,
        }
    }
}

/// How a pass over a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    Completed,
    /// The shutdown flag was raised between two batches.
    Interrupted,
}

struct PretrainState {
    model: PretrainNet,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LRScheduler>>,
    loss: NtXentLoss,
}

struct DownstreamState {
    mode: DownstreamMode,
    model: ClassifierNet,
    optimizer: Box<dyn Optimizer>,
    loss: BceWithLogitsLoss,
    aggregator: MetricsAggregator,
}

enum Phase {
    Pretrain(Box<PretrainState>),
    Downstream(Box<DownstreamState>),
    /// Only observable if a phase transition failed half way.
    Vacant,
}

pub struct Engine {
    config: TrainingConfig,
    device: Device,
    amp: AmpContext,
    phase: Phase,
    scaler: GradientScaler,
    iteration_count: u64,
    epoch_count: u64,
    logger: RunLogger,
    shutdown: Arc<AtomicBool>,
    rng: StdRng,
    already_loaded: bool,
}

impl Engine {
    /// Builds the pretraining engine and, unless only a downstream test is
    /// requested, restores `runtime.load_checkpoint` right away.
    pub fn new(
        config: TrainingConfig,
        device: Device,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let model_config = config.model.resolve()?;
        let seed = config.experiment.seed;
        if !device.is_cpu() {
            if let Err(err) = device.set_seed(seed) {
                warn!(%err, "failed to seed device RNG");
            }
        }
        let mut rng = StdRng::seed_from_u64(seed);

        let model = PretrainNet::new(&model_config, &mut rng, &device)?;
        let optimizer = build_pretrain_optimizer(&config, &model)?;
        let scheduler = if config.optimization.sched {
            Some(
                SchedulerConfig::CosineAnnealing {
                    base_lr: optimizer.learning_rate(),
                    t_max: config.optimization.sched_t_max,
                    eta_min: 0.0,
                }
                .build()?,
            )
        } else {
            None
        };
        let loss = NtXentLoss::new(config.optimization.ntx_temp)?;
        if config.optimization.clip_norm <= 0.0 {
            info!(clip_norm = config.optimization.clip_norm, "gradient clipping disabled");
        }
        info!(
            tensors = model.parameters().len(),
            weights = model.num_elements(),
            optimizer = %optimizer.kind(),
            lr = optimizer.learning_rate(),
            scheduler = scheduler.is_some(),
            "pretraining model ready"
        );

        let precision = config.runtime.precision;
        let mut engine = Self {
            amp: AmpContext::new(precision, &device),
            scaler: GradientScaler::new(precision),
            phase: Phase::Pretrain(Box::new(PretrainState {
                model,
                optimizer,
                scheduler,
                loss,
            })),
            iteration_count: 0,
            epoch_count: 0,
            logger: RunLogger::disabled(),
            shutdown,
            rng,
            already_loaded: false,
            device,
            config,
        };

        if let Some(path) = engine.config.runtime.load_checkpoint.clone() {
            let test_only = engine.config.runtime.epochs <= 0
                && engine.config.wants_downstream()
                && engine.config.downstream.ftop_epochs <= 0;
            if test_only {
                warn!("checkpoint will be loaded at head renewal instead");
                warn!("resuming head training is not supported");
            } else {
                engine.load_checkpoint(&path)?;
                engine.already_loaded = true;
                info!(path = %path.display(), "model loaded");
            }
        }
        Ok(engine)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    pub fn epoch_count(&self) -> u64 {
        self.epoch_count
    }

    pub fn already_loaded(&self) -> bool {
        self.already_loaded
    }

    pub fn set_logger(&mut self, logger: RunLogger) {
        self.logger = logger;
    }

    pub fn logger_mut(&mut self) -> &mut RunLogger {
        &mut self.logger
    }

    pub fn phase(&self) -> Option<CheckpointPhase> {
        match &self.phase {
            Phase::Pretrain(_) => Some(CheckpointPhase::Pretrain),
            Phase::Downstream(state) => Some(state.mode.checkpoint_phase()),
            Phase::Vacant => None,
        }
    }

    pub fn pretrain_model(&self) -> Option<&PretrainNet> {
        match &self.phase {
            Phase::Pretrain(state) => Some(&state.model),
            _ => None,
        }
    }

    pub fn classifier(&self) -> Option<&ClassifierNet> {
        match &self.phase {
            Phase::Downstream(state) => Some(&state.model),
            _ => None,
        }
    }

    pub fn model(&self) -> Result<&dyn Parameterized, TrainingError> {
        match &self.phase {
            Phase::Pretrain(state) => Ok(&state.model),
            Phase::Downstream(state) => Ok(&state.model),
            Phase::Vacant => Err(vacant()),
        }
    }

    pub fn optimizer(&self) -> Result<&dyn Optimizer, TrainingError> {
        match &self.phase {
            Phase::Pretrain(state) => Ok(state.optimizer.as_ref()),
            Phase::Downstream(state) => Ok(state.optimizer.as_ref()),
            Phase::Vacant => Err(vacant()),
        }
    }

    fn optimizer_mut(&mut self) -> Result<&mut dyn Optimizer, TrainingError> {
        match &mut self.phase {
            Phase::Pretrain(state) => Ok(state.optimizer.as_mut()),
            Phase::Downstream(state) => Ok(state.optimizer.as_mut()),
            Phase::Vacant => Err(vacant()),
        }
    }

    /// Current learning rate: the scheduler's when one is configured, else the optimizer's fixed rate.
    pub fn learning_rate(&self) -> Result<f64, TrainingError> {
        if let Phase::Pretrain(state) = &self.phase {
            if let Some(scheduler) = &state.scheduler {
                return Ok(scheduler.learning_rate());
            }
        }
        Ok(self.optimizer()?.learning_rate())
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.loss_scale()
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// One pass of contrastive pretraining over `train`, evaluating on batches pulled from `val`.
    pub fn train_epoch(
        &mut self,
        train: &mut dyn BatchStream,
        val: &mut dyn BatchStream,
    ) -> Result<EpochOutcome, TrainingError> {
        if !matches!(self.phase, Phase::Pretrain(_)) {
            return Err(TrainingError::invariant(
                "train_epoch is only available before the head is renewed",
            ));
        }
        let outcome = self.run_epoch(train, val, "train", "val")?;
        if outcome == EpochOutcome::Interrupted {
            return Ok(outcome);
        }

        if let Phase::Pretrain(state) = &mut self.phase {
            if let Some(scheduler) = state.scheduler.as_mut() {
                let lr = scheduler.step();
                state.optimizer.set_learning_rate(lr);
                debug!(lr, "scheduler stepped");
            }
        }
        self.epoch_count += 1;
        info!(epoch = self.epoch_count, iteration = self.iteration_count, "pretraining epoch done");
        Ok(outcome)
    }

    /// Loss on one batch without gradients.
    pub fn evaluate(&self, batch: &Batch) -> Result<MetricMap, TrainingError> {
        let output = match &self.phase {
            Phase::Pretrain(_) => self.contrastive_loss(batch)?,
            Phase::Downstream(_) => self.classifier_loss(batch)?.0,
            Phase::Vacant => return Err(vacant()),
        };
        Ok(loss_metrics(&output))
    }

    /// Contrastive loss on every batch of `test`, reported per batch index. Returns the mean loss.
    pub fn test(&mut self, test: &mut dyn BatchStream) -> Result<MetricMap, TrainingError> {
        if !matches!(self.phase, Phase::Pretrain(_)) {
            return Err(TrainingError::invariant(
                "test is only available before the head is renewed",
            ));
        }
        test.begin_epoch()?;
        let bar = self.progress_bar(test.len(), "test");
        let mut total = 0.0f64;
        let mut batches = 0u64;
        while let Some(batch) = test.next_batch()? {
            if self.interrupted() {
                bar.abandon();
                warn!(batches, "test interrupted");
                break;
            }
            let metrics = self.evaluate(&batch)?;
            total += metrics.get("loss").copied().unwrap_or(0.0);
            self.report("test", &metrics, batches)?;
            batches += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();

        let mut summary = MetricMap::new();
        summary.insert("loss".into(), if batches > 0 { total / batches as f64 } else { 0.0 });
        Ok(summary)
    }

    /// Replaces the projection head with a fresh linear classifier and switches to downstream training.
    pub fn renew_head(&mut self) -> Result<(), TrainingError> {
        let mode = DownstreamMode::from_config(&self.config).ok_or_else(|| {
            TrainingError::invariant("renew_head requires linear_probe or fine_tuning")
        })?;
        let pretrain = match std::mem::replace(&mut self.phase, Phase::Vacant) {
            Phase::Pretrain(state) => state,
            other => {
                self.phase = other;
                return Err(TrainingError::invariant("the head has already been renewed"));
            }
        };
        let PretrainState { model, .. } = *pretrain;

        let num_classes = self.config.downstream.num_classes;
        let head = classification_head(
            model.encoder().output_dim(),
            num_classes,
            &mut self.rng,
            &self.device,
        )?;
        let mut classifier = model.into_classifier(head)?;
        classifier.encoder_mut().set_trainable(false);

        let trainable: Vec<String> = classifier
            .trainable_parameters()
            .iter()
            .map(|param| param.name().to_string())
            .collect();
        for name in &trainable {
            info!(param = %name, "trainable after head renewal");
        }
        if trainable.len() != 2 {
            return Err(TrainingError::invariant(format!(
                "expected exactly 2 trainable tensors after head renewal, found {}",
                trainable.len()
            )));
        }
        if mode == DownstreamMode::FineTune {
            classifier.set_trainable(true);
            let count = classifier.trainable_count();
            if count <= 2 {
                return Err(TrainingError::invariant(format!(
                    "fine-tuning expects more than 2 trainable tensors, found {count}"
                )));
            }
        }

        let groups = add_weight_decay(
            classifier.trainable_parameters(),
            mode.learning_rate(),
            DOWNSTREAM_WEIGHT_DECAY,
        );
        let optimizer = Sgd::new(
            groups,
            SgdConfig {
                momentum: DOWNSTREAM_MOMENTUM,
                dampening: 0.0,
                nesterov: true,
            },
        )?;

        let precision = self.config.runtime.precision;
        self.amp = AmpContext::new(precision, &self.device);
        self.scaler = GradientScaler::new(precision);
        info!(
            ?mode,
            trainable = classifier.trainable_count(),
            lr = mode.learning_rate(),
            "head renewed"
        );

        self.phase = Phase::Downstream(Box::new(DownstreamState {
            mode,
            model: classifier,
            optimizer: Box::new(optimizer),
            loss: BceWithLogitsLoss::new(),
            aggregator: MetricsAggregator::new(num_classes, self.config.downstream.ftop_batch_size),
        }));
        self.iteration_count = 0;
        self.epoch_count = 0;

        if let Some(path) = self.config.runtime.load_checkpoint.clone() {
            if !self.already_loaded {
                self.load_checkpoint(&path)?;
                self.already_loaded = true;
                info!(path = %path.display(), "downstream model loaded");
            }
        }
        Ok(())
    }

    /// One pass of supervised training of the probe or the fine-tuned network.
    pub fn finetune_or_train_probe(
        &mut self,
        train: &mut dyn BatchStream,
        val: &mut dyn BatchStream,
    ) -> Result<EpochOutcome, TrainingError> {
        if !matches!(self.phase, Phase::Downstream(_)) {
            return Err(TrainingError::invariant(
                "renew_head must run before downstream training",
            ));
        }
        let outcome = self.run_epoch(train, val, "ftop-train", "ftop-val")?;
        if outcome == EpochOutcome::Interrupted {
            return Ok(outcome);
        }

        let aggregate = match &mut self.phase {
            Phase::Downstream(state) => {
                let aggregate = state.aggregator.compute();
                state.aggregator.reset();
                aggregate
            }
            _ => return Err(vacant()),
        };
        self.report("ftop-val-agg", &aggregate, self.epoch_count)?;
        self.epoch_count += 1;
        info!(epoch = self.epoch_count, iteration = self.iteration_count, "downstream epoch done");
        Ok(outcome)
    }

    /// Scores every test batch and returns the aggregate over the whole stream.
    pub fn test_finetuned_or_probed_model(
        &mut self,
        test: &mut dyn BatchStream,
    ) -> Result<MetricMap, TrainingError> {
        match &mut self.phase {
            Phase::Downstream(state) => state.aggregator.reset(),
            _ => {
                return Err(TrainingError::invariant(
                    "renew_head must run before testing the classifier",
                ))
            }
        }
        let balances = self.balances_tensor(test)?;
        test.begin_epoch()?;
        let bar = self.progress_bar(test.len(), "ftop-test");
        let mut index = 0u64;
        while let Some(batch) = test.next_batch()? {
            if self.interrupted() {
                bar.abandon();
                warn!(batches = index, "classifier test interrupted");
                break;
            }
            let metrics = self.score_classifier(&batch, &balances)?;
            self.report("ftop-test", &metrics, index)?;
            index += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();

        let aggregate = match &self.phase {
            Phase::Downstream(state) => state.aggregator.compute(),
            _ => return Err(vacant()),
        };
        self.report("ftop-test-agg", &aggregate, 0)?;
        Ok(aggregate)
    }

    /// Writes `model_{epoch_count}[_{suffix}]` under `dir` with the current phase's model and optimizer.
    pub fn save_checkpoint(
        &self,
        dir: &Path,
        suffix: Option<&str>,
    ) -> Result<CheckpointDescriptor, TrainingError> {
        let (model, optimizer, scheduler, phase): (
            &dyn Parameterized,
            &dyn Optimizer,
            Option<&dyn LRScheduler>,
            CheckpointPhase,
        ) = match &self.phase {
            Phase::Pretrain(state) => (
                &state.model,
                state.optimizer.as_ref(),
                state.scheduler.as_deref(),
                CheckpointPhase::Pretrain,
            ),
            Phase::Downstream(state) => (
                &state.model,
                state.optimizer.as_ref(),
                None,
                state.mode.checkpoint_phase(),
            ),
            Phase::Vacant => return Err(vacant()),
        };
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir: dir,
            suffix,
            config: &self.config,
            phase,
            iteration_count: self.iteration_count,
            epoch_count: self.epoch_count,
            model,
            optimizer,
            scheduler,
            scaler: &self.scaler,
        })?;
        info!(path = %descriptor.directory.display(), "checkpoint saved");
        Ok(descriptor)
    }

    /// Restores a checkpoint into the current phase. Weights, optimizer and scheduler state are all
    /// checked before any of them is written.
    ///
    /// In the downstream phase a pretraining checkpoint only restores the backbone (`encoder.*`).
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), TrainingError> {
        let loaded = checkpoint::load_checkpoint(path, &self.device)?;
        let stored_phase = loaded.manifest.phase;
        match &mut self.phase {
            Phase::Pretrain(state) => {
                if stored_phase != CheckpointPhase::Pretrain {
                    return Err(TrainingError::checkpoint(format!(
                        "cannot resume pretraining from a {stored_phase:?} checkpoint"
                    )));
                }
                ensure_optimizer_kind(state.optimizer.as_ref(), &loaded)?;
                let LoadedCheckpoint {
                    manifest,
                    weights,
                    optimizer_state,
                    scheduler_state,
                    scaler_state,
                    ..
                } = loaded;
                let staged = checkpoint::stage_model_weights(&state.model, &weights, "")?;
                let previous_schedule =
                    state.scheduler.as_ref().map(|scheduler| scheduler.snapshot());
                let scheduled_lr = match (state.scheduler.as_mut(), scheduler_state) {
                    (Some(scheduler), Some(snapshot)) => {
                        scheduler.restore(&snapshot)?;
                        Some(scheduler.learning_rate())
                    }
                    (Some(_), None) => {
                        warn!("no scheduler state found in checkpoint; moving on nonetheless");
                        None
                    }
                    (None, Some(_)) => {
                        warn!("checkpoint carries scheduler state but no scheduler is configured");
                        None
                    }
                    (None, None) => None,
                };
                if let Err(err) = state.optimizer.load_state(optimizer_state) {
                    if let (Some(scheduler), Some(previous)) =
                        (state.scheduler.as_mut(), previous_schedule)
                    {
                        scheduler.restore(&previous)?;
                    }
                    return Err(err);
                }
                staged.commit()?;
                if let Some(lr) = scheduled_lr {
                    state.optimizer.set_learning_rate(lr);
                }
                self.iteration_count = manifest.iteration_count;
                self.epoch_count = manifest.epoch_count;
                restore_scaler(&mut self.scaler, &scaler_state);
            }
            Phase::Downstream(state) => {
                if stored_phase == CheckpointPhase::Pretrain {
                    let restored =
                        checkpoint::apply_model_weights(&state.model, &loaded.weights, "encoder.")?;
                    info!(restored, "backbone restored from pretraining checkpoint");
                    return Ok(());
                }
                let staged = checkpoint::stage_model_weights(&state.model, &loaded.weights, "")?;
                if stored_phase != state.mode.checkpoint_phase() {
                    staged.commit()?;
                    warn!(
                        ?stored_phase,
                        "checkpoint comes from another downstream mode; only weights restored"
                    );
                    return Ok(());
                }
                ensure_optimizer_kind(state.optimizer.as_ref(), &loaded)?;
                state.optimizer.load_state(loaded.optimizer_state)?;
                staged.commit()?;
                self.iteration_count = loaded.manifest.iteration_count;
                self.epoch_count = loaded.manifest.epoch_count;
                restore_scaler(&mut self.scaler, &loaded.scaler_state);
            }
            Phase::Vacant => return Err(vacant()),
        }
        Ok(())
    }

    fn run_epoch(
        &mut self,
        train: &mut dyn BatchStream,
        val: &mut dyn BatchStream,
        train_ns: &str,
        val_ns: &str,
    ) -> Result<EpochOutcome, TrainingError> {
        let accumulation = self.config.optimization.acc_grad_steps.max(1);
        let eval_every = self.config.optimization.eval_every.max(1);
        let downstream = matches!(self.phase, Phase::Downstream(_));
        let balances = if downstream {
            Some(self.balances_tensor(val)?)
        } else {
            None
        };

        let num_batches = train.len();
        if num_batches == 0 {
            warn!(namespace = train_ns, "training stream yields no full batch");
        }
        train.begin_epoch()?;
        val.begin_epoch()?;
        let bar = self.progress_bar(num_batches, train_ns);
        let mut accumulated: Option<Gradients> = None;
        let mut index = 0usize;

        loop {
            if self.interrupted() {
                bar.abandon();
                warn!(batch = index, "epoch interrupted");
                return Ok(EpochOutcome::Interrupted);
            }
            let Some(batch) = train.next_batch()? else {
                break;
            };
            let is_last = index + 1 == num_batches;

            let output = if downstream {
                self.classifier_loss(&batch)?.0
            } else {
                self.contrastive_loss(&batch)?
            };
            let normalized = output.loss.affine(1.0 / accumulation as f64, 0.0)?;
            let store = self.scaler.scale(&normalized)?.backward()?;
            let vars = self.optimizer()?.vars();
            accumulated
                .get_or_insert_with(Gradients::default)
                .accumulate(&store, &vars)?;
            drop(store);

            if (index + 1) % accumulation == 0 || is_last {
                self.apply_accumulated(&mut accumulated)?;
                let mut values = loss_metrics(&output);
                if !downstream {
                    values.insert("lr".into(), self.learning_rate()?);
                }
                self.report(train_ns, &values, self.iteration_count)?;
            }

            if (index + 1) % eval_every == 0 || is_last {
                let val_batch = next_cycled(val)?;
                let values = match &balances {
                    Some(balances) => self.score_classifier(&val_batch, balances)?,
                    None => self.evaluate(&val_batch)?,
                };
                self.report(val_ns, &values, self.iteration_count)?;
            }

            self.iteration_count += 1;
            index += 1;
            bar.inc(1);
        }

        // gradients of a stream that yielded more batches than it announced
        if accumulated.is_some() {
            self.apply_accumulated(&mut accumulated)?;
        }
        bar.finish_and_clear();
        Ok(EpochOutcome::Completed)
    }

    /// Unscales, clips and applies the accumulated gradients, then updates the loss scale.
    fn apply_accumulated(&mut self, accumulated: &mut Option<Gradients>) -> Result<(), TrainingError> {
        let Some(mut grads) = accumulated.take() else {
            return Ok(());
        };
        let vars = self.optimizer()?.vars();
        let (found_inf, grad_norm) = unscale_gradients(&self.scaler, &mut grads, &vars)?;

        let clip_norm = self.config.optimization.clip_norm;
        if found_inf {
            warn!(
                loss_scale = self.scaler.loss_scale(),
                iteration = self.iteration_count,
                "non-finite gradients; skipping optimizer step"
            );
        } else {
            if clip_norm > 0.0 {
                clip_gradients(&mut grads, &vars, clip_norm, grad_norm)?;
            }
            self.optimizer_mut()?.step(&mut grads)?;
        }
        self.scaler.update(found_inf);
        debug!(grad_norm, found_inf, "optimizer step");
        Ok(())
    }

    fn contrastive_loss(&self, batch: &Batch) -> Result<LossOutput, TrainingError> {
        let Phase::Pretrain(state) = &self.phase else {
            return Err(vacant());
        };
        let views = split_views(&batch.images, NUM_TRANSFORMS)?;
        let x_i = self.amp.prepare(&views[0], &self.device)?;
        let x_j = self.amp.prepare(&views[1], &self.device)?;
        let (z_i, z_j) = state.model.forward_pair(&x_i, &x_j)?;
        state.loss.compute(&z_i, &z_j)
    }

    fn classifier_loss(&self, batch: &Batch) -> Result<(LossOutput, Tensor, Tensor), TrainingError> {
        let Phase::Downstream(state) = &self.phase else {
            return Err(vacant());
        };
        let images = self.amp.prepare(&batch.images, &self.device)?;
        let targets = batch
            .require_labels()?
            .to_device(&self.device)?
            .to_dtype(DType::F32)?;
        let logits = state.model.forward(&images)?.to_dtype(DType::F32)?;
        let output = state.loss.compute(&logits, &targets)?;
        Ok((output, logits, targets))
    }

    /// Loss plus class-weighted scores for one labeled batch; also feeds the running aggregator.
    fn score_classifier(&mut self, batch: &Batch, balances: &Tensor) -> Result<MetricMap, TrainingError> {
        let (output, logits, targets) = self.classifier_loss(batch)?;
        let predictions = binarize_logits(&logits.detach())?;
        let mut values = loss_metrics(&output);
        values.extend(compute_metrics(&predictions, &targets, balances)?);
        match &mut self.phase {
            Phase::Downstream(state) => state.aggregator.step(&predictions, &targets)?,
            _ => return Err(vacant()),
        }
        Ok(values)
    }

    fn balances_tensor(&self, stream: &dyn BatchStream) -> Result<Tensor, TrainingError> {
        let balances = stream
            .balances()
            .ok_or_else(|| TrainingError::runtime("downstream stream carries no class balances"))?;
        Ok(Tensor::from_vec(balances.to_vec(), balances.len(), &self.device)?)
    }

    fn report(&mut self, namespace: &str, values: &MetricMap, step: u64) -> Result<(), TrainingError> {
        self.logger.log(namespace, values, step, self.epoch_count)?;
        debug!(namespace, step, epoch = self.epoch_count, "metrics reported");
        Ok(())
    }

    fn progress_bar(&self, len: usize, label: &str) -> ProgressBar {
        if !self.config.runtime.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "{prefix:>12} [{bar:30}] {pos}/{len} {elapsed_precise} eta {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style.progress_chars("=> "));
        bar.set_prefix(label.to_string());
        bar
    }
}

fn vacant() -> TrainingError {
    TrainingError::invariant("engine has no active phase")
}

fn restore_scaler(scaler: &mut GradientScaler, snapshot: &GradientScalerState) {
    if !scaler.load_state(snapshot) {
        warn!("loss scaler state was saved under another precision; keeping the current scale");
    }
}

fn loss_metrics(output: &LossOutput) -> MetricMap {
    let mut values = MetricMap::new();
    values.insert("loss".into(), f64::from(output.metrics.loss()));
    values
}

fn ensure_optimizer_kind(optimizer: &dyn Optimizer, loaded: &LoadedCheckpoint) -> Result<(), TrainingError> {
    let expected = optimizer.kind();
    if loaded.optimizer_state.kind != expected {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint optimizer is '{}' but the run uses '{expected}'",
            loaded.optimizer_state.kind
        )));
    }
    Ok(())
}

fn build_pretrain_optimizer(
    config: &TrainingConfig,
    model: &PretrainNet,
) -> Result<Box<dyn Optimizer>, TrainingError> {
    let opt = &config.optimization;
    if opt.lars {
        let lr = LARS_BASE_LR * config.data.batch_size as f64 / LARS_REFERENCE_BATCH;
        let groups = add_weight_decay(model.trainable_parameters(), lr, opt.wd);
        let base = Sgd::new(
            groups,
            SgdConfig {
                momentum: LARS_MOMENTUM,
                dampening: 0.0,
                nesterov: false,
            },
        )?;
        info!(lr, trust_coef = DEFAULT_TRUST_COEF, "using LARS optimizer wrapper");
        Ok(Box::new(Lars::new(base, DEFAULT_TRUST_COEF)))
    } else {
        let groups = add_weight_decay(model.trainable_parameters(), opt.lr, opt.wd);
        Ok(Box::new(Adam::new(groups, AdamConfig::default())?))
    }
}

/// Divides every tracked gradient by the loss scale. Returns whether any is non-finite and the global norm.
fn unscale_gradients(
    scaler: &GradientScaler,
    grads: &mut Gradients,
    vars: &[Var],
) -> Result<(bool, f64), TrainingError> {
    let mut found_inf = false;
    let mut sum_squares = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.remove(var) {
            let unscaled = scaler.unscale(&grad)?;
            if !found_inf && contains_non_finite(&unscaled)? {
                found_inf = true;
            }
            if !found_inf {
                sum_squares += unscaled
                    .to_dtype(DType::F32)?
                    .sqr()?
                    .sum_all()?
                    .to_vec0::<f32>()? as f64;
            }
            grads.insert(var, unscaled);
        }
    }
    Ok((found_inf, sum_squares.sqrt()))
}

/// Rescales tracked gradients so their global norm does not exceed `max_norm`.
fn clip_gradients(
    grads: &mut Gradients,
    vars: &[Var],
    max_norm: f64,
    total_norm: f64,
) -> Result<(), TrainingError> {
    if total_norm <= max_norm {
        return Ok(());
    }
    let clip_coef = max_norm / (total_norm + 1e-6);
    for var in vars {
        if let Some(grad) = grads.remove(var) {
            grads.insert(var, grad.affine(clip_coef, 0.0)?);
        }
    }
    Ok(())
}
