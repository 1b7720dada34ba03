use anyhow::{ensure, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tch::{Device, Tensor};
use tracing::{debug, info};

use crate::{
    augment,
    config::TrainingConfig,
    dataset::{self, Split},
    metrics::{self, BatchMetrics},
    model::SqueezeNetClassifier,
};

/// Loss and argmax class of every sample of one batch.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    pub predictions: Vec<i64>,
}

/// The trainable network as seen by the loop: an update step, a
/// gradient-free evaluation step and parameter persistence.
pub trait Classifier {
    fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<StepOutput>;
    fn eval_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<StepOutput>;
    fn save(&self, path: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointDecision {
    Improved,
    Stalled,
}

/// Best validation loss seen so far and the number of epochs since it.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    best_loss: f64,
    patience: usize,
    max_patience: usize,
}

impl EarlyStopping {
    pub fn new(max_patience: usize) -> Self {
        Self {
            best_loss: f64::INFINITY,
            patience: 0,
            max_patience,
        }
    }

    /// Only a strictly lower loss counts as an improvement.
    pub fn observe(&mut self, valid_loss: f64) -> CheckpointDecision {
        if valid_loss < self.best_loss {
            self.best_loss = valid_loss;
            self.patience = 0;
            CheckpointDecision::Improved
        } else {
            self.patience += 1;
            CheckpointDecision::Stalled
        }
    }

    pub fn should_stop(&self) -> bool {
        self.patience >= self.max_patience
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}

/// Append-only per-epoch curves of one split.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Curves {
    pub loss: Vec<f64>,
    pub accuracy: Vec<f64>,
    pub balanced_accuracy: Vec<f64>,
    pub f1: Vec<f64>,
}

impl Curves {
    pub fn push(&mut self, epoch: &BatchMetrics) {
        self.loss.push(epoch.loss);
        self.accuracy.push(epoch.accuracy);
        self.balanced_accuracy.push(epoch.balanced_accuracy);
        self.f1.push(epoch.f1);
    }

    pub fn len(&self) -> usize {
        self.loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loss.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub train: Curves,
    pub valid: Curves,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EarlyStopped,
    EpochBudget,
}

/// Everything the loop carries from one epoch to the next.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub history: History,
    pub stopper: EarlyStopping,
    pub best_epoch: Option<usize>,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
}

impl LoopState {
    pub fn new(max_patience: usize) -> Self {
        Self {
            history: History::default(),
            stopper: EarlyStopping::new(max_patience),
            best_epoch: None,
            epochs_run: 0,
            stop_reason: StopReason::EpochBudget,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub patience: usize,
    pub noise_coeff: f64,
    pub output_path: PathBuf,
    pub device: Device,
}

impl From<&TrainingConfig> for LoopOptions {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            patience: config.patience,
            noise_coeff: config.noise_coeff,
            output_path: config.model_output_path.clone(),
            device: config.device(),
        }
    }
}

fn progress_bar(len: usize, phase: &'static str, epoch: usize) -> Result<ProgressBar> {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(ProgressStyle::with_template(
        "{prefix:>12} {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}<{eta_precise}] {msg}",
    )?);
    bar.set_prefix(format!("{phase} {epoch}"));
    Ok(bar)
}

fn label_vec(labels: &Tensor) -> Result<Vec<i64>> {
    Ok(Vec::<i64>::try_from(&labels.to_device(Device::Cpu))?)
}

fn train_epoch<C: Classifier>(
    classifier: &mut C,
    split: &Split,
    opts: &LoopOptions,
    epoch: usize,
) -> Result<BatchMetrics> {
    let batches = split.num_batches(opts.batch_size);
    let bar = progress_bar(batches, "train", epoch)?;
    let mut metrics = Vec::with_capacity(batches);
    for n in 0..batches {
        let (images, labels) = split.get_batch(n, opts.batch_size, opts.device);
        let (images, labels) = augment::with_noise(&images, &labels, opts.noise_coeff);
        let step = classifier.train_step(&images, &labels)?;
        let batch = BatchMetrics::evaluate(step.loss, &label_vec(&labels)?, &step.predictions);
        bar.set_message(format!("loss {:.4}", batch.loss));
        bar.inc(1);
        metrics.push(batch);
    }
    bar.finish_and_clear();
    Ok(BatchMetrics::mean(&metrics))
}

fn validate_epoch<C: Classifier>(
    classifier: &mut C,
    split: &Split,
    opts: &LoopOptions,
    epoch: usize,
) -> Result<BatchMetrics> {
    let batches = split.num_batches(opts.batch_size);
    let bar = progress_bar(batches, "valid", epoch)?;
    let mut metrics = Vec::with_capacity(batches);
    for n in 0..batches {
        let (images, labels) = split.get_batch(n, opts.batch_size, opts.device);
        let step = classifier.eval_step(&images, &labels)?;
        metrics.push(BatchMetrics::evaluate(
            step.loss,
            &label_vec(&labels)?,
            &step.predictions,
        ));
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(BatchMetrics::mean(&metrics))
}

/// Runs train/validate epochs until the budget is spent or the validation
/// loss stops improving for `patience` epochs. Parameters are saved to
/// `output_path` every time the validation loss hits a new minimum.
pub fn fit<C: Classifier>(
    classifier: &mut C,
    train: &Split,
    valid: &Split,
    opts: &LoopOptions,
) -> Result<LoopState> {
    ensure!(opts.batch_size > 0, "batch size must be positive");
    ensure!(
        train.len() >= opts.batch_size,
        "training split has {} samples, fewer than one batch of {}",
        train.len(),
        opts.batch_size
    );
    ensure!(
        valid.len() >= opts.batch_size,
        "validation split has {} samples, fewer than one batch of {}",
        valid.len(),
        opts.batch_size
    );

    let mut state = LoopState::new(opts.patience);
    for epoch in 1..=opts.epochs {
        let train_metrics = train_epoch(classifier, train, opts, epoch)?;
        let valid_metrics = validate_epoch(classifier, valid, opts, epoch)?;
        state.history.train.push(&train_metrics);
        state.history.valid.push(&valid_metrics);
        state.epochs_run = epoch;

        match state.stopper.observe(valid_metrics.loss) {
            CheckpointDecision::Improved => {
                info!(
                    path = %opts.output_path.display(),
                    "new best parameters found, saving them"
                );
                classifier.save(&opts.output_path)?;
                state.best_epoch = Some(epoch);
            }
            CheckpointDecision::Stalled => {
                debug!(patience = state.stopper.patience(), "no improvement");
            }
        }

        info!(
            epoch,
            loss = %format!("{:.4}", train_metrics.loss),
            accuracy = %format!("{:.4}", train_metrics.accuracy),
            f1 = %format!("{:.4}", train_metrics.f1),
            balanced_accuracy = %format!("{:.4}", train_metrics.balanced_accuracy),
            "train"
        );
        info!(
            epoch,
            loss = %format!("{:.4}", valid_metrics.loss),
            accuracy = %format!("{:.4}", valid_metrics.accuracy),
            f1 = %format!("{:.4}", valid_metrics.f1),
            balanced_accuracy = %format!("{:.4}", valid_metrics.balanced_accuracy),
            "valid"
        );

        if state.stopper.should_stop() {
            info!("max patience has been reached, stopping training");
            state.stop_reason = StopReason::EarlyStopped;
            break;
        }
    }
    Ok(state)
}

/// Summary of a finished run, written as JSON next to the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub config: TrainingConfig,
    pub history: History,
    pub best_epoch: Option<usize>,
    pub best_valid_loss: Option<f64>,
    pub epochs_run: usize,
    pub stop_reason: StopReason,
}

impl TrainingReport {
    pub fn new(config: TrainingConfig, state: LoopState) -> Self {
        let best = state.stopper.best_loss();
        Self {
            config,
            history: state.history,
            best_epoch: state.best_epoch,
            best_valid_loss: best.is_finite().then_some(best),
            epochs_run: state.epochs_run,
            stop_reason: state.stop_reason,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("failed to write training history to {}", path.display()))
    }
}

/// Writes a dummy tensor so an unwritable output path fails before any
/// data is loaded.
fn write_placeholder(path: &Path) -> Result<()> {
    Tensor::from_slice(&[1i64])
        .save(path)
        .with_context(|| format!("model output path {} is not writable", path.display()))
}

pub struct SteelNetTrainer {
    config: TrainingConfig,
    classifier: SqueezeNetClassifier,
    train: Split,
    valid: Split,
}

impl SteelNetTrainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        info!(device = ?config.device(), "device");
        info!(?config, "arguments");
        write_placeholder(&config.model_output_path)?;

        let (train, valid) = dataset::load_splits(&config)?;
        info!(train = train.len(), valid = valid.len(), "loaded splits");

        let class_weights = if config.weight_loss {
            let weights = metrics::class_weights(&valid.label_vec()?, config.n_output)?;
            info!(?weights, "using weighted loss");
            Some(weights)
        } else {
            None
        };
        let classifier = SqueezeNetClassifier::new(&config, class_weights)?;

        Ok(Self {
            config,
            classifier,
            train,
            valid,
        })
    }

    pub fn train(&mut self) -> Result<TrainingReport> {
        info!("starting training");
        let opts = LoopOptions::from(&self.config);
        let state = fit(&mut self.classifier, &self.train, &self.valid, &opts)?;

        if self.config.save_last {
            let last = self.config.last_model_path();
            self.classifier.save(&last)?;
            info!(path = %last.display(), "saved last epoch parameters");
        }

        let report = TrainingReport::new(self.config.clone(), state);
        let history_path = self.config.history_path();
        report.write(&history_path)?;
        info!(
            path = %history_path.display(),
            epochs = report.epochs_run,
            best_epoch = ?report.best_epoch,
            "training finished"
        );
        Ok(report)
    }
}
