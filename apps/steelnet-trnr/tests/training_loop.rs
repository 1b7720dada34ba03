use anyhow::Result;
use std::fs;
use std::path::Path;
use steelnet_trnr::trainer::{fit, Classifier, LoopOptions, StepOutput, StopReason};
use steelnet_trnr::Split;
use tch::{Device, Kind, Tensor};

/// Predicts the true labels and reports a scripted validation loss per epoch.
struct ScriptedClassifier {
    valid_losses: Vec<f64>,
    eval_calls: usize,
    train_batch_sizes: Vec<i64>,
}

impl ScriptedClassifier {
    fn new(valid_losses: &[f64]) -> Self {
        Self {
            valid_losses: valid_losses.to_vec(),
            eval_calls: 0,
            train_batch_sizes: Vec::new(),
        }
    }
}

impl Classifier for ScriptedClassifier {
    fn train_step(&mut self, images: &Tensor, labels: &Tensor) -> Result<StepOutput> {
        self.train_batch_sizes.push(images.size()[0]);
        Ok(StepOutput {
            loss: 1.0,
            predictions: Vec::<i64>::try_from(labels)?,
        })
    }

    fn eval_step(&mut self, _images: &Tensor, labels: &Tensor) -> Result<StepOutput> {
        let loss = self.valid_losses[self.eval_calls];
        self.eval_calls += 1;
        Ok(StepOutput {
            loss,
            predictions: Vec::<i64>::try_from(labels)?,
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, format!("epoch {}", self.eval_calls))?;
        Ok(())
    }
}

/// The scripted classifier stamps its checkpoints with the epoch count.
fn saved_epoch(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

fn split(n: i64) -> Split {
    let images = Tensor::zeros([n, 3, 4, 4], (Kind::Float, Device::Cpu));
    let labels = Tensor::arange(n, (Kind::Int64, Device::Cpu)).remainder(2);
    Split::new(images, labels, None).unwrap()
}

fn options(dir: &Path, epochs: usize, patience: usize, batch_size: usize) -> LoopOptions {
    LoopOptions {
        epochs,
        batch_size,
        patience,
        noise_coeff: 0.0,
        output_path: dir.join("best.ot"),
        device: Device::Cpu,
    }
}

#[test]
fn early_stopping_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 5, 2, 2);
    // one validation batch per epoch, so one scripted loss per epoch
    let mut classifier = ScriptedClassifier::new(&[0.9, 0.8, 0.85, 0.86, 0.84]);

    let state = fit(&mut classifier, &split(4), &split(2), &opts).unwrap();

    assert_eq!(state.epochs_run, 4);
    assert_eq!(state.stop_reason, StopReason::EarlyStopped);
    assert_eq!(state.best_epoch, Some(2));
    assert_eq!(state.stopper.best_loss(), 0.8);
    assert_eq!(classifier.eval_calls, 4);
    assert_eq!(saved_epoch(&opts.output_path), "epoch 2");
    assert_eq!(state.history.valid.loss, vec![0.9, 0.8, 0.85, 0.86]);
    assert_eq!(state.history.train.len(), 4);
    assert_eq!(state.history.valid.accuracy, vec![1.0; 4]);
}

#[test]
fn budget_exhausted_without_early_stop() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 3, 5, 2);
    let mut classifier = ScriptedClassifier::new(&[0.5, 0.6, 0.4]);

    let state = fit(&mut classifier, &split(4), &split(2), &opts).unwrap();

    assert_eq!(state.epochs_run, 3);
    assert_eq!(state.stop_reason, StopReason::EpochBudget);
    assert_eq!(state.best_epoch, Some(3));
    assert_eq!(saved_epoch(&opts.output_path), "epoch 3");
}

#[test]
fn equal_loss_is_not_an_improvement() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 3, 2, 2);
    let mut classifier = ScriptedClassifier::new(&[0.7, 0.7, 0.7]);

    let state = fit(&mut classifier, &split(2), &split(2), &opts).unwrap();

    assert_eq!(state.epochs_run, 3);
    assert_eq!(state.best_epoch, Some(1));
    assert_eq!(state.stopper.patience(), 2);
    assert_eq!(state.stop_reason, StopReason::EarlyStopped);
    assert_eq!(saved_epoch(&opts.output_path), "epoch 1");
}

#[test]
fn partial_batches_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 1, 1, 3);
    let mut classifier = ScriptedClassifier::new(&[1.0, 1.0]);

    // 7 training samples -> 2 batches of 3, validation 6 -> 2 batches
    fit(&mut classifier, &split(7), &split(6), &opts).unwrap();

    assert_eq!(classifier.train_batch_sizes, vec![3, 3]);
    assert_eq!(classifier.eval_calls, 2);
}

#[test]
fn noise_doubles_training_batches_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut opts = options(dir.path(), 1, 1, 2);
    opts.noise_coeff = 0.15;
    let mut classifier = ScriptedClassifier::new(&[1.0]);

    let state = fit(&mut classifier, &split(4), &split(2), &opts).unwrap();

    assert_eq!(classifier.train_batch_sizes, vec![4, 4]);
    assert_eq!(classifier.eval_calls, 1);
    assert_eq!(state.history.train.accuracy, vec![1.0]);
}

#[test]
fn split_smaller_than_a_batch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 1, 1, 4);
    let mut classifier = ScriptedClassifier::new(&[1.0]);

    assert!(fit(&mut classifier, &split(8), &split(3), &opts).is_err());
    assert!(!opts.output_path.exists());
}
