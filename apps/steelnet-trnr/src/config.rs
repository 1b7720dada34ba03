use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

/// Sub-batch size used by the sliding window is `batch_size` times this.
pub const SLIDING_BATCH_MULTIPLIER: usize = 2;

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(
    name = "steelnet-trnr",
    about = "Train a SqueezeNet steel defect classifier with early stopping"
)]
pub struct TrainingConfig {
    /// Where the best parameters are written (overwritten on every improvement).
    #[arg(long)]
    pub model_output_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/X_train.pth")]
    pub train_input_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/y_train.pth")]
    pub train_label_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/M_train.pth")]
    pub train_mask_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/X_train_aug.pth")]
    pub train_augmented_input_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/y_train_aug.pth")]
    pub train_augmented_label_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/M_train_aug.pth")]
    pub train_augmented_mask_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/X_val.pth")]
    pub val_input_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/y_val.pth")]
    pub val_label_path: PathBuf,
    #[arg(long, default_value = "../data/multiData/M_val.pth")]
    pub val_mask_path: PathBuf,
    /// Pretrained SqueezeNet 1.1 weights in tch `.ot` format (ignored with --vanilla).
    #[arg(long, default_value = "squeezenet1_1.ot")]
    pub pretrained_weights: PathBuf,
    /// Where the training curves are written as JSON.
    /// Defaults to the model output path with a `history.json` extension.
    #[arg(long)]
    pub history_output_path: Option<PathBuf>,
    /// Split every image into 64x64 tiles and drop the blank ones.
    #[arg(long)]
    pub use_sliding_window: bool,
    /// Accepted for compatibility; class zero is not subsampled.
    #[arg(long, default_value_t = 0.50)]
    pub reduce_class_zero: f64,
    /// Append the augmented training set.
    #[arg(long)]
    pub use_augmentation: bool,
    /// Force CPU even when CUDA is available.
    #[arg(long)]
    pub cpu: bool,
    /// Truncate the backbone features to this many layers (7, 8, 9 or 10).
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub reduced: i64,
    /// Number of output classes.
    #[arg(long, default_value_t = 5)]
    pub n_output: i64,
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 0.0001)]
    pub lr: f64,
    /// Non-improving epochs tolerated before stopping.
    #[arg(long, default_value_t = 5)]
    pub patience: usize,
    #[arg(long, default_value_t = 60)]
    pub epochs: usize,
    /// Scale of the gaussian noise copy appended to each training batch (0 disables it).
    #[arg(long, default_value_t = 0.15)]
    pub noise_coeff: f64,
    /// Weight the loss by the inverse validation class frequency.
    #[arg(long)]
    pub weight_loss: bool,
    /// Also save the parameters of the final epoch.
    #[arg(long)]
    pub save_last: bool,
    /// Start from an untrained backbone.
    #[arg(long)]
    pub vanilla: bool,
}

impl TrainingConfig {
    pub fn device(&self) -> Device {
        if self.cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available()
        }
    }

    /// Masks are only needed when they get tiled or merged.
    pub fn needs_train_masks(&self) -> bool {
        self.use_augmentation || self.use_sliding_window
    }

    pub fn sliding_batch_size(&self) -> usize {
        self.batch_size * SLIDING_BATCH_MULTIPLIER
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_output_path
            .clone()
            .unwrap_or_else(|| self.model_output_path.with_extension("history.json"))
    }

    pub fn last_model_path(&self) -> PathBuf {
        sibling_with_suffix(&self.model_output_path, "_last")
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}
