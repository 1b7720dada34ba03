use anyhow::{ensure, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;
use tch::{Device, Kind, Tensor};
use tracing::info;

use crate::config::TrainingConfig;
use crate::tiling;

/// One in-memory split: `[N, 3, H, W]` images, `[N]` labels and optional
/// `[N, H, W]` masks, all index-aligned.
#[derive(Debug)]
pub struct Split {
    pub images: Tensor,
    pub labels: Tensor,
    pub masks: Option<Tensor>,
}

fn load_tensor(path: &Path) -> Result<Tensor> {
    Tensor::load(path).with_context(|| format!("failed to load tensor from {}", path.display()))
}

impl Split {
    pub fn new(images: Tensor, labels: Tensor, masks: Option<Tensor>) -> Result<Self> {
        let n = images.size().first().copied().unwrap_or(0);
        let label_n = labels.size().first().copied().unwrap_or(0);
        ensure!(n == label_n, "{n} images but {label_n} labels");
        if let Some(masks) = &masks {
            let mask_n = masks.size().first().copied().unwrap_or(0);
            ensure!(n == mask_n, "{n} images but {mask_n} masks");
        }
        Ok(Self {
            images: images.to_kind(Kind::Float),
            labels: labels.to_kind(Kind::Int64),
            masks: masks.map(|m| m.to_kind(Kind::Int64)),
        })
    }

    pub fn load(images: &Path, labels: &Path, masks: Option<&Path>) -> Result<Self> {
        let masks = masks.map(load_tensor).transpose()?;
        Self::new(load_tensor(images)?, load_tensor(labels)?, masks)
    }

    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of full batches; a trailing partial batch is dropped.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len() / batch_size
    }

    pub fn get_batch(&self, index: usize, batch_size: usize, device: Device) -> (Tensor, Tensor) {
        let start = (index * batch_size) as i64;
        let len = batch_size as i64;
        let images = self.images.narrow(0, start, len).to_device(device);
        let labels = self.labels.narrow(0, start, len).to_device(device);
        (images, labels)
    }

    pub fn label_vec(&self) -> Result<Vec<i64>> {
        Ok(Vec::<i64>::try_from(&self.labels.to_device(Device::Cpu))?)
    }

    pub fn concat(self, other: Split) -> Result<Split> {
        let masks = match (self.masks, other.masks) {
            (Some(a), Some(b)) => Some(Tensor::cat(&[a, b], 0)),
            (None, None) => None,
            _ => anyhow::bail!("cannot concatenate a split with masks and one without"),
        };
        Split::new(
            Tensor::cat(&[self.images, other.images], 0),
            Tensor::cat(&[self.labels, other.labels], 0),
            masks,
        )
    }

    /// Applies one random permutation to images, labels and masks.
    pub fn shuffle<R: Rng + ?Sized>(self, rng: &mut R) -> Split {
        let mut order: Vec<i64> = (0..self.len() as i64).collect();
        order.shuffle(rng);
        let index = Tensor::from_slice(&order).to_device(self.images.device());
        Split {
            images: self.images.index_select(0, &index),
            labels: self.labels.index_select(0, &index),
            masks: self.masks.map(|m| m.index_select(0, &index)),
        }
    }

    /// Replaces every image by its non-blank 64x64 tiles.
    pub fn tiled(self, batch_size: usize) -> Result<Split> {
        let masks = self
            .masks
            .context("sliding window needs masks for every image")?;
        let tiles = tiling::sliding_window(&self.images, &self.labels, &masks, batch_size)?;
        Ok(Split {
            images: tiles.images,
            labels: tiles.labels,
            masks: Some(tiles.masks),
        })
    }
}

/// Loads the train and validation splits, merging the augmented set and
/// tiling both when asked to.
pub fn load_splits(config: &TrainingConfig) -> Result<(Split, Split)> {
    let train_masks = config
        .needs_train_masks()
        .then_some(config.train_mask_path.as_path());
    let mut train = Split::load(
        &config.train_input_path,
        &config.train_label_path,
        train_masks,
    )?;
    let mut valid = Split::load(&config.val_input_path, &config.val_label_path, None)?;

    if config.use_augmentation {
        info!("using augmentation for under represented classes");
        let augmented = Split::load(
            &config.train_augmented_input_path,
            &config.train_augmented_label_path,
            Some(&config.train_augmented_mask_path),
        )?;
        let added = augmented.len();
        train = train.concat(augmented)?.shuffle(&mut rand::thread_rng());
        info!(added, "added augmented examples");
    }

    if config.use_sliding_window {
        let val_masks = load_tensor(&config.val_mask_path)?;
        valid = Split::new(valid.images, valid.labels, Some(val_masks))?;
        info!(shape = ?train.images.size(), "sliding windows: before procedure");
        train = train.tiled(config.sliding_batch_size())?;
        valid = valid.tiled(config.sliding_batch_size())?;
        info!(shape = ?train.images.size(), "sliding windows: after procedure");
    }

    Ok((train, valid))
}
