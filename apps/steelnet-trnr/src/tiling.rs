//! Sliding-window tiling of full-resolution images into 64x64 tiles.
//!
//! Every source image yields a 2x3 grid of windows, emitted row-major. Row
//! and column origins are spread evenly so the outer windows sit flush with
//! the image borders; a 128x192 image is cut into its six disjoint tiles.
//! Labels are repeated per tile and masks are cut like their images.

use anyhow::{ensure, Context, Result};
use tch::{Kind, Tensor};
use tracing::debug;

pub const TILE_SIZE: i64 = 64;
pub const TILE_ROWS: i64 = 2;
pub const TILE_COLS: i64 = 3;
pub const TILES_PER_IMAGE: i64 = TILE_ROWS * TILE_COLS;

/// Tiles whose mean (on standardized pixels) is at or below this are blank.
pub const BLANK_THRESHOLD: f64 = -1.80;

/// Index-aligned tile batch: `[K, 3, 64, 64]` images, `[K]` labels and
/// `[K, 64, 64]` masks.
#[derive(Debug)]
pub struct Tiles {
    pub images: Tensor,
    pub labels: Tensor,
    pub masks: Tensor,
}

impl Tiles {
    pub fn len(&self) -> i64 {
        self.labels.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `count` window origins of width `size` spread over `[0, extent - size]`.
pub fn window_origins(extent: i64, count: i64, size: i64) -> Result<Vec<i64>> {
    ensure!(count > 0, "window count must be positive");
    ensure!(
        extent >= size,
        "image extent {extent} is smaller than the {size}px window"
    );
    if count == 1 {
        return Ok(vec![(extent - size) / 2]);
    }
    let span = extent - size;
    Ok((0..count).map(|i| i * span / (count - 1)).collect())
}

/// Cuts the trailing two dims of `xs` into windows and flattens them into the
/// leading dim: `[B, .., H, W]` becomes `[B * rows * cols, .., 64, 64]`.
fn cut_windows(xs: &Tensor, rows: &[i64], cols: &[i64]) -> Tensor {
    let dims = xs.dim() as i64;
    let mut windows = Vec::with_capacity(rows.len() * cols.len());
    for &top in rows {
        for &left in cols {
            windows.push(
                xs.narrow(dims - 2, top, TILE_SIZE)
                    .narrow(dims - 1, left, TILE_SIZE),
            );
        }
    }
    let stacked = Tensor::stack(&windows, 1);
    let mut shape = stacked.size();
    let leading = shape[0] * shape[1];
    shape.splice(0..2, [leading]);
    stacked.reshape(shape.as_slice())
}

/// Tiles every image without filtering; the output holds exactly
/// `6 * N` entries. Work is done `batch_size` source images at a time and
/// written into a preallocated buffer.
pub fn tile_all(
    images: &Tensor,
    labels: &Tensor,
    masks: &Tensor,
    batch_size: usize,
) -> Result<Tiles> {
    ensure!(batch_size > 0, "sliding window batch size must be positive");
    let (n, channels, height, width) = images
        .size4()
        .context("images must be a [N, C, H, W] batch")?;
    let label_n = labels.size1().context("labels must be a [N] vector")?;
    let (mask_n, mask_h, mask_w) = masks.size3().context("masks must be a [N, H, W] batch")?;
    ensure!(
        n == label_n && n == mask_n,
        "batch sizes differ: {n} images, {label_n} labels, {mask_n} masks"
    );
    ensure!(
        (mask_h, mask_w) == (height, width),
        "mask size {mask_h}x{mask_w} does not match image size {height}x{width}"
    );

    let rows = window_origins(height, TILE_ROWS, TILE_SIZE)?;
    let cols = window_origins(width, TILE_COLS, TILE_SIZE)?;
    let device = images.device();
    let total = n * TILES_PER_IMAGE;

    let out_images = Tensor::empty([total, channels, TILE_SIZE, TILE_SIZE], (Kind::Float, device));
    let out_labels = Tensor::empty([total], (Kind::Int64, device));
    let out_masks = Tensor::empty([total, TILE_SIZE, TILE_SIZE], (Kind::Int64, device));

    let step = batch_size as i64;
    let mut start = 0;
    while start < n {
        let bs = step.min(n - start);
        let offset = start * TILES_PER_IMAGE;
        let len = bs * TILES_PER_IMAGE;

        let x = cut_windows(&images.narrow(0, start, bs), &rows, &cols);
        let y = labels
            .narrow(0, start, bs)
            .unsqueeze(1)
            .expand([bs, TILES_PER_IMAGE], false)
            .reshape([len]);
        let m = cut_windows(&masks.narrow(0, start, bs), &rows, &cols);

        out_images.narrow(0, offset, len).copy_(&x);
        out_labels.narrow(0, offset, len).copy_(&y);
        out_masks.narrow(0, offset, len).copy_(&m);
        start += bs;
    }

    Ok(Tiles {
        images: out_images,
        labels: out_labels,
        masks: out_masks,
    })
}

/// Keeps tiles whose mean exceeds `threshold`. The same index set is applied
/// to images, labels and masks and the surviving order is preserved.
pub fn drop_blank_tiles(tiles: Tiles, threshold: f64) -> Tiles {
    if tiles.is_empty() {
        return tiles;
    }
    let means = tiles
        .images
        .mean_dim(Some([1i64, 2, 3].as_slice()), false, Kind::Float);
    let keep = means.gt(threshold).nonzero().view([-1]);
    debug!(
        kept = keep.size()[0],
        total = tiles.len(),
        "dropped blank tiles"
    );
    Tiles {
        images: tiles.images.index_select(0, &keep),
        labels: tiles.labels.index_select(0, &keep),
        masks: tiles.masks.index_select(0, &keep),
    }
}

/// Tiles the batch and discards near-blank tiles.
pub fn sliding_window(
    images: &Tensor,
    labels: &Tensor,
    masks: &Tensor,
    batch_size: usize,
) -> Result<Tiles> {
    let tiles = tile_all(images, labels, masks, batch_size)?;
    Ok(drop_blank_tiles(tiles, BLANK_THRESHOLD))
}
