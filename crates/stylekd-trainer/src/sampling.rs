//! Sample grids.

use std::path::Path;

use image::{Rgb, RgbImage};
use mlx_rs::Array;

use crate::{Result, TrainerError};

/// Grid columns for `n_sample` images: `floor(sqrt(n_sample))`, at least 1.
pub fn grid_nrow(n_sample: usize) -> usize {
    ((n_sample as f64).sqrt().floor() as usize).max(1)
}

/// Tile `[N, 3, H, W]` images in `[-1, 1]` into one RGB grid.
///
/// `nrow` images per row, `padding` black pixels around every tile. Values
/// are clamped to `[-1, 1]` and mapped to `[0, 255]`.
pub fn make_grid(images: &Array, nrow: usize, padding: usize) -> Result<RgbImage> {
    let shape = images.shape();
    if shape.len() != 4 || shape[1] != 3 {
        return Err(TrainerError::InvalidArgument(format!(
            "sample grid expects [N, 3, H, W], got {shape:?}"
        )));
    }
    let (n, h, w) = (shape[0] as usize, shape[2] as usize, shape[3] as usize);
    let images = images.as_dtype(mlx_rs::Dtype::Float32)?;
    images.eval()?;
    let data = images.as_slice::<f32>();

    let cols = nrow.clamp(1, n.max(1));
    let rows = n.div_ceil(cols);
    let cell_h = h + padding;
    let cell_w = w + padding;
    let mut grid = RgbImage::new((cols * cell_w + padding) as u32, (rows * cell_h + padding) as u32);

    let to_u8 = |v: f32| ((v.clamp(-1.0, 1.0) + 1.0) * 0.5 * 255.0 + 0.5).clamp(0.0, 255.0) as u8;
    for k in 0..n {
        let (row, col) = (k / cols, k % cols);
        let (y0, x0) = (row * cell_h + padding, col * cell_w + padding);
        let base = k * 3 * h * w;
        for y in 0..h {
            for x in 0..w {
                let at = |c: usize| data[base + c * h * w + y * w + x];
                grid.put_pixel(
                    (x0 + x) as u32,
                    (y0 + y) as u32,
                    Rgb([to_u8(at(0)), to_u8(at(1)), to_u8(at(2))]),
                );
            }
        }
    }
    Ok(grid)
}

/// Write `images` as a PNG grid with `nrow = floor(sqrt(N))` and 2-pixel padding.
pub fn save_sample_grid(images: &Array, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let grid = make_grid(images, grid_nrow(images.dim(0) as usize), 2)?;
    grid.save(path)?;
    tracing::debug!(path = %path.display(), "wrote sample grid");
    Ok(())
}
