//! Image datasets.

use std::path::{Path, PathBuf};

use image::{imageops::FilterType, DynamicImage};

use crate::{DataError, Result};

/// Random-access source of square RGB images.
pub trait ImageDataset: Send {
    /// Number of images.
    fn len(&self) -> usize;

    /// Whether the dataset holds no images.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Side length of every image.
    fn resolution(&self) -> usize;

    /// Image `index` as CHW `f32` values in `[-1, 1]`.
    fn get(&self, index: usize) -> Result<Vec<f32>>;
}

/// Convert an image to CHW floats in `[-1, 1]` at `size x size`.
pub fn image_to_chw(img: &DynamicImage, size: u32) -> Vec<f32> {
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();
    let num_pixels = (size * size) as usize;
    let pixels = rgb.as_raw();
    let mut data = Vec::with_capacity(3 * num_pixels);
    for c in 0..3 {
        data.extend((0..num_pixels).map(|i| pixels[i * 3 + c] as f32 / 127.5 - 1.0));
    }
    data
}

/// Every PNG or JPEG file below a root directory, in sorted path order.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    root: PathBuf,
    files: Vec<PathBuf>,
    resolution: usize,
}

impl ImageFolderDataset {
    /// Index `root` recursively. Images are resized to `resolution` on read.
    pub fn new(root: impl AsRef<Path>, resolution: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut files = Vec::new();
        collect_images(&root, &mut files)?;
        files.sort();
        if files.is_empty() {
            return Err(DataError::Empty(format!(
                "no PNG or JPEG images under {}",
                root.display()
            )));
        }
        tracing::info!(root = %root.display(), images = files.len(), resolution, "indexed image folder");
        Ok(Self {
            root,
            files,
            resolution,
        })
    }

    /// Dataset root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
            .unwrap_or(false);
        if is_image {
            out.push(path);
        }
    }
    Ok(())
}

impl ImageDataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn get(&self, index: usize) -> Result<Vec<f32>> {
        let path = self.files.get(index).ok_or(DataError::OutOfRange {
            index,
            len: self.files.len(),
        })?;
        let img = image::open(path)?;
        Ok(image_to_chw(&img, self.resolution as u32))
    }
}

/// Images held in memory as CHW `f32` buffers.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    images: Vec<Vec<f32>>,
    resolution: usize,
}

impl TensorDataset {
    /// Wrap CHW buffers of `3 * resolution²` values each.
    pub fn new(images: Vec<Vec<f32>>, resolution: usize) -> Result<Self> {
        let expected = 3 * resolution * resolution;
        if let Some(bad) = images.iter().position(|img| img.len() != expected) {
            return Err(DataError::Empty(format!(
                "image {bad} has {} values, expected {expected}",
                images[bad].len()
            )));
        }
        Ok(Self { images, resolution })
    }
}

impl ImageDataset for TensorDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn resolution(&self) -> usize {
        self.resolution
    }

    fn get(&self, index: usize) -> Result<Vec<f32>> {
        self.images.get(index).cloned().ok_or(DataError::OutOfRange {
            index,
            len: self.images.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_to_chw_range() {
        let img = image::RgbImage::from_fn(4, 4, |_x, _y| image::Rgb([255u8, 0, 128]));
        let data = image_to_chw(&DynamicImage::ImageRgb8(img), 2);
        assert_eq!(data.len(), 12);
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert!((data[4] + 1.0).abs() < 1e-6);
        assert!((data[8] - (128.0 / 127.5 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_folder_dataset_recurses_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let img = image::RgbImage::from_fn(8, 8, |x, _y| image::Rgb([(x * 30) as u8, 0, 0]));
        img.save(dir.path().join("0.png")).unwrap();
        img.save(nested.join("1.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let ds = ImageFolderDataset::new(dir.path(), 4).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1).unwrap().len(), 3 * 16);
        assert!(matches!(ds.get(2), Err(DataError::OutOfRange { .. })));
    }

    #[test]
    fn test_empty_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageFolderDataset::new(dir.path(), 4).is_err());
    }

    #[test]
    fn test_tensor_dataset_validates_length() {
        assert!(TensorDataset::new(vec![vec![0.0; 12]], 2).is_ok());
        assert!(TensorDataset::new(vec![vec![0.0; 11]], 2).is_err());
    }
}
