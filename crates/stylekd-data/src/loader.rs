//! Batch loaders.

use mlx_rs::Array;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::{DataError, ImageDataset, Result};

/// Configuration for [`ImageLoader`].
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Batch size.
    pub batch_size: usize,
    /// Shuffle sample order each pass.
    pub shuffle: bool,
    /// Random seed for shuffling and flips.
    pub seed: u64,
    /// Drop the last incomplete batch.
    pub drop_last: bool,
    /// Flip each sample horizontally with probability 0.5.
    pub hflip: bool,
    /// Index of this process among `world_size` readers.
    pub rank: usize,
    /// Number of processes sharing the dataset. Each pass is shuffled with
    /// the same seed on every rank and rank `r` keeps positions
    /// `r, r + world_size, ...`, so shards are disjoint.
    pub world_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            shuffle: true,
            seed: 42,
            drop_last: true,
            hflip: true,
            rank: 0,
            world_size: 1,
        }
    }
}

/// Loader yielding `[B, 3, H, W]` batches for one pass over a dataset.
pub struct ImageLoader {
    dataset: Box<dyn ImageDataset>,
    config: LoaderConfig,
    indices: Vec<usize>,
    position: usize,
    rng: StdRng,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("len", &self.dataset.len())
            .field("config", &self.config)
            .field("position", &self.position)
            .finish()
    }
}

impl ImageLoader {
    /// Create a loader positioned at the start of a pass.
    pub fn new(dataset: Box<dyn ImageDataset>, config: LoaderConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let indices = shard_order(dataset.len(), &config, &mut rng);
        Self {
            dataset,
            config,
            indices,
            position: 0,
            rng,
        }
    }

    /// Start a new pass, reshuffling with `new_seed` (or the configured seed).
    pub fn reset(&mut self, new_seed: Option<u64>) {
        self.position = 0;
        self.rng = StdRng::seed_from_u64(new_seed.unwrap_or(self.config.seed));
        self.indices = shard_order(self.dataset.len(), &self.config, &mut self.rng);
    }

    /// Number of batches per pass over this rank's shard.
    pub fn num_batches(&self) -> usize {
        let n = self.indices.len();
        if self.config.drop_last {
            n / self.config.batch_size
        } else {
            n.div_ceil(self.config.batch_size)
        }
    }

    /// Image side length.
    pub fn resolution(&self) -> usize {
        self.dataset.resolution()
    }

    /// Next batch of the current pass, or `None` once it is exhausted.
    pub fn next_batch(&mut self) -> Result<Option<Array>> {
        if self.position >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.position + self.config.batch_size).min(self.indices.len());
        if self.config.drop_last && end - self.position < self.config.batch_size {
            return Ok(None);
        }

        let res = self.dataset.resolution();
        let batch = end - self.position;
        let mut data = Vec::with_capacity(batch * 3 * res * res);
        for k in self.position..end {
            let mut image = self.dataset.get(self.indices[k])?;
            if self.config.hflip && self.rng.gen_bool(0.5) {
                flip_chw(&mut image, res);
            }
            data.extend(image);
        }
        self.position = end;

        Ok(Some(Array::from_slice(
            &data,
            &[batch as i32, 3, res as i32, res as i32],
        )))
    }
}

/// This rank's slice of one (optionally shuffled) pass.
fn shard_order(len: usize, config: &LoaderConfig, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if config.shuffle {
        order.shuffle(rng);
    }
    let world_size = config.world_size.max(1);
    order
        .into_iter()
        .enumerate()
        .filter(|(pos, _)| pos % world_size == config.rank)
        .map(|(_, index)| index)
        .collect()
}

fn flip_chw(image: &mut [f32], res: usize) {
    for row in image.chunks_mut(res) {
        row.reverse();
    }
}

/// Endless stream of batches, reshuffling with a fresh seed every pass.
#[derive(Debug)]
pub struct InfiniteLoader {
    inner: ImageLoader,
    epoch: u64,
}

impl InfiniteLoader {
    /// Wrap a loader; fails if it cannot produce a single batch.
    pub fn new(inner: ImageLoader) -> Result<Self> {
        if inner.num_batches() == 0 {
            return Err(DataError::Empty(format!(
                "{} images ({} on rank {} of {}) cannot fill a batch of {}",
                inner.dataset.len(),
                inner.indices.len(),
                inner.config.rank,
                inner.config.world_size,
                inner.config.batch_size
            )));
        }
        Ok(Self { inner, epoch: 0 })
    }

    /// Completed passes.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Next batch, starting a new pass when the current one is exhausted.
    pub fn next_batch(&mut self) -> Result<Array> {
        if let Some(batch) = self.inner.next_batch()? {
            return Ok(batch);
        }
        self.epoch += 1;
        let seed = self.inner.config.seed.wrapping_add(self.epoch);
        tracing::debug!(epoch = self.epoch, seed, "restarting data pass");
        self.inner.reset(Some(seed));
        self.inner
            .next_batch()?
            .ok_or_else(|| DataError::Empty("loader produced no batch after reset".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TensorDataset;

    fn dataset(n: usize) -> Box<dyn ImageDataset> {
        // Image i is filled with the value i.
        let images = (0..n).map(|i| vec![i as f32; 3 * 2 * 2]).collect();
        Box::new(TensorDataset::new(images, 2).unwrap())
    }

    fn first_values(batch: &Array) -> Vec<f32> {
        let b = batch.dim(0) as usize;
        let values: Vec<f32> = batch.as_slice().to_vec();
        (0..b).map(|i| values[i * 12]).collect()
    }

    #[test]
    fn test_drop_last() {
        let config = LoaderConfig {
            batch_size: 3,
            shuffle: false,
            hflip: false,
            ..Default::default()
        };
        let mut loader = ImageLoader::new(dataset(7), config);
        assert_eq!(loader.num_batches(), 2);
        let first = loader.next_batch().unwrap().unwrap();
        assert_eq!(first.shape(), &[3, 3, 2, 2]);
        assert_eq!(first_values(&first), vec![0.0, 1.0, 2.0]);
        assert!(loader.next_batch().unwrap().is_some());
        assert!(loader.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_keep_last() {
        let config = LoaderConfig {
            batch_size: 3,
            shuffle: false,
            drop_last: false,
            hflip: false,
            ..Default::default()
        };
        let mut loader = ImageLoader::new(dataset(7), config);
        assert_eq!(loader.num_batches(), 3);
        loader.next_batch().unwrap();
        loader.next_batch().unwrap();
        let last = loader.next_batch().unwrap().unwrap();
        assert_eq!(last.dim(0), 1);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let config = LoaderConfig {
            batch_size: 8,
            seed: 7,
            hflip: false,
            ..Default::default()
        };
        let a = ImageLoader::new(dataset(8), config.clone()).next_batch().unwrap().unwrap();
        let b = ImageLoader::new(dataset(8), config).next_batch().unwrap().unwrap();
        assert_eq!(first_values(&a), first_values(&b));
        let mut sorted = first_values(&a);
        sorted.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(sorted, (0..8).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_infinite_loader_cycles() {
        let config = LoaderConfig {
            batch_size: 2,
            ..Default::default()
        };
        let mut loader = InfiniteLoader::new(ImageLoader::new(dataset(4), config)).unwrap();
        for _ in 0..5 {
            assert_eq!(loader.next_batch().unwrap().shape(), &[2, 3, 2, 2]);
        }
        assert_eq!(loader.epoch(), 2);
    }

    #[test]
    fn test_infinite_loader_rejects_small_dataset() {
        let config = LoaderConfig {
            batch_size: 8,
            ..Default::default()
        };
        assert!(InfiniteLoader::new(ImageLoader::new(dataset(3), config)).is_err());
    }

    #[test]
    fn test_ranks_read_disjoint_shards() {
        let shard = |rank| LoaderConfig {
            batch_size: 5,
            seed: 3,
            hflip: false,
            rank,
            world_size: 2,
            ..Default::default()
        };
        let mut seen = Vec::new();
        for rank in 0..2 {
            let mut loader = ImageLoader::new(dataset(10), shard(rank));
            assert_eq!(loader.num_batches(), 1);
            seen.extend(first_values(&loader.next_batch().unwrap().unwrap()));
            assert!(loader.next_batch().unwrap().is_none());
        }
        seen.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());

        // Every pass reshuffles, and the shards stay disjoint.
        let mut seen = Vec::new();
        for rank in 0..2 {
            let mut loader = ImageLoader::new(dataset(10), shard(rank));
            loader.reset(Some(99));
            seen.extend(first_values(&loader.next_batch().unwrap().unwrap()));
        }
        seen.sort_by(|x, y| x.partial_cmp(y).unwrap());
        assert_eq!(seen, (0..10).map(|i| i as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_rank_outside_world_has_no_data() {
        let config = LoaderConfig {
            batch_size: 1,
            rank: 2,
            world_size: 2,
            ..Default::default()
        };
        assert!(InfiniteLoader::new(ImageLoader::new(dataset(4), config)).is_err());
    }

    #[test]
    fn test_flip_reverses_rows() {
        let mut image: Vec<f32> = (0..12).map(|v| v as f32).collect();
        flip_chw(&mut image, 2);
        assert_eq!(&image[..4], &[1.0, 0.0, 3.0, 2.0]);
    }
}
