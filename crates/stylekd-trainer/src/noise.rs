//! Latent noise sampling with optional style mixing.

use mlx_rs::{random, Array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::Result;

/// Draws `[batch, latent_dim]` latent batches.
///
/// The mixing coin comes from a host `StdRng`; the latents themselves come
/// from the global tensor RNG.
#[derive(Debug, Clone)]
pub struct NoiseSampler {
    latent_dim: usize,
    rng: StdRng,
}

impl NoiseSampler {
    /// Create a sampler whose mixing coin is seeded with `seed`.
    pub fn new(latent_dim: usize, seed: u64) -> Self {
        Self {
            latent_dim,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Reseed the mixing coin.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Latent dimension.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Two independent batches with probability `mix_prob`, otherwise one.
    ///
    /// A non-positive `mix_prob` never flips the coin.
    pub fn sample(&mut self, batch: usize, mix_prob: f32) -> Result<Vec<Array>> {
        let n_noise = if mix_prob > 0.0 && self.rng.gen::<f32>() < mix_prob {
            2
        } else {
            1
        };
        make_noise(batch, self.latent_dim, n_noise)
    }
}

/// `n_noise` independent standard normal `[batch, latent_dim]` batches.
pub fn make_noise(batch: usize, latent_dim: usize, n_noise: usize) -> Result<Vec<Array>> {
    let shape = [batch as i32, latent_dim as i32];
    (0..n_noise)
        .map(|_| Ok(random::normal::<f32>(&shape, None, None, None)?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_mixing_yields_one_batch() {
        let mut sampler = NoiseSampler::new(8, 0);
        for _ in 0..20 {
            let noise = sampler.sample(3, 0.0).unwrap();
            assert_eq!(noise.len(), 1);
            assert_eq!(noise[0].shape(), &[3, 8]);
        }
    }

    #[test]
    fn test_certain_mixing_yields_two_batches() {
        let mut sampler = NoiseSampler::new(4, 0);
        let noise = sampler.sample(2, 1.0).unwrap();
        assert_eq!(noise.len(), 2);
        assert_eq!(noise[1].shape(), &[2, 4]);
    }

    #[test]
    fn test_coin_is_seeded() {
        let counts = |seed| {
            let mut sampler = NoiseSampler::new(2, seed);
            (0..32)
                .map(|_| sampler.sample(1, 0.5).unwrap().len())
                .collect::<Vec<_>>()
        };
        assert_eq!(counts(5), counts(5));
    }
}
