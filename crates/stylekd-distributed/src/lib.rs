//! Data-parallel reduction for StyleKD training.
//!
//! Every process runs the same iteration index; after each backward pass the
//! gradients are averaged across processes, and per-iteration metrics are
//! reduced before being displayed on rank 0.
//!
//! The collective itself sits behind [`ReduceBackend`]:
//!
//! - [`SingleProcess`]: identity reduction for a world of one
//! - [`LocalGroup`]: in-process thread group sharing one buffer
//!
//! [`DistributedContext`] lifts the raw `f32` collective to MLX arrays,
//! loss dictionaries and gradient maps.
//!
//! ```ignore
//! use stylekd_distributed::{DistributedContext, SingleProcess};
//!
//! let ctx = DistributedContext::new(Box::new(SingleProcess));
//! let reduced = ctx.reduce_loss_dict(&loss_dict)?;
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod local;

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use mlx_rs::{module::FlattenedModuleParam, Array, Dtype};

pub use error::{DistributedError, DistributedResult};
pub use local::LocalGroup;

/// Per-iteration metric name to scalar array.
pub type LossDict = BTreeMap<String, Array>;

/// Interface for synchronous collective operations.
pub trait ReduceBackend: Send + Sync {
    /// Rank of this process (0 to world_size - 1).
    fn rank(&self) -> usize;

    /// Total number of processes.
    fn world_size(&self) -> usize;

    /// Element-wise sum of `buffer` across all processes, in place.
    ///
    /// Every rank must call this with a buffer of the same length.
    fn all_reduce_sum(&self, buffer: &mut [f32]) -> DistributedResult<()>;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> DistributedResult<()>;
}

/// Identity backend for single-process training.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ReduceBackend for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buffer: &mut [f32]) -> DistributedResult<()> {
        Ok(())
    }

    fn barrier(&self) -> DistributedResult<()> {
        Ok(())
    }
}

/// A handle to the reduction runtime.
pub struct DistributedContext {
    backend: Box<dyn ReduceBackend>,
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::new(Box::new(SingleProcess))
    }
}

impl DistributedContext {
    /// Create a new context with the given backend.
    pub fn new(backend: Box<dyn ReduceBackend>) -> Self {
        Self { backend }
    }

    /// Rank of this process.
    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    /// Total number of processes.
    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Whether this process performs periodic I/O.
    pub fn is_main(&self) -> bool {
        self.rank() == 0
    }

    /// Synchronize all processes.
    pub fn barrier(&self) -> DistributedResult<()> {
        self.backend.barrier()
    }

    /// Sum an array across processes. Identity for a world of one.
    pub fn reduce_sum(&self, value: &Array) -> DistributedResult<Array> {
        if self.world_size() == 1 {
            return Ok(value.clone());
        }
        let mut host = to_host(value)?;
        self.backend.all_reduce_sum(&mut host)?;
        Ok(Array::from_slice(&host, value.shape()))
    }

    /// Sum a scalar across processes and divide by the world size.
    pub fn reduce_mean_scalar(&self, value: f32) -> DistributedResult<f32> {
        let mut buffer = [value];
        self.backend.all_reduce_sum(&mut buffer)?;
        Ok(buffer[0] / self.world_size() as f32)
    }

    /// Reduce a loss dictionary to host scalars averaged over processes.
    ///
    /// Keys are reduced in sorted order so every rank packs the same layout.
    pub fn reduce_loss_dict(&self, losses: &LossDict) -> DistributedResult<BTreeMap<String, f32>> {
        let mut packed = Vec::with_capacity(losses.len());
        for value in losses.values() {
            let scalar = value.as_dtype(Dtype::Float32)?;
            scalar.eval()?;
            packed.push(scalar.item::<f32>());
        }

        if self.world_size() > 1 {
            self.backend.all_reduce_sum(&mut packed)?;
            let world = self.world_size() as f32;
            packed.iter_mut().for_each(|v| *v /= world);
        }

        Ok(losses.keys().cloned().zip(packed).collect())
    }

    /// Average gradients across processes before an optimizer step.
    pub fn average_gradients(
        &self,
        grads: FlattenedModuleParam,
    ) -> DistributedResult<FlattenedModuleParam> {
        if self.world_size() == 1 {
            return Ok(grads);
        }

        let mut keys: Vec<Rc<str>> = grads.keys().cloned().collect();
        keys.sort();

        let mut host = Vec::new();
        let mut layout = Vec::with_capacity(keys.len());
        for key in &keys {
            let grad = &grads[key];
            let values = to_host(grad)?;
            layout.push((key.clone(), grad.shape().to_vec(), values.len()));
            host.extend(values);
        }

        self.backend.all_reduce_sum(&mut host)?;
        let world = self.world_size() as f32;

        let mut averaged = HashMap::with_capacity(keys.len());
        let mut offset = 0;
        for (key, shape, len) in layout {
            let chunk: Vec<f32> = host[offset..offset + len].iter().map(|v| v / world).collect();
            averaged.insert(key, Array::from_slice(&chunk, &shape));
            offset += len;
        }
        tracing::trace!(params = averaged.len(), "averaged gradients");
        Ok(averaged)
    }
}

fn to_host(value: &Array) -> DistributedResult<Vec<f32>> {
    let value = value.as_dtype(Dtype::Float32)?;
    value.eval()?;
    Ok(value.as_slice::<f32>().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_identity() {
        let ctx = DistributedContext::default();
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.world_size(), 1);
        assert!(ctx.is_main());

        let value = Array::from_slice(&[1.0f32, 2.0, 3.0], &[3]);
        let reduced = ctx.reduce_sum(&value).unwrap();
        assert_eq!(reduced.as_slice::<f32>(), &[1.0, 2.0, 3.0]);
        assert_eq!(ctx.reduce_mean_scalar(4.5).unwrap(), 4.5);
    }

    #[test]
    fn test_reduce_loss_dict_single_process() {
        let ctx = DistributedContext::default();
        let mut losses = LossDict::new();
        losses.insert("g".to_string(), Array::from_f32(0.25));
        losses.insert("d".to_string(), Array::from_f32(1.5));

        let reduced = ctx.reduce_loss_dict(&losses).unwrap();
        let keys: Vec<&str> = reduced.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["d", "g"]);
        assert!((reduced["d"] - 1.5).abs() < 1e-6);
        assert!((reduced["g"] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_average_gradients_single_process_passthrough() {
        let ctx = DistributedContext::default();
        let mut grads: FlattenedModuleParam = HashMap::new();
        grads.insert(Rc::from("w"), Array::from_slice(&[2.0f32, 4.0], &[2]));
        let out = ctx.average_gradients(grads).unwrap();
        assert_eq!(out.get("w").unwrap().as_slice::<f32>(), &[2.0, 4.0]);
    }
}
