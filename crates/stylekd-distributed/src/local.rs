//! In-process reduction group.
//!
//! Each rank is a thread holding a [`LocalGroup`] handle; all handles share a
//! single accumulation buffer guarded by a mutex and a reusable barrier.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::{DistributedError, DistributedResult, ReduceBackend};

struct Shared {
    buffer: Mutex<Vec<f32>>,
    barrier: Barrier,
    world_size: usize,
}

/// One rank's handle on an in-process group.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.shared.world_size)
            .finish()
    }
}

impl LocalGroup {
    /// Create handles for every rank of a group of `world_size`.
    pub fn new(world_size: usize) -> DistributedResult<Vec<Self>> {
        if world_size == 0 {
            return Err(DistributedError::InvalidGroup(
                "world size must be at least 1".to_string(),
            ));
        }
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Vec::new()),
            barrier: Barrier::new(world_size),
            world_size,
        });
        Ok((0..world_size)
            .map(|rank| Self {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

impl ReduceBackend for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> DistributedResult<()> {
        let mut mismatch = None;
        {
            let mut acc = self.shared.buffer.lock();
            if acc.is_empty() {
                acc.resize(buffer.len(), 0.0);
            }
            if acc.len() == buffer.len() {
                acc.iter_mut().zip(buffer.iter()).for_each(|(a, b)| *a += b);
            } else {
                mismatch = Some(acc.len());
            }
        }

        // Every rank has contributed.
        self.shared.barrier.wait();
        if mismatch.is_none() {
            let acc = self.shared.buffer.lock();
            buffer.copy_from_slice(&acc);
        }

        // Every rank has read; the leader clears for the next collective.
        if self.shared.barrier.wait().is_leader() {
            self.shared.buffer.lock().clear();
        }
        self.shared.barrier.wait();

        match mismatch {
            Some(expected) => Err(DistributedError::IncoherentBuffer {
                rank: self.rank,
                expected,
                actual: buffer.len(),
            }),
            None => Ok(()),
        }
    }

    fn barrier(&self) -> DistributedResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}
