//! Data-parallel collectives for vlpo.
//!
//! Each worker owns a [`DistributedContext`] wrapping a [`DistributedBackend`]. The training
//! loop uses it to average per-step losses across workers, to synchronize around checkpoint
//! writes, and to decide which worker logs and saves.
//!
//! ```ignore
//! use vlpo_distributed::{DistributedContext, LocalBackend};
//!
//! let ctx = DistributedContext::new(Box::new(LocalBackend));
//! let mean = ctx.all_reduce_scalar_mean(loss).await?;
//! ```
//!
//! [`RuntimeConfig`] describes how a model is partitioned across the group.

#![warn(missing_docs)]

use async_trait::async_trait;

pub mod config;
pub mod error;
pub mod local;

pub use config::RuntimeConfig;
pub use error::{DistributedError, DistributedResult};
pub use local::{InProcessBackend, InProcessGroup, LocalBackend};

/// Interface for distributed operations.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Get the rank of this worker (0 to world_size - 1).
    fn rank(&self) -> usize;

    /// Get the total number of workers.
    fn world_size(&self) -> usize;

    /// Perform an all-reduce operation on a buffer of little-endian `f32` values (sum).
    ///
    /// On return the buffer holds the element-wise sum over all workers.
    async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()>;

    /// Barrier synchronization.
    async fn barrier(&self) -> DistributedResult<()>;
}

/// A handle to the distributed runtime.
pub struct DistributedContext {
    backend: Box<dyn DistributedBackend>,
}

impl DistributedContext {
    /// Create a new distributed context with the given backend.
    pub fn new(backend: Box<dyn DistributedBackend>) -> Self {
        Self { backend }
    }

    /// Context for a single worker.
    pub fn local() -> Self {
        Self::new(Box::new(LocalBackend))
    }

    /// Get the rank of this worker.
    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    /// Get the total number of workers.
    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Sum the buffer across workers.
    pub async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()> {
        let start = std::time::Instant::now();
        let result = self.backend.all_reduce(buffer).await;
        tracing::trace!(
            rank = self.rank(),
            bytes = buffer.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "all_reduce"
        );
        result
    }

    /// Average `values` element-wise across workers, in place.
    pub async fn all_reduce_mean_f32(&self, values: &mut [f32]) -> DistributedResult<()> {
        let mut bytes = f32_to_bytes(values);
        self.all_reduce(&mut bytes).await?;
        let world = self.world_size() as f32;
        for (dst, src) in values.iter_mut().zip(f32_from_bytes(&bytes)) {
            *dst = src / world;
        }
        Ok(())
    }

    /// Average one scalar across workers.
    pub async fn all_reduce_scalar_mean(&self, value: f32) -> DistributedResult<f32> {
        let mut values = [value];
        self.all_reduce_mean_f32(&mut values).await?;
        Ok(values[0])
    }

    /// Synchronize all workers at a barrier.
    ///
    /// All workers must call this method, and none will proceed until all have.
    pub async fn barrier(&self) -> DistributedResult<()> {
        self.backend.barrier().await
    }

    /// Whether this worker is rank 0.
    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

impl std::fmt::Debug for DistributedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedContext")
            .field("rank", &self.rank())
            .field("world_size", &self.world_size())
            .finish()
    }
}

pub(crate) fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{DistributedError, DistributedResult};
    pub use crate::local::{InProcessGroup, LocalBackend};
    pub use crate::{DistributedBackend, DistributedContext};
}
