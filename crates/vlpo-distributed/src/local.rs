//! In-process backends.
//!
//! [`LocalBackend`] is the single-worker case. [`InProcessGroup`] runs several ranks as tasks
//! of one process and reduces through shared memory, which is how multi-rank behaviour is
//! exercised without a cluster.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::error::{DistributedError, DistributedResult};
use crate::{f32_from_bytes, f32_to_bytes, DistributedBackend};

/// Backend for a single worker; collectives are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

#[async_trait]
impl DistributedBackend for LocalBackend {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()> {
        check_f32_buffer(buffer)
    }

    async fn barrier(&self) -> DistributedResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Accumulator {
    sum: Vec<f32>,
    contributors: usize,
    mismatch: Option<(usize, usize)>,
}

struct GroupState {
    world_size: usize,
    barrier: Barrier,
    accum: Mutex<Accumulator>,
}

/// Factory for the ranks of one in-process group.
pub struct InProcessGroup;

impl InProcessGroup {
    /// Create backends for ranks `0..world_size`.
    pub fn new(world_size: usize) -> DistributedResult<Vec<InProcessBackend>> {
        if world_size == 0 {
            return Err(DistributedError::Config("world size must be positive".into()));
        }
        let state = Arc::new(GroupState {
            world_size,
            barrier: Barrier::new(world_size),
            accum: Mutex::new(Accumulator::default()),
        });
        Ok((0..world_size)
            .map(|rank| InProcessBackend {
                rank,
                state: state.clone(),
            })
            .collect())
    }
}

/// One rank of an [`InProcessGroup`].
pub struct InProcessBackend {
    rank: usize,
    state: Arc<GroupState>,
}

#[async_trait]
impl DistributedBackend for InProcessBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.state.world_size
    }

    async fn all_reduce(&self, buffer: &mut [u8]) -> DistributedResult<()> {
        check_f32_buffer(buffer)?;
        let local = f32_from_bytes(buffer);

        // previous reduction fully read
        self.state.barrier.wait().await;
        {
            let mut acc = self.state.accum.lock();
            if acc.contributors == 0 {
                acc.sum = vec![0.0; local.len()];
            }
            if acc.sum.len() == local.len() {
                for (s, v) in acc.sum.iter_mut().zip(&local) {
                    *s += v;
                }
            } else {
                acc.mismatch = Some((local.len(), acc.sum.len()));
            }
            acc.contributors += 1;
        }

        self.state.barrier.wait().await;
        let outcome = {
            let acc = self.state.accum.lock();
            match acc.mismatch {
                Some((local, expected)) => {
                    Err(DistributedError::AllReduceParamsMismatch { local, expected })
                }
                None => {
                    buffer.copy_from_slice(&f32_to_bytes(&acc.sum));
                    Ok(())
                }
            }
        };

        if self.state.barrier.wait().await.is_leader() {
            *self.state.accum.lock() = Accumulator::default();
        }
        outcome
    }

    async fn barrier(&self) -> DistributedResult<()> {
        self.state.barrier.wait().await;
        Ok(())
    }
}

fn check_f32_buffer(buffer: &[u8]) -> DistributedResult<()> {
    let size = std::mem::size_of::<f32>();
    if buffer.len() % size != 0 {
        return Err(DistributedError::BufferSize {
            expected: size,
            actual: buffer.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistributedContext;

    #[tokio::test]
    async fn test_local_backend_is_identity() {
        let ctx = DistributedContext::new(Box::new(LocalBackend));
        let mut values = [1.5f32, -2.0];
        ctx.all_reduce_mean_f32(&mut values).await.unwrap();
        assert_eq!(values, [1.5, -2.0]);
        assert!(ctx.is_master());
    }

    #[tokio::test]
    async fn test_bad_buffer_size() {
        let mut bytes = [0u8; 3];
        assert!(matches!(
            LocalBackend.all_reduce(&mut bytes).await,
            Err(DistributedError::BufferSize { .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_in_process_mean_across_ranks() {
        let backends = InProcessGroup::new(4).unwrap();
        let handles: Vec<_> = backends
            .into_iter()
            .map(|backend| {
                tokio::spawn(async move {
                    let ctx = DistributedContext::new(Box::new(backend));
                    let mut results = Vec::new();
                    // repeated rounds reuse the shared accumulator
                    for round in 0..3 {
                        let v = (ctx.rank() + round) as f32;
                        results.push(ctx.all_reduce_scalar_mean(v).await.unwrap());
                    }
                    ctx.barrier().await.unwrap();
                    results
                })
            })
            .collect();

        for handle in handles {
            let results = handle.await.unwrap();
            assert_eq!(results, vec![1.5, 2.5, 3.5]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_process_length_mismatch() {
        let mut backends = InProcessGroup::new(2).unwrap();
        let b1 = backends.pop().unwrap();
        let b0 = backends.pop().unwrap();
        let h0 = tokio::spawn(async move {
            let mut buf = f32_to_bytes(&[1.0]);
            b0.all_reduce(&mut buf).await
        });
        let h1 = tokio::spawn(async move {
            let mut buf = f32_to_bytes(&[1.0, 2.0]);
            b1.all_reduce(&mut buf).await
        });
        let r0 = h0.await.unwrap();
        let r1 = h1.await.unwrap();
        assert!(r0.is_err() && r1.is_err());
    }
}
