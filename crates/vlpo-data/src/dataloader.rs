//! DataLoader producing collated preference batches for one worker.

use vlpo_core::Result;

use crate::collator::{PreferenceBatch, PreferenceCollator};
use crate::context::WorkerContext;
use crate::dataset::PreferenceDataset;
use crate::sampler::DistributedSampler;

/// Yields padded batches of `batch_size` dataset items from this worker's shard.
pub struct PreferenceDataLoader {
    dataset: Box<dyn PreferenceDataset>,
    collator: PreferenceCollator,
    sampler: DistributedSampler,
    batch_size: usize,
    indices: Vec<usize>,
    position: usize,
}

impl PreferenceDataLoader {
    /// Create a loader; the first epoch is 0.
    pub fn new(
        dataset: Box<dyn PreferenceDataset>,
        collator: PreferenceCollator,
        sampler: DistributedSampler,
        batch_size: usize,
    ) -> Self {
        let indices = sampler.indices(0);
        Self {
            dataset,
            collator,
            sampler,
            batch_size: batch_size.max(1),
            indices,
            position: 0,
        }
    }

    /// Reshuffle for `epoch` and rewind.
    pub fn set_epoch(&mut self, epoch: usize) {
        self.indices = self.sampler.indices(epoch);
        self.position = 0;
    }

    /// Batches per epoch on this worker.
    pub fn num_batches(&self) -> usize {
        self.sampler.num_samples().div_ceil(self.batch_size)
    }

    /// Dataset items per epoch on this worker.
    pub fn len(&self) -> usize {
        self.sampler.num_samples()
    }

    /// Check if the loader is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidates per dataset item.
    pub fn group_size(&self) -> usize {
        self.collator.group_size()
    }

    /// Build the next batch, or `None` at the end of the epoch.
    pub fn next_batch(&mut self, ctx: &mut WorkerContext) -> Result<Option<PreferenceBatch>> {
        if self.position >= self.indices.len() {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let items = self.indices[self.position..end]
            .iter()
            .map(|&i| self.dataset.get(i, ctx))
            .collect::<Result<Vec<_>>>()?;
        self.position = end;

        let batch = self.collator.collate(items)?;
        tracing::debug!(
            "rank {}: batch of {} rows, seq_len {}, {} images",
            ctx.rank,
            batch.num_rows(),
            batch.seq_len,
            batch.total_images()
        );
        Ok(Some(batch))
    }
}
