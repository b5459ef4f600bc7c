//! Per-worker sampling of dataset indices.

use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Splits dataset indices into disjoint per-rank shards.
///
/// Shuffling is seeded with `seed + epoch`, so every rank derives the same permutation and
/// takes every `world_size`-th index starting at its rank. The tail that does not divide
/// evenly is dropped by default, so no two ranks see the same item in an epoch. With
/// `drop_last` off the permutation is padded by wrapping around instead, and the wrapped
/// items repeat on another rank.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
    drop_last: bool,
}

impl DistributedSampler {
    /// Sampler over `len` items for `rank` of `world_size`.
    pub fn new(len: usize, rank: usize, world_size: usize, seed: u64) -> Self {
        Self {
            len,
            rank,
            world_size: world_size.max(1),
            seed,
            shuffle: true,
            drop_last: true,
        }
    }

    /// Enable or disable shuffling.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Drop the uneven tail (the default) or pad it by wrapping around.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Indices assigned to this rank.
    pub fn num_samples(&self) -> usize {
        if self.drop_last {
            self.len / self.world_size
        } else {
            self.len.div_ceil(self.world_size)
        }
    }

    /// This rank's indices for an epoch.
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.shuffle {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let total = self.num_samples() * self.world_size;
        if total <= order.len() {
            order.truncate(total);
        } else if !order.is_empty() {
            let mut i = 0;
            while order.len() < total {
                order.push(order[i]);
                i += 1;
            }
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}
