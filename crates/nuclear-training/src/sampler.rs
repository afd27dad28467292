use crate::error::{TrainingError, TrainingResult};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Per-epoch index order over a dataset, optionally sharded across ranks.
///
/// Each epoch draws a permutation seeded with `seed + epoch`. With more than
/// one rank the permutation is padded by wrapping around to a multiple of
/// `world_size`, and rank `r` takes positions `r, r + W, r + 2W, ...`, so
/// every rank sees the same number of samples. A single-rank sampler yields
/// the bare permutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochSampler {
    len: usize,
    seed: u64,
    rank: usize,
    world_size: usize,
}

impl EpochSampler {
    #[must_use]
    pub fn single(len: usize, seed: u64) -> Self {
        Self { len, seed, rank: 0, world_size: 1 }
    }

    pub fn distributed(
        len: usize,
        seed: u64,
        rank: usize,
        world_size: usize,
    ) -> TrainingResult<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(TrainingError::distributed(format!(
                "invalid rank {rank} for world_size {world_size}"
            )));
        }
        Ok(Self { len, seed, rank, world_size })
    }

    /// Samples this rank sees per epoch.
    #[must_use]
    pub fn samples_per_rank(&self) -> usize {
        self.len.div_ceil(self.world_size)
    }

    #[must_use]
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..self.len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let padded = self.samples_per_rank() * self.world_size;
        (self.rank..padded)
            .step_by(self.world_size)
            .map(|pos| order[pos % self.len])
            .collect()
    }
}

/// Unpadded evaluation shard: indices `i` with `i % world_size == rank`.
#[must_use]
pub fn eval_shard(len: usize, rank: usize, world_size: usize) -> Vec<usize> {
    (rank..len).step_by(world_size.max(1)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_single_sampler_is_a_permutation() {
        let sampler = EpochSampler::single(10, 42);
        let mut order = sampler.indices(0);
        assert_ne!(order, sampler.indices(1));
        order.sort_unstable();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_ranks_cover_the_epoch_with_equal_shards() {
        let world = 3;
        let shards: Vec<Vec<usize>> = (0..world)
            .map(|r| EpochSampler::distributed(10, 42, r, world).unwrap().indices(2))
            .collect();
        assert!(shards.iter().all(|s| s.len() == 4));
        let covered: HashSet<usize> = shards.iter().flatten().copied().collect();
        assert_eq!(covered.len(), 10);
    }

    #[test]
    fn test_one_rank_matches_single_sampler() {
        let single = EpochSampler::single(17, 9);
        let dist = EpochSampler::distributed(17, 9, 0, 1).unwrap();
        for epoch in 0..3 {
            assert_eq!(single.indices(epoch), dist.indices(epoch));
        }
    }

    #[test]
    fn test_invalid_rank_is_rejected() {
        assert!(EpochSampler::distributed(10, 0, 2, 2).is_err());
        assert!(EpochSampler::distributed(10, 0, 0, 0).is_err());
    }

    #[test]
    fn test_eval_shard_is_unpadded() {
        assert_eq!(eval_shard(5, 0, 2), vec![0, 2, 4]);
        assert_eq!(eval_shard(5, 1, 2), vec![1, 3]);
        assert!(eval_shard(1, 1, 2).is_empty());
    }
}
