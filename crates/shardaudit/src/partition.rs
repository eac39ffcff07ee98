//! Deterministic shard ordering and the cross-client work partition.

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Produce the iteration order over shard indices.
///
/// With shuffling enabled the permutation is seeded from the run's shared
/// random number plus the repetition counter, so sibling clients agree on the
/// order and a rerun of the same iteration reproduces it exactly.
pub fn shard_order(
    shard_count: usize,
    shuffle: bool,
    shared_random_number: u64,
    repetitions: u64,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..shard_count).collect();
    if shuffle {
        let seed = shared_random_number.wrapping_add(repetitions);
        let seed = if seed == 0 { 1 } else { seed };
        let mut rng = SmallRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
    }
    order
}

/// One client's slice of the shard list.
///
/// The first client walks every shard to accumulate sizing, fully diffing one
/// shard out of every `sample_stride`; the other clients (when the check is
/// distributed) stride directly across their own subset and fully diff
/// everything they visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkPartition {
    pub start: usize,
    pub step: usize,
    pub sample_stride: usize,
    pub first_client: bool,
}

impl WorkPartition {
    pub fn for_client(
        client_id: usize,
        client_count: usize,
        distributed: bool,
        shard_sample_factor: usize,
    ) -> Self {
        let effective_client_count = if distributed { client_count.max(1) } else { 1 };
        let first_client = client_id == 0;
        let step = if distributed && !first_client {
            effective_client_count * shard_sample_factor
        } else {
            1
        };
        Self {
            start: client_id * (shard_sample_factor + 1),
            step: step.max(1),
            sample_stride: (effective_client_count * shard_sample_factor).max(1),
            first_client,
        }
    }

    /// Positions in the shard order this client visits.
    pub fn positions(&self, shard_count: usize) -> impl Iterator<Item = usize> {
        (self.start..shard_count).step_by(self.step)
    }

    /// Whether the shard at this (permuted) index gets the full data diff
    /// rather than just sizing.
    pub fn full_check(&self, shard: usize) -> bool {
        !self.first_client || shard % self.sample_stride == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn order_is_reproducible_for_one_seed_and_varies_across_iterations() {
        let a = shard_order(64, true, 42, 3);
        let b = shard_order(64, true, 42, 3);
        assert_eq!(a, b);

        let c = shard_order(64, true, 42, 4);
        assert_ne!(a, c);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn zero_seed_falls_back_without_panicking() {
        let order = shard_order(8, true, 0, 0);
        assert_eq!(order.len(), 8);
    }

    #[test]
    fn disabled_shuffle_is_identity() {
        assert_eq!(shard_order(5, false, 9, 9), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn clients_jointly_visit_every_shard_at_sample_factor_one() {
        let shard_count = 97;
        for client_count in [1usize, 2, 3, 5] {
            let mut visited = BTreeSet::new();
            for client_id in 0..client_count {
                let part = WorkPartition::for_client(client_id, client_count, true, 1);
                visited.extend(part.positions(shard_count));
            }
            assert_eq!(visited.len(), shard_count, "clients={client_count}");
        }
    }

    #[test]
    fn first_client_samples_by_stride() {
        let part = WorkPartition::for_client(0, 4, true, 2);
        assert_eq!(part.start, 0);
        assert_eq!(part.step, 1);
        assert_eq!(part.sample_stride, 8);
        assert!(part.full_check(0));
        assert!(!part.full_check(3));
        assert!(part.full_check(8));
    }

    #[test]
    fn non_first_distributed_clients_stride_and_always_diff() {
        let part = WorkPartition::for_client(2, 4, true, 2);
        assert_eq!(part.start, 6);
        assert_eq!(part.step, 8);
        assert!(part.full_check(3));

        let solo = WorkPartition::for_client(2, 4, false, 2);
        assert_eq!(solo.step, 1);
        assert_eq!(solo.sample_stride, 2);
    }
}
