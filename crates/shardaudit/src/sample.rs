//! Byte-sample estimator, mirroring the sampler storage replicas run when
//! they account shard sizes. The auditor recomputes the sample over the data
//! it reads and compares the result with each replica's reported estimate, so
//! this function and the replica-side one must stay in lockstep.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::model::KeyValue;

/// Sampling probability divisor; larger means a sparser sample.
pub const BYTE_SAMPLING_FACTOR: f64 = 250.0;
/// Fixed per-key overhead added to the probability denominator.
pub const BYTE_SAMPLING_OVERHEAD: f64 = 100.0;

/// Sampling verdict for one key/value pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteSampleInfo {
    /// Actual contribution of the pair: `key.len() + value.len()`.
    pub size: i64,
    /// Size this pair contributes to the estimate when sampled. Always at
    /// least `size`.
    pub sampled_size: i64,
    /// Whether the pair is part of the sample. Deterministic in the pair.
    pub in_sample: bool,
}

fn key_hash01(key: &[u8]) -> f64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as f64 / (u64::MAX as f64 + 1.0)
}

/// Decide whether a key/value pair is in the byte sample and what it weighs.
pub fn is_key_value_in_sample(kv: &KeyValue) -> ByteSampleInfo {
    let size = (kv.key.len() + kv.value.len()) as i64;
    let probability =
        size as f64 / (kv.key.len() as f64 + BYTE_SAMPLING_OVERHEAD) / BYTE_SAMPLING_FACTOR;

    let in_sample = key_hash01(&kv.key) < probability;
    let sampled_size = if probability > 0.0 && probability < 1.0 {
        (size as f64 / probability) as i64
    } else {
        size
    };

    ByteSampleInfo {
        size,
        sampled_size,
        in_sample,
    }
}
