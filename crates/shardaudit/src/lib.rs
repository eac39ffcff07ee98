//! Distributed consistency auditor for sharded, replicated key-value clusters.
//!
//! The auditor reconciles three views of shard ownership (the control-plane
//! directory, the replicas' own shard-map records, and the data the replicas
//! actually serve), fans paginated range reads out to every replica of each
//! sampled shard, diffs the replies byte-for-byte, and cross-checks the
//! store's size-sampling estimator against a ground-truth recomputation.
//! Against a quiesced cluster it additionally validates structural health:
//! process classes, queue drains, placement, and on-disk store inventory.
//!
//! External collaborators (transactional client, replica RPC endpoints,
//! topology service, quiescence driver) sit behind the trait seams in
//! [`rpc`]; [`sim`] provides an in-process cluster implementing the same
//! contracts for tests and fixture-driven runs.

use std::time::Duration;

pub mod data_differ;
pub mod error;
pub mod events;
pub mod keys;
pub mod location_resolver;
pub mod model;
pub mod orchestrator;
pub mod partition;
pub mod rate_limiter;
pub mod rpc;
pub mod sample;
pub mod shard_directory;
pub mod sim;
pub mod topology;

/// Tunable protocol constants. The defaults are the validated production
/// values; tests shrink the paging limits to exercise resumption.
#[derive(Debug, Clone)]
pub struct Knobs {
    /// Ranges requested per directory batch.
    pub directory_batch_limit: usize,
    /// Directory batch size under fault injection.
    pub directory_batch_limit_faulty: usize,
    /// Row limit per shard-map page read.
    pub location_row_limit: usize,
    /// Byte limit per shard-map page read.
    pub location_byte_limit: usize,
    /// Row limit per data page read.
    pub data_row_limit: usize,
    /// Byte limit per data page read.
    pub data_byte_limit: usize,
    /// Keys longer than this are never usable as split points.
    pub split_key_size_limit: usize,
    /// Fraction of the max shard size the splitter is willing to leave on
    /// one side of an uneven split.
    pub unfair_split_fraction: f64,
    /// Sliding window of the read-rate limiter.
    pub rate_window: Duration,
    /// Largest transaction-log queue tolerated in a quiet database.
    pub max_tlog_queue_bytes: i64,
    /// Standard deviations of estimator drift tolerated before failing.
    pub failure_std_devs: f64,
    /// Smallest shard the placement layer will create.
    pub min_shard_bytes: i64,
    /// Shard-size growth per square-root byte of database size.
    pub shard_bytes_per_sqrt_byte: i64,
    /// Ratio between the largest and smallest allowed shard.
    pub shard_bytes_ratio: i64,
    /// Hard cap on shard size.
    pub max_shard_bytes: i64,
    /// Size cap for shards of the shard-map keyspace itself.
    pub key_server_shard_bytes: i64,
    /// Database size assumed outside simulation, where recomputing it would
    /// enumerate every shard.
    pub default_db_size_bytes: f64,
    /// Imprecision accepted when recomputing the database size.
    pub db_size_wait_bytes: i64,
    /// Pause between audit iterations in indefinite mode.
    pub iteration_delay: Duration,
    /// Pause before retrying a directory batch no proxy answered.
    pub empty_batch_delay: Duration,
}

impl Default for Knobs {
    fn default() -> Self {
        Self {
            directory_batch_limit: 100,
            directory_batch_limit_faulty: 1,
            location_row_limit: 2_000,
            location_byte_limit: 100_000,
            data_row_limit: 10_000,
            data_byte_limit: 80_000,
            split_key_size_limit: 4_096,
            unfair_split_fraction: 2.0 / 3.0,
            rate_window: Duration::from_secs(1),
            max_tlog_queue_bytes: 100_000,
            failure_std_devs: 7.0,
            min_shard_bytes: 200_000,
            shard_bytes_per_sqrt_byte: 45,
            shard_bytes_ratio: 4,
            max_shard_bytes: 500_000_000,
            key_server_shard_bytes: 500_000_000,
            default_db_size_bytes: 100e12,
            db_size_wait_bytes: 100_000,
            iteration_delay: Duration::from_secs(5),
            empty_batch_delay: Duration::from_secs(1),
        }
    }
}

/// Per-client audit configuration.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Run the structural checks that only pass against a quiet database.
    pub perform_quiescent_checks: bool,
    /// How long to wait for the database to go quiet before downgrading to a
    /// non-quiescent run.
    pub quiescent_wait_timeout: Duration,
    /// Partition the expensive shard diffs across sibling clients.
    pub distributed: bool,
    /// Out of every this many shards, one is fully data-checked.
    pub shard_sample_factor: usize,
    /// Log failures at error severity instead of warning.
    pub failure_is_error: bool,
    /// Ideal bytes per second to read from each storage replica; zero means
    /// unlimited.
    pub rate_limit_bytes_per_sec: u64,
    /// Deterministically permute shard order each iteration.
    pub shuffle_shards: bool,
    /// Loop forever with a short pause between iterations.
    pub indefinite: bool,
    /// This client's index within the cooperating group.
    pub client_id: usize,
    /// Total cooperating clients.
    pub client_count: usize,
    /// Seed shared by all clients of one run; drives the shard shuffle.
    pub shared_random_number: u64,
    pub knobs: Knobs,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            perform_quiescent_checks: false,
            quiescent_wait_timeout: Duration::from_secs(600),
            distributed: true,
            shard_sample_factor: 1,
            failure_is_error: false,
            rate_limit_bytes_per_sec: 0,
            shuffle_shards: false,
            indefinite: false,
            client_id: 0,
            client_count: 1,
            shared_random_number: 0,
            knobs: Knobs::default(),
        }
    }
}

impl CheckConfig {
    /// The first client runs the quiescence gate, the structural checks, and
    /// the sizing pass over every shard.
    pub fn first_client(&self) -> bool {
        self.client_id == 0
    }
}
