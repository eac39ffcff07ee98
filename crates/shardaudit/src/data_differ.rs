//! Per-shard data verification: paginated multi-replica range reads, the
//! alignment diff, size recomputation, and the estimator cross-checks.

use std::collections::BTreeMap;

use futures_util::future::join_all;

use crate::error::ClusterError;
use crate::events::{AuditEvent, AuditLog};
use crate::keys::{all_keys, key_after, printable, Key, KeyRange, KEY_SERVERS_PREFIX};
use crate::model::{
    decode_key_servers_value, decode_server_list_value, GetKeyValuesReply, GetKeyValuesRequest,
    KeyValue, ClusterConfiguration, ReplicaId, ShardSizeBounds,
};
use crate::partition::{shard_order, WorkPartition};
use crate::rate_limiter::SpeedLimit;
use crate::rpc::{
    reply_within, with_txn_retry, ClusterEnv, ReplicaInterface, REPLY_DEADLINE,
};
use crate::sample::is_key_value_in_sample;
use crate::{keys, CheckConfig, Knobs};

/// Totals produced by walking two ordered key/value sequences in lockstep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AlignmentDiff {
    /// Keys present only in the current sequence, and the last such key.
    pub current_uniques: usize,
    pub current_unique_key: Option<Key>,
    /// Keys present only in the reference sequence, and the last such key.
    pub reference_uniques: usize,
    pub reference_unique_key: Option<Key>,
    /// Keys present in both with differing values, and the last such key.
    pub value_mismatches: usize,
    pub value_mismatch_key: Option<Key>,
    /// Keys present in both with identical values.
    pub matching_kv_pairs: usize,
}

/// Attribute every row of two same-version pages as matching, unique to one
/// side, or a value conflict.
pub fn align_diff(current: &[KeyValue], reference: &[KeyValue]) -> AlignmentDiff {
    let mut diff = AlignmentDiff::default();
    let mut ci = 0;
    let mut ri = 0;

    while ci < current.len() || ri < reference.len() {
        if ci >= current.len() {
            diff.reference_unique_key = Some(reference[ri].key.clone());
            diff.reference_uniques += 1;
            ri += 1;
        } else if ri >= reference.len() {
            diff.current_unique_key = Some(current[ci].key.clone());
            diff.current_uniques += 1;
            ci += 1;
        } else {
            let current_kv = &current[ci];
            let reference_kv = &reference[ri];
            if current_kv.key == reference_kv.key {
                if current_kv.value == reference_kv.value {
                    diff.matching_kv_pairs += 1;
                } else {
                    diff.value_mismatch_key = Some(current_kv.key.clone());
                    diff.value_mismatches += 1;
                }
                ci += 1;
                ri += 1;
            } else if current_kv.key < reference_kv.key {
                diff.current_unique_key = Some(current_kv.key.clone());
                diff.current_uniques += 1;
                ci += 1;
            } else {
                diff.reference_unique_key = Some(reference_kv.key.clone());
                diff.reference_uniques += 1;
                ri += 1;
            }
        }
    }

    diff
}

/// Largest shard the placement layer should produce for a database of this
/// size.
pub fn max_shard_size(db_size_bytes: f64, knobs: &Knobs) -> i64 {
    let scaled = (knobs.min_shard_bytes
        + db_size_bytes.sqrt() as i64 * knobs.shard_bytes_per_sqrt_byte)
        * knobs.shard_bytes_ratio;
    scaled.min(knobs.max_shard_bytes)
}

/// Permitted size window for one shard.
pub fn shard_size_bounds(range: &KeyRange, max_shard_size: i64, knobs: &Knobs) -> ShardSizeBounds {
    let max_bytes = if range.begin.starts_with(KEY_SERVERS_PREFIX) {
        knobs.key_server_shard_bytes
    } else {
        max_shard_size
    };
    // The first shard of the keyspace may be arbitrarily small.
    let min_bytes = if range.begin.is_empty() {
        0
    } else {
        max_shard_size / knobs.shard_bytes_ratio
    };
    ShardSizeBounds {
        min_bytes,
        max_bytes,
        permitted_error_bytes: max_bytes / 10,
    }
}

/// Result of reading one page of a shard from its full replica team.
enum PageRead {
    /// A hard failure was recorded; the component aborts.
    Failed,
    /// No replica answered; tolerated outside quiescence and relocation.
    NoReplies,
    /// The agreed-on reference reply.
    Page(GetKeyValuesReply),
}

/// Verifies that every sampled shard holds byte-identical data on all of its
/// replicas and that the replicas' size estimates are trustworthy.
pub struct DataDiffer<'a> {
    env: &'a ClusterEnv,
    cfg: &'a CheckConfig,
    quiescent: bool,
    repetitions: u64,
}

impl<'a> DataDiffer<'a> {
    pub fn new(
        env: &'a ClusterEnv,
        cfg: &'a CheckConfig,
        quiescent: bool,
        repetitions: u64,
    ) -> Self {
        Self {
            env,
            cfg,
            quiescent,
            repetitions,
        }
    }

    /// Walk this client's slice of the shard list. Returns `false` when a
    /// failure aborted the walk (the failure is already recorded).
    pub async fn check(
        &self,
        key_locations: &[KeyValue],
        configuration: &ClusterConfiguration,
        log: &mut AuditLog,
    ) -> Result<bool, ClusterError> {
        if key_locations.len() < 2 {
            return Ok(true);
        }

        let knobs = &self.cfg.knobs;
        let partition = WorkPartition::for_client(
            self.cfg.client_id,
            self.cfg.client_count,
            self.cfg.distributed,
            self.cfg.shard_sample_factor,
        );
        let mut limiter = (self.cfg.rate_limit_bytes_per_sec > 0)
            .then(|| SpeedLimit::new(self.cfg.rate_limit_bytes_per_sec, knobs.rate_window));

        // Recomputing the database size walks every shard, which is only
        // affordable in simulation.
        let db_size = if self.env.sim.is_simulated() {
            self.database_size().await? as f64
        } else {
            knobs.default_db_size_bytes
        };

        let ranges: Vec<KeyRange> = key_locations
            .windows(2)
            .map(|pair| KeyRange::new(pair[0].key.clone(), pair[1].key.clone()))
            .collect();
        let order = shard_order(
            ranges.len(),
            self.cfg.shuffle_shards,
            self.cfg.shared_random_number,
            self.repetitions,
        );

        // Total bytes per replica; exact in a non-distributed check, estimate
        // accumulation otherwise.
        let mut replica_sizes: BTreeMap<ReplicaId, i64> = BTreeMap::new();

        for position in partition.positions(ranges.len()) {
            let shard = order[position];
            let range = &ranges[shard];

            let (source_ids, dest_ids) = decode_key_servers_value(&key_locations[shard].value)?;
            let is_relocating = !dest_ids.is_empty();

            if partition.first_client
                && self.quiescent
                && !is_relocating
                && source_ids.len() != configuration.storage_team_size
            {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_InvalidTeamSize")
                        .detail("ShardBegin", printable(&range.begin))
                        .detail("ShardEnd", printable(&range.end))
                        .detail("TeamSize", source_ids.len())
                        .detail("DesiredTeamSize", configuration.storage_team_size),
                );
                log.test_failure("Invalid team size");
                return Ok(false);
            }

            let replica_ids = if is_relocating { dest_ids } else { source_ids };
            let replicas = self.resolve_replicas(&replica_ids, log).await?;

            let estimated = self.storage_size_estimate(&replicas, range, log).await;

            let bounds = shard_size_bounds(range, max_shard_size(db_size, knobs), knobs);

            if partition.first_client {
                if self.quiescent && estimated.is_empty() {
                    log.test_failure("Error fetching storage metrics");
                } else if self.cfg.distributed {
                    for (id, estimate) in &estimated {
                        *replica_sizes.entry(*id).or_default() += (*estimate).max(0);
                    }
                }
            }

            if !partition.full_check(shard) {
                continue;
            }

            let Some(stats) = self
                .diff_shard(range, &replicas, is_relocating, &bounds, &mut limiter, log)
                .await?
            else {
                return Ok(false);
            };

            if !self.cfg.distributed {
                for (id, _) in &replicas {
                    *replica_sizes.entry(*id).or_default() += stats.shard_bytes;
                }
            }

            if self.quiescent {
                for (id, estimate) in &estimated {
                    if *estimate >= 0 && *estimate != stats.sampled_bytes {
                        log.failure_event(
                            AuditEvent::new("ConsistencyCheck_IncorrectEstimate")
                                .detail("EstimatedBytes", estimate)
                                .detail("CorrectSampledBytes", stats.sampled_bytes)
                                .detail("StorageServer", id),
                        );
                        log.test_failure("Storage servers had incorrect sampled estimate");
                        break;
                    } else if *estimate < 0 {
                        log.test_failure("Could not get storage metrics from server");
                        break;
                    }
                }
            }

            let std_dev = stats.shard_variance.sqrt();
            let estimate_error = (stats.shard_bytes - stats.sampled_bytes).abs();

            // Only meaningful once the sample is large enough to resemble a
            // normal distribution.
            if stats.sampled_keys > 30 && estimate_error as f64 > knobs.failure_std_devs * std_dev
            {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_InaccurateShardEstimate")
                        .detail("Min", bounds.min_bytes)
                        .detail("Max", bounds.max_bytes)
                        .detail("Estimate", stats.sampled_bytes)
                        .detail("Actual", stats.shard_bytes)
                        .detail("NumStdDev", estimate_error as f64 / std_dev)
                        .detail("Variance", stats.shard_variance)
                        .detail("ShardBegin", printable(&range.begin))
                        .detail("ShardEnd", printable(&range.end))
                        .detail("NumKeys", stats.shard_keys)
                        .detail("NumSampledKeys", stats.sampled_keys),
                );
                log.test_failure(&format!(
                    "Shard size is more than {} std dev from estimate",
                    knobs.failure_std_devs
                ));
            }

            // The splitter never considers the first key of a shard, so its
            // sampled size is excluded from the upper-bound comparison.
            if stats.can_split
                && stats.sampled_keys > 5
                && self.quiescent
                && !range.begin.starts_with(KEY_SERVERS_PREFIX)
                && (stats.sampled_bytes < bounds.min_bytes - 3 * bounds.permitted_error_bytes
                    || stats.sampled_bytes - stats.first_key_sampled_bytes
                        > bounds.max_bytes + 3 * bounds.permitted_error_bytes)
            {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_InvalidShardSize")
                        .detail("Min", bounds.min_bytes)
                        .detail("Max", bounds.max_bytes)
                        .detail("Size", stats.shard_bytes)
                        .detail("EstimatedSize", stats.sampled_bytes)
                        .detail("ShardBegin", printable(&range.begin))
                        .detail("ShardEnd", printable(&range.end))
                        .detail("ShardCount", ranges.len())
                        .detail("SampledKeys", stats.sampled_keys),
                );
                log.test_failure(&format!(
                    "Shard size in quiescent database is too {}",
                    if stats.sampled_bytes < bounds.min_bytes {
                        "small"
                    } else {
                        "large"
                    }
                ));
                return Ok(false);
            }

            if stats.bytes_read > 0 {
                log.info(
                    AuditEvent::new("ConsistencyCheck_ReadRange")
                        .detail("Range", range)
                        .detail("BytesRead", stats.bytes_read),
                );
            }
        }

        for (id, bytes) in &replica_sizes {
            tracing::debug!(replica = %id, bytes, "storage replica size");
        }

        Ok(true)
    }

    /// Look up each replica's registration and materialize its interface.
    /// A registration disappearing mid-run is only legal while data
    /// distribution is active.
    async fn resolve_replicas(
        &self,
        ids: &[ReplicaId],
        log: &mut AuditLog,
    ) -> Result<Vec<(ReplicaId, ReplicaInterface)>, ClusterError> {
        let values = with_txn_retry(|| async {
            let reads = ids.iter().map(|id| {
                let txn = self.env.txn.clone();
                let key = keys::server_list_key_for(*id);
                async move { txn.get(&key).await }
            });
            join_all(reads)
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()
        })
        .await?;

        let mut replicas = Vec::with_capacity(ids.len());
        for (id, value) in ids.iter().zip(values) {
            match value {
                Some(value) => {
                    let descriptor = decode_server_list_value(&value)?;
                    match self.env.topology.connect(&descriptor) {
                        Some(interface) => replicas.push((*id, interface)),
                        None if self.quiescent => {
                            log.test_failure("/FF/serverList changing in a quiescent database");
                        }
                        None => {}
                    }
                }
                None if self.quiescent => {
                    log.test_failure("/FF/serverList changing in a quiescent database");
                }
                None => {}
            }
        }
        Ok(replicas)
    }

    /// Collect each replica's size estimate for the shard; unreachable
    /// replicas contribute a `-1` placeholder.
    async fn storage_size_estimate(
        &self,
        replicas: &[(ReplicaId, ReplicaInterface)],
        range: &KeyRange,
        log: &mut AuditLog,
    ) -> Vec<(ReplicaId, i64)> {
        let requests = replicas.iter().map(|(_, interface)| {
            let rpc = interface.rpc.clone();
            let range = range.clone();
            async move {
                reply_within(REPLY_DEADLINE, async { rpc.wait_metrics(&range, 0, -1).await })
                    .await
            }
        });
        let replies = join_all(requests).await;

        let mut estimated: Vec<(ReplicaId, i64)> = Vec::with_capacity(replicas.len());
        let mut first_valid: Option<i64> = None;
        for ((id, _), reply) in replicas.iter().zip(replies) {
            match reply {
                None => {
                    log.warn(
                        AuditEvent::new("ConsistencyCheck_FailedToFetchMetrics")
                            .detail("Begin", printable(&range.begin))
                            .detail("End", printable(&range.end))
                            .detail("StorageServer", id),
                    );
                    estimated.push((*id, -1));
                }
                Some(metrics) => {
                    match first_valid {
                        None => first_valid = Some(metrics.bytes),
                        Some(reference) if reference != metrics.bytes => {
                            // Disagreement is diagnostic only; the recomputed
                            // sample decides who is right.
                            log.info(
                                AuditEvent::new("ConsistencyCheck_InconsistentStorageMetrics")
                                    .detail("ByteEstimate1", reference)
                                    .detail("ByteEstimate2", metrics.bytes)
                                    .detail("Begin", printable(&range.begin))
                                    .detail("End", printable(&range.end))
                                    .detail("StorageServer", id),
                            );
                        }
                        Some(_) => {}
                    }
                    estimated.push((*id, metrics.bytes));
                }
            }
        }
        estimated
    }

    /// Paginated diff of one shard. Returns `None` when a hard failure was
    /// recorded and the component must abort.
    async fn diff_shard(
        &self,
        range: &KeyRange,
        replicas: &[(ReplicaId, ReplicaInterface)],
        is_relocating: bool,
        bounds: &ShardSizeBounds,
        limiter: &mut Option<SpeedLimit>,
        log: &mut AuditLog,
    ) -> Result<Option<ShardStats>, ClusterError> {
        let knobs = &self.cfg.knobs;
        let mut stats = ShardStats::default();
        let mut begin = range.begin.clone();

        loop {
            let page = match self
                .read_shard_page(range, &begin, replicas, is_relocating, log)
                .await
            {
                Ok(page) => page,
                Err(err) if err.is_version_retry() => {
                    log.info(
                        AuditEvent::new("ConsistencyCheck_RetryDataConsistency")
                            .detail("Error", err.name()),
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            let reference = match page {
                PageRead::Failed => return Ok(None),
                PageRead::NoReplies => break,
                PageRead::Page(reference) => reference,
            };

            let total_read = reference.expected_size() as i64;
            stats.bytes_read += total_read;

            for (k, kv) in reference.data.iter().enumerate() {
                let info = is_key_value_in_sample(kv);
                stats.shard_bytes += info.size;

                if info.sampled_size > 0 {
                    let item_probability = info.size as f64 / info.sampled_size as f64;
                    if item_probability < 1.0 {
                        stats.shard_variance += item_probability
                            * (1.0 - item_probability)
                            * (info.sampled_size as f64).powi(2);
                    }
                }

                if info.in_sample {
                    stats.sampled_bytes += info.sampled_size;
                    if !stats.can_split
                        && stats.sampled_bytes >= bounds.min_bytes
                        && kv.key.len() <= knobs.split_key_size_limit
                        && stats.sampled_bytes
                            <= (bounds.max_bytes as f64 * knobs.unfair_split_fraction / 2.0)
                                as i64
                    {
                        stats.can_split = true;
                        stats.split_bytes = stats.sampled_bytes;
                    }
                    if stats.shard_keys == 0 && k == 0 {
                        stats.first_key_sampled_bytes += info.sampled_size;
                    }
                    stats.sampled_keys += 1;
                }
            }
            stats.shard_keys += reference.data.len() as i64;

            if let Some(limiter) = limiter {
                limiter.get_allowance(total_read as u64).await;
            }

            if reference.more {
                let last = reference
                    .data
                    .last()
                    .ok_or_else(|| {
                        ClusterError::Internal("continued page carried no rows".into())
                    })?;
                begin = key_after(&last.key);
            } else {
                break;
            }
        }

        stats.can_split = stats.can_split
            && stats.sampled_bytes - stats.split_bytes >= bounds.min_bytes
            && stats.sampled_bytes > stats.split_bytes;

        Ok(Some(stats))
    }

    /// Issue the same page read to every replica of the shard, diff the
    /// replies against the first present one, and attribute any divergence.
    async fn read_shard_page(
        &self,
        range: &KeyRange,
        begin: &[u8],
        replicas: &[(ReplicaId, ReplicaInterface)],
        is_relocating: bool,
        log: &mut AuditLog,
    ) -> Result<PageRead, ClusterError> {
        let version = with_txn_retry(|| self.env.txn.read_version()).await?;
        let req = GetKeyValuesRequest {
            begin: begin.to_vec(),
            end: range.end.clone(),
            limit: self.cfg.knobs.data_row_limit,
            limit_bytes: self.cfg.knobs.data_byte_limit,
            version,
        };

        let requests = replicas.iter().map(|(_, interface)| {
            let rpc = interface.rpc.clone();
            let req = req.clone();
            async move { reply_within(REPLY_DEADLINE, async { rpc.get_key_values(&req).await }).await }
        });
        let replies: Vec<Option<GetKeyValuesReply>> = join_all(requests).await;
        let first_valid = replies.iter().position(Option::is_some);

        for (j, reply) in replies.iter().enumerate() {
            match reply {
                Some(current) => {
                    let reference_index = first_valid.ok_or_else(|| {
                        ClusterError::Internal("present reply without a reference index".into())
                    })?;
                    if j == reference_index {
                        continue;
                    }
                    let reference = replies[reference_index].as_ref().ok_or_else(|| {
                        ClusterError::Internal("reference reply missing".into())
                    })?;
                    if current.data == reference.data && current.more == reference.more {
                        continue;
                    }

                    if self.env.sim.is_simulated() {
                        dump_mismatched_pages(
                            &replicas[j].1,
                            current,
                            &replicas[reference_index].1,
                            reference,
                        );
                    }

                    let diff = align_diff(&current.data, &reference.data);
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_DataInconsistent")
                            .detail("CurrentServer", replicas[j].0)
                            .detail("ReferenceServer", replicas[reference_index].0)
                            .detail("ShardBegin", printable(begin))
                            .detail("ShardEnd", printable(&range.end))
                            .detail("VersionNumber", req.version)
                            .detail("CurrentUniques", diff.current_uniques)
                            .detail(
                                "CurrentUniqueKey",
                                printable(diff.current_unique_key.as_deref().unwrap_or_default()),
                            )
                            .detail("ReferenceUniques", diff.reference_uniques)
                            .detail(
                                "ReferenceUniqueKey",
                                printable(
                                    diff.reference_unique_key.as_deref().unwrap_or_default(),
                                ),
                            )
                            .detail("ValueMismatches", diff.value_mismatches)
                            .detail(
                                "ValueMismatchKey",
                                printable(diff.value_mismatch_key.as_deref().unwrap_or_default()),
                            )
                            .detail("MatchingKVPairs", diff.matching_kv_pairs),
                    );
                    log.test_failure("Data inconsistent");
                    return Ok(PageRead::Failed);
                }
                None if !is_relocating => {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_StorageServerUnavailable")
                            .detail("StorageServer", replicas[j].0)
                            .detail("ShardBegin", printable(&range.begin))
                            .detail("ShardEnd", printable(&range.end))
                            .detail("Address", replicas[j].1.address),
                    );
                    // Every shard must be reachable in quiescence.
                    if self.quiescent {
                        log.test_failure("Storage server unavailable");
                        return Ok(PageRead::Failed);
                    }
                }
                None => {}
            }
        }

        match first_valid {
            Some(index) => {
                let reference = replies.into_iter().nth(index).flatten().ok_or_else(|| {
                    ClusterError::Internal("reference reply missing".into())
                })?;
                Ok(PageRead::Page(reference))
            }
            None => Ok(PageRead::NoReplies),
        }
    }

    async fn database_size(&self) -> Result<i64, ClusterError> {
        let span = KeyRange::new(all_keys().begin, KEY_SERVERS_PREFIX.to_vec());
        let metrics = with_txn_retry(|| {
            self.env
                .txn
                .storage_metrics(&span, self.cfg.knobs.db_size_wait_bytes)
        })
        .await?;
        Ok(metrics.bytes)
    }
}

/// Accumulated sizing state for one shard walk.
#[derive(Debug, Default)]
struct ShardStats {
    shard_keys: i64,
    shard_bytes: i64,
    sampled_bytes: i64,
    split_bytes: i64,
    first_key_sampled_bytes: i64,
    sampled_keys: i64,
    shard_variance: f64,
    can_split: bool,
    bytes_read: i64,
}

/// Verbose page dump used in simulation, where the full contents are small
/// enough to log.
fn dump_mismatched_pages(
    current_replica: &ReplicaInterface,
    current: &GetKeyValuesReply,
    reference_replica: &ReplicaInterface,
    reference: &GetKeyValuesReply,
) {
    let mut invalid_index = None;
    for (k, kv) in current.data.iter().enumerate() {
        if invalid_index.is_none()
            && reference
                .data
                .get(k)
                .map_or(true, |other| other != kv)
        {
            invalid_index = Some(k);
        }
        tracing::debug!(
            server = %current_replica.address,
            index = k,
            key = %printable(&kv.key),
            value = %printable(&kv.value),
            "mismatched page row"
        );
    }
    for (k, kv) in reference.data.iter().enumerate() {
        if invalid_index.is_none()
            && current.data.get(k).map_or(true, |other| other != kv)
        {
            invalid_index = Some(k);
        }
        tracing::debug!(
            server = %reference_replica.address,
            index = k,
            key = %printable(&kv.key),
            value = %printable(&kv.value),
            "mismatched page row"
        );
    }
    tracing::debug!(?invalid_index, "first divergent row");
}
