//! Rebuilds the shard boundary map by reading the `keyServers` rows directly
//! from the storage replicas that serve them, cross-checking every replica's
//! pages against a reference reply.

use futures_util::future::join_all;

use crate::error::ClusterError;
use crate::events::{AuditEvent, AuditLog};
use crate::keys::{
    all_keys, krm_decode_ranges, printable, with_prefix, Key, KeyRange, KEY_SERVERS_PREFIX,
};
use crate::model::{GetKeyValuesReply, GetKeyValuesRequest, KeyValue, ShardAssignment};
use crate::rpc::{reply_within, with_txn_retry, ClusterEnv, REPLY_DEADLINE};
use crate::CheckConfig;

/// Paginates the shard directory across each shard's source replicas.
pub struct LocationResolver<'a> {
    env: &'a ClusterEnv,
    cfg: &'a CheckConfig,
    quiescent: bool,
}

impl<'a> LocationResolver<'a> {
    pub fn new(env: &'a ClusterEnv, cfg: &'a CheckConfig, quiescent: bool) -> Self {
        Self {
            env,
            cfg,
            quiescent,
        }
    }

    /// Resolve the ordered boundary rows `(key, team value)` of every shard,
    /// ending with the terminating range marker. Returns `None` when an
    /// inconsistency or required-replica outage already recorded a failure.
    pub async fn resolve(
        &self,
        shards: &[ShardAssignment],
        log: &mut AuditLog,
    ) -> Result<Option<Vec<KeyValue>>, ClusterError> {
        let user_span = all_keys();
        let mut begin_key = with_prefix(KEY_SERVERS_PREFIX, &user_span.begin);
        let end_key = with_prefix(KEY_SERVERS_PREFIX, &user_span.end);

        let mut locations: Vec<KeyValue> = Vec::new();

        for shard in shards {
            let page_end: &Key = (&shard.range.end).min(&end_key);

            while begin_key < *page_end {
                let reply = match self.read_page(shard, &begin_key, page_end, log).await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => return Ok(None),
                    Err(err) if err.is_version_retry() => {
                        log.info(
                            AuditEvent::new("ConsistencyCheck_RetryGetKeyLocations")
                                .detail("Error", err.name()),
                        );
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let decode_range = KeyRange::new(
                    strip_map_prefix(&begin_key)?,
                    strip_map_prefix(page_end)?,
                );
                let current =
                    krm_decode_ranges(KEY_SERVERS_PREFIX, &decode_range, &reply.data, reply.more);
                if current.len() < 2 {
                    return Err(ClusterError::Internal(format!(
                        "shard map page at {} produced no boundaries",
                        printable(&begin_key)
                    )));
                }

                // The page's synthetic begin row is kept only when it is
                // backed by a real directory row; otherwise the previous page
                // already recorded this boundary.
                if reply
                    .data
                    .first()
                    .is_some_and(|first| first.key == begin_key)
                {
                    locations.push(current[0].clone());
                }
                locations.extend(current[1..current.len() - 1].iter().cloned());

                begin_key = if reply.more {
                    reply
                        .data
                        .last()
                        .map(|kv| kv.key.clone())
                        .ok_or_else(|| {
                            ClusterError::Internal(
                                "continued shard map page carried no rows".into(),
                            )
                        })?
                } else {
                    shard.range.end.clone()
                };

                if begin_key >= end_key {
                    // Include the terminating range marker.
                    let terminator = current.last().ok_or_else(|| {
                        ClusterError::Internal("decoded shard map page has no boundaries".into())
                    })?;
                    locations.push(terminator.clone());
                }
            }
        }

        Ok(Some(locations))
    }

    /// Read one directory page from every source replica of the shard and
    /// verify the replies agree. `None` means a hard failure was recorded.
    async fn read_page(
        &self,
        shard: &ShardAssignment,
        begin: &[u8],
        end: &[u8],
        log: &mut AuditLog,
    ) -> Result<Option<GetKeyValuesReply>, ClusterError> {
        let version = with_txn_retry(|| self.env.txn.read_version()).await?;
        let req = GetKeyValuesRequest {
            begin: begin.to_vec(),
            end: end.to_vec(),
            limit: self.cfg.knobs.location_row_limit,
            limit_bytes: self.cfg.knobs.location_byte_limit,
            version,
        };

        let requests = shard.source.iter().map(|replica| {
            let rpc = replica.rpc.clone();
            let req = req.clone();
            async move { reply_within(REPLY_DEADLINE, async { rpc.get_key_values(&req).await }).await }
        });
        let replies: Vec<Option<GetKeyValuesReply>> = join_all(requests).await;

        let first_valid = replies.iter().position(Option::is_some);

        for (j, reply) in replies.iter().enumerate() {
            match reply {
                None => {
                    if self.quiescent {
                        log.failure_event(
                            AuditEvent::new("ConsistencyCheck_KeyServerUnavailable")
                                .detail("StorageServer", shard.source[j].id),
                        );
                        log.test_failure("Key server unavailable");
                        return Ok(None);
                    }
                    if first_valid.is_none() && j == replies.len() - 1 {
                        // Nobody answered; force the caller's retry path.
                        return Err(ClusterError::AllAlternativesFailed);
                    }
                }
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
                    if current.data != reference.data || current.more != reference.more {
                        log.failure_event(
                            AuditEvent::new("ConsistencyCheck_InconsistentKeyServers")
                                .detail("StorageServer1", shard.source[reference_index].id)
                                .detail("StorageServer2", shard.source[j].id),
                        );
                        log.test_failure("Key servers inconsistent");
                        return Ok(None);
                    }
                }
            }
        }

        match first_valid {
            Some(index) => Ok(replies.into_iter().nth(index).flatten()),
            None => Err(ClusterError::AllAlternativesFailed),
        }
    }
}

fn strip_map_prefix(key: &[u8]) -> Result<Key, ClusterError> {
    key.strip_prefix(KEY_SERVERS_PREFIX)
        .map(|stripped| stripped.to_vec())
        .ok_or_else(|| {
            ClusterError::Internal(format!(
                "key {} outside the shard map prefix",
                printable(key)
            ))
        })
}
