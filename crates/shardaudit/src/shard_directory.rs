//! Collects the shard-to-team mapping from the control-plane directory.

use futures_util::future::join_all;

use crate::error::ClusterError;
use crate::events::{AuditEvent, AuditLog};
use crate::keys::{key_servers_keys, Key, KeyRange};
use crate::model::ShardAssignment;
use crate::rpc::{reply_within, ClusterEnv, ReplicaInterface, REPLY_DEADLINE};
use crate::CheckConfig;

/// Outcome of one directory batch across the proxy roster.
enum BatchOutcome {
    /// A proxy answered; resume after the last returned range.
    Inserted {
        next_begin: Key,
        batch: Vec<(KeyRange, Vec<ReplicaInterface>)>,
    },
    /// No proxy produced data; sleep and retry the batch.
    Empty,
    /// A required proxy was unreachable; the component aborts.
    Failed,
    /// The proxy roster changed mid-batch; restart with the new roster.
    RosterChanged,
}

/// Queries every proxy for the `keyServers` directory in resumable batches.
pub struct ShardDirectory<'a> {
    env: &'a ClusterEnv,
    cfg: &'a CheckConfig,
    quiescent: bool,
}

impl<'a> ShardDirectory<'a> {
    pub fn new(env: &'a ClusterEnv, cfg: &'a CheckConfig, quiescent: bool) -> Self {
        Self {
            env,
            cfg,
            quiescent,
        }
    }

    /// Collect the full shard list, or `None` when a quiescent-mode proxy
    /// failure already recorded a check failure.
    pub async fn collect(
        &self,
        log: &mut AuditLog,
    ) -> Result<Option<Vec<ShardAssignment>>, ClusterError> {
        let span = key_servers_keys();
        let mut begin = span.begin.clone();
        let end = span.end;

        let limit = if self.env.sim.fault_injection() {
            self.cfg.knobs.directory_batch_limit_faulty
        } else {
            self.cfg.knobs.directory_batch_limit
        };

        let mut assignments: Vec<ShardAssignment> = Vec::new();

        while begin < end {
            let outcome = self.run_batch(&begin, &end, limit, log).await;
            match outcome {
                BatchOutcome::Inserted { next_begin, batch } => {
                    assignments.extend(batch.into_iter().map(|(range, team)| ShardAssignment {
                        range,
                        source: team,
                        dest: Vec::new(),
                    }));
                    begin = next_begin;
                }
                BatchOutcome::Failed => return Ok(None),
                BatchOutcome::RosterChanged => {}
                BatchOutcome::Empty => {
                    tokio::time::sleep(self.cfg.knobs.empty_batch_delay).await;
                }
            }
        }

        Ok(Some(assignments))
    }

    /// Issue one batch to the current roster. In a quiescent database every
    /// proxy must answer; otherwise the first reply wins and the rest are
    /// discarded.
    async fn run_batch(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        log: &mut AuditLog,
    ) -> BatchOutcome {
        let proxies = self.env.txn.proxies().await;
        let requests = proxies.iter().map(|proxy| {
            let rpc = proxy.rpc.clone();
            let begin = begin.to_vec();
            let end = end.to_vec();
            async move {
                reply_within(REPLY_DEADLINE, async {
                    rpc.get_key_servers_locations(&begin, &end, limit, false)
                        .await
                })
                .await
            }
        });

        tokio::select! {
            replies = join_all(requests) => {
                let mut inserted: Option<(Key, Vec<(KeyRange, Vec<ReplicaInterface>)>)> = None;
                for (proxy, reply) in proxies.iter().zip(replies) {
                    match reply {
                        None => {
                            if self.quiescent {
                                log.failure_event(
                                    AuditEvent::new("ConsistencyCheck_MasterProxyUnavailable")
                                        .detail("MasterProxyId", proxy.id),
                                );
                                log.test_failure("Master proxy unavailable");
                                return BatchOutcome::Failed;
                            }
                        }
                        Some(batch) if inserted.is_none() => {
                            // A batch without ranges cannot advance the
                            // cursor; treat it like no data.
                            if let Some(last) = batch.last() {
                                let next_begin = last.0.end.clone();
                                inserted = Some((next_begin, batch));
                                if !self.quiescent {
                                    // Only one proxy needs to answer.
                                    break;
                                }
                            }
                        }
                        Some(_) => {}
                    }
                }
                match inserted {
                    Some((next_begin, batch)) => BatchOutcome::Inserted { next_begin, batch },
                    None => BatchOutcome::Empty,
                }
            }
            _ = self.env.txn.proxies_changed() => BatchOutcome::RosterChanged,
        }
    }
}
