//! Trait seams for every external collaborator the auditor talks to.
//!
//! Production deployments supply network-backed implementations of these
//! traits; the in-process simulation in [`crate::sim`] implements the same
//! contracts for tests and fixture-driven runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClusterError;
use crate::keys::KeyRange;
use crate::model::{
    GetKeyValuesReply, GetKeyValuesRequest, KeyValue, ProcessClass, ReplicaAddress,
    ReplicaDescriptor, ReplicaId, StorageMetrics, StoreType, Uid, Version,
};

/// Soft deadline for any single replica RPC; a reply that does not arrive in
/// time is treated as absent by the caller's quiescent/non-quiescent policy.
pub const REPLY_DEADLINE: Duration = Duration::from_secs(2);

/// RPC endpoints served by one storage replica.
#[async_trait]
pub trait StorageRpc: Send + Sync {
    async fn get_key_values(
        &self,
        req: &GetKeyValuesRequest,
    ) -> Result<GetKeyValuesReply, ClusterError>;

    /// Report the replica's size estimate for a range once it falls inside
    /// `[min_bytes, max_bytes]`; `max_bytes = -1` means "any size".
    async fn wait_metrics(
        &self,
        range: &KeyRange,
        min_bytes: i64,
        max_bytes: i64,
    ) -> Result<StorageMetrics, ClusterError>;

    async fn kv_store_type(&self) -> Result<StoreType, ClusterError>;
}

/// A storage replica: identity, endpoint, and its callable RPCs.
#[derive(Clone)]
pub struct ReplicaInterface {
    pub id: ReplicaId,
    pub address: ReplicaAddress,
    pub rpc: Arc<dyn StorageRpc>,
}

impl std::fmt::Debug for ReplicaInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaInterface")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

/// Directory RPC served by a control-plane proxy.
#[async_trait]
pub trait ProxyRpc: Send + Sync {
    async fn get_key_servers_locations(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<(KeyRange, Vec<ReplicaInterface>)>, ClusterError>;
}

#[derive(Clone)]
pub struct ProxyInterface {
    pub id: Uid,
    pub rpc: Arc<dyn ProxyRpc>,
}

impl std::fmt::Debug for ProxyInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInterface").field("id", &self.id).finish()
    }
}

/// Per-worker RPC used by the structural checks.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Enumerate the on-disk store UIDs present on this worker.
    async fn disk_stores(&self, include_unused: bool) -> Result<Vec<Uid>, ClusterError>;
}

#[derive(Clone)]
pub struct WorkerInterface {
    pub address: ReplicaAddress,
    pub rpc: Arc<dyn WorkerRpc>,
}

impl std::fmt::Debug for WorkerInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInterface")
            .field("address", &self.address)
            .finish()
    }
}

/// Transactional client supplying read versions and system-keyspace reads.
#[async_trait]
pub trait TxnClient: Send + Sync {
    async fn read_version(&self) -> Result<Version, ClusterError>;

    /// Snapshot read of a system keyspace range, at most `limit` rows.
    async fn get_range(
        &self,
        range: &KeyRange,
        limit: usize,
    ) -> Result<Vec<KeyValue>, ClusterError>;

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ClusterError>;

    /// Aggregate size metrics for a range, waiting out at most
    /// `max_wait_bytes` of imprecision.
    async fn storage_metrics(
        &self,
        range: &KeyRange,
        max_wait_bytes: i64,
    ) -> Result<StorageMetrics, ClusterError>;

    /// Current control-plane proxy roster.
    async fn proxies(&self) -> Vec<ProxyInterface>;

    /// Resolves when the proxy roster changes; used to abandon in-flight
    /// directory batches.
    async fn proxies_changed(&self);
}

/// Worker roster filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFilter {
    All,
    NonExcluded,
}

/// Transaction-log endpoint descriptor.
#[derive(Debug, Clone, Copy)]
pub struct LogDescriptor {
    pub id: Uid,
    pub address: ReplicaAddress,
}

/// Live holders of the singleton cluster roles.
#[derive(Debug, Clone)]
pub struct ClusterRoles {
    pub cluster_controller: ReplicaAddress,
    pub master: ReplicaAddress,
    pub proxies: Vec<ReplicaAddress>,
    pub resolvers: Vec<ReplicaAddress>,
    pub logs: Vec<LogDescriptor>,
}

/// Cluster membership and topology service.
#[async_trait]
pub trait TopologyService: Send + Sync {
    async fn get_workers(
        &self,
        filter: WorkerFilter,
    ) -> Result<Vec<(WorkerInterface, ProcessClass)>, ClusterError>;

    async fn get_storage_servers(&self) -> Result<Vec<ReplicaInterface>, ClusterError>;

    async fn cluster_roles(&self) -> Result<ClusterRoles, ClusterError>;

    /// Materialize the callable interface for a directory registration.
    fn connect(&self, descriptor: &ReplicaDescriptor) -> Option<ReplicaInterface>;
}

/// Quiescence driver and server-side queue probes.
#[async_trait]
pub trait QuietDatabase: Send + Sync {
    /// Drive the cluster to a quiet state: stop data distribution and wait
    /// for in-flight movement and queues to drain under the given bounds.
    async fn quiet_database(
        &self,
        phase: &str,
        max_data_distribution_queue: i64,
        max_tlog_queue: i64,
    ) -> Result<(), ClusterError>;

    async fn data_distribution_queue_size(&self) -> Result<i64, ClusterError>;

    async fn max_tlog_queue_size(&self) -> Result<i64, ClusterError>;

    async fn max_storage_queue_size(&self) -> Result<i64, ClusterError>;

    /// Stop the time-keeper mutation source so it cannot dirty a quiet
    /// database (simulation only).
    async fn disable_time_keeper(&self) -> Result<(), ClusterError>;
}

/// One process in the simulated roster.
#[derive(Debug, Clone, Copy)]
pub struct SimProcess {
    pub address: ReplicaAddress,
    pub reliable: bool,
    pub server: bool,
    pub tester: bool,
    pub failed: bool,
}

/// Capability interface over the simulator; production passes [`NoSimulation`].
pub trait SimulatorHook: Send + Sync {
    fn is_simulated(&self) -> bool;

    fn reboot_process(&self, address: ReplicaAddress);

    /// Full simulated process roster, for worker-list agreement checks.
    fn processes(&self) -> Vec<SimProcess>;

    /// True when the simulation hosts more than one cluster, which makes the
    /// worker-list agreement check meaningless.
    fn spans_multiple_clusters(&self) -> bool;

    /// Fault-injection mode; shrinks directory batches to stress resumption.
    fn fault_injection(&self) -> bool;
}

/// Production no-op simulator capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSimulation;

impl SimulatorHook for NoSimulation {
    fn is_simulated(&self) -> bool {
        false
    }

    fn reboot_process(&self, _address: ReplicaAddress) {}

    fn processes(&self) -> Vec<SimProcess> {
        Vec::new()
    }

    fn spans_multiple_clusters(&self) -> bool {
        false
    }

    fn fault_injection(&self) -> bool {
        false
    }
}

/// Bundle of every collaborator handle an audit client needs.
#[derive(Clone)]
pub struct ClusterEnv {
    pub txn: Arc<dyn TxnClient>,
    pub topology: Arc<dyn TopologyService>,
    pub quiet: Arc<dyn QuietDatabase>,
    pub sim: Arc<dyn SimulatorHook>,
}

/// Await a reply under the fail-fast deadline; errors and timeouts both count
/// as an absent reply.
pub async fn reply_within<T, F>(deadline: Duration, fut: F) -> Option<T>
where
    F: std::future::Future<Output = Result<T, ClusterError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) | Err(_) => None,
    }
}

/// Retry a transactional operation until it stops failing with a transient
/// error, backing off between attempts.
pub async fn with_txn_retry<T, F, Fut>(mut op: F) -> Result<T, ClusterError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClusterError>>,
{
    let mut backoff = Duration::from_millis(10);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn reply_within_masks_errors_and_timeouts() {
        let ok = reply_within(REPLY_DEADLINE, async { Ok::<_, ClusterError>(7) }).await;
        assert_eq!(ok, Some(7));

        let err = reply_within(REPLY_DEADLINE, async {
            Err::<i32, _>(ClusterError::Unreachable("down".into()))
        })
        .await;
        assert_eq!(err, None);

        let slow = reply_within(REPLY_DEADLINE, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ClusterError>(1)
        })
        .await;
        assert_eq!(slow, None);
    }

    #[tokio::test(start_paused = true)]
    async fn txn_retry_retries_transient_errors_only() {
        let attempts = AtomicUsize::new(0);
        let result = with_txn_retry(|| async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ClusterError::TransactionTooOld)
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let fatal = with_txn_retry(|| async {
            Err::<(), _>(ClusterError::Internal("nope".into()))
        })
        .await;
        assert_eq!(fatal, Err(ClusterError::Internal("nope".into())));
    }
}
