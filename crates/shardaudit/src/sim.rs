//! In-process simulated cluster implementing every collaborator seam.
//!
//! Tests and fixture-driven binary runs build a `SimCluster`, inject faults
//! (diverged rows, unreachable replicas, skewed estimates, stray data
//! stores), and run the auditor against it. One `SimCluster` value serves as
//! the transactional client, topology service, quiescence driver, and
//! simulator hook at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::keys::{
    all_keys, key_servers_key_for, key_servers_keys, server_list_key_for, with_prefix, Key,
    KeyRange, CONFIG_PREFIX,
};
use crate::model::{
    encode_key_servers_value, encode_server_list_value, GetKeyValuesReply, GetKeyValuesRequest,
    KeyValue, ProcessClass, ReplicaAddress, ReplicaDescriptor, ReplicaId, StorageMetrics,
    StoreType, Uid,
};
use crate::rpc::{
    ClusterEnv, ClusterRoles, ProxyInterface, ProxyRpc, QuietDatabase, ReplicaInterface,
    SimProcess, SimulatorHook, StorageRpc, TopologyService, TxnClient, WorkerFilter,
    WorkerInterface, WorkerRpc,
};

#[derive(Debug)]
struct SimReplica {
    id: ReplicaId,
    address: ReplicaAddress,
    store_type: StoreType,
    data: BTreeMap<Key, Vec<u8>>,
    /// Per-replica divergence of the system keyspace; `None` hides a row.
    system_delta: BTreeMap<Key, Option<Vec<u8>>>,
    reachable: bool,
    estimate_override: Option<i64>,
    input_queue_bytes: i64,
}

#[derive(Debug)]
struct SimWorker {
    address: ReplicaAddress,
    class: ProcessClass,
    disk_stores: Vec<Uid>,
    reachable: bool,
    failed: bool,
}

#[derive(Debug, Clone)]
struct SimShard {
    range: KeyRange,
    src: Vec<ReplicaId>,
    dest: Vec<ReplicaId>,
}

#[derive(Debug)]
struct SimProxy {
    id: Uid,
    reachable: bool,
}

struct SimState {
    simulated: bool,
    fault_injection: bool,
    spans_multiple_clusters: bool,
    version: AtomicI64,
    replicas: RwLock<BTreeMap<ReplicaId, SimReplica>>,
    workers: RwLock<Vec<SimWorker>>,
    shards: RwLock<Vec<SimShard>>,
    /// Teams serving the shard-map keyspace itself, by raw key range.
    directory_teams: RwLock<Vec<(KeyRange, Vec<ReplicaId>)>>,
    proxies: RwLock<Vec<SimProxy>>,
    config_rows: RwLock<Vec<(Key, Vec<u8>)>>,
    excluded: RwLock<BTreeSet<ReplicaAddress>>,
    unregistered_replicas: RwLock<BTreeSet<ReplicaId>>,
    roles: RwLock<ClusterRoles>,
    dd_queue: AtomicI64,
    tlog_queue: AtomicI64,
    quiet_fails: AtomicBool,
    storage_queue_unreadable: AtomicBool,
    time_keeper_disabled: AtomicBool,
    rebooted: Mutex<Vec<ReplicaAddress>>,
}

impl SimState {
    /// Canonical system keyspace: shard map, replica registrations, and
    /// configuration rows.
    fn system_rows(&self) -> BTreeMap<Key, Vec<u8>> {
        let mut rows = BTreeMap::new();

        let shards = self.shards.read().unwrap();
        for shard in shards.iter() {
            rows.insert(
                key_servers_key_for(&shard.range.begin),
                encode_key_servers_value(&shard.src, &shard.dest),
            );
        }
        rows.insert(key_servers_key_for(&all_keys().end), Vec::new());
        drop(shards);

        let replicas = self.replicas.read().unwrap();
        let unregistered = self.unregistered_replicas.read().unwrap();
        for replica in replicas.values() {
            if unregistered.contains(&replica.id) {
                continue;
            }
            rows.insert(
                server_list_key_for(replica.id),
                encode_server_list_value(&ReplicaDescriptor {
                    id: replica.id,
                    address: replica.address,
                }),
            );
        }
        drop(unregistered);
        drop(replicas);

        for (key, value) in self.config_rows.read().unwrap().iter() {
            rows.insert(key.clone(), value.clone());
        }

        rows
    }

    fn replica_interface(self: &Arc<Self>, id: ReplicaId) -> Option<ReplicaInterface> {
        let replicas = self.replicas.read().unwrap();
        let replica = replicas.get(&id)?;
        Some(ReplicaInterface {
            id,
            address: replica.address,
            rpc: Arc::new(SimStorageRpc {
                state: self.clone(),
                id,
            }),
        })
    }

    /// A replica's sampled-size estimate for a user range, mirroring what the
    /// store's own estimator would report.
    fn sampled_bytes(replica: &SimReplica, range: &KeyRange) -> i64 {
        replica
            .data
            .range(range.begin.clone()..range.end.clone())
            .map(|(key, value)| {
                let info = crate::sample::is_key_value_in_sample(&KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                });
                if info.in_sample {
                    info.sampled_size
                } else {
                    0
                }
            })
            .sum()
    }
}

struct SimStorageRpc {
    state: Arc<SimState>,
    id: ReplicaId,
}

#[async_trait]
impl StorageRpc for SimStorageRpc {
    async fn get_key_values(
        &self,
        req: &GetKeyValuesRequest,
    ) -> Result<GetKeyValuesReply, ClusterError> {
        let mut view = self.state.system_rows();
        let replicas = self.state.replicas.read().unwrap();
        let replica = replicas
            .get(&self.id)
            .ok_or_else(|| ClusterError::Unreachable(format!("replica {}", self.id)))?;
        if !replica.reachable {
            return Err(ClusterError::Unreachable(replica.address.to_string()));
        }

        for (key, delta) in &replica.system_delta {
            match delta {
                Some(value) => {
                    view.insert(key.clone(), value.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }
        for (key, value) in &replica.data {
            view.insert(key.clone(), value.clone());
        }

        let mut data = Vec::new();
        let mut bytes = 0usize;
        let mut more = false;
        let mut rows = view.range(req.begin.clone()..req.end.clone()).peekable();
        while let Some((key, value)) = rows.next() {
            bytes += key.len() + value.len();
            data.push(KeyValue {
                key: key.clone(),
                value: value.clone(),
            });
            if data.len() >= req.limit || bytes >= req.limit_bytes {
                more = rows.peek().is_some();
                break;
            }
        }

        Ok(GetKeyValuesReply { data, more })
    }

    async fn wait_metrics(
        &self,
        range: &KeyRange,
        _min_bytes: i64,
        _max_bytes: i64,
    ) -> Result<StorageMetrics, ClusterError> {
        let replicas = self.state.replicas.read().unwrap();
        let replica = replicas
            .get(&self.id)
            .ok_or_else(|| ClusterError::Unreachable(format!("replica {}", self.id)))?;
        if !replica.reachable {
            return Err(ClusterError::Unreachable(replica.address.to_string()));
        }
        let bytes = replica
            .estimate_override
            .unwrap_or_else(|| SimState::sampled_bytes(replica, range));
        Ok(StorageMetrics { bytes })
    }

    async fn kv_store_type(&self) -> Result<StoreType, ClusterError> {
        let replicas = self.state.replicas.read().unwrap();
        let replica = replicas
            .get(&self.id)
            .ok_or_else(|| ClusterError::Unreachable(format!("replica {}", self.id)))?;
        if !replica.reachable {
            return Err(ClusterError::Unreachable(replica.address.to_string()));
        }
        Ok(replica.store_type)
    }
}

struct SimProxyRpc {
    state: Arc<SimState>,
    index: usize,
}

#[async_trait]
impl ProxyRpc for SimProxyRpc {
    async fn get_key_servers_locations(
        &self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
        _reverse: bool,
    ) -> Result<Vec<(KeyRange, Vec<ReplicaInterface>)>, ClusterError> {
        {
            let proxies = self.state.proxies.read().unwrap();
            let proxy = proxies
                .get(self.index)
                .ok_or_else(|| ClusterError::Unreachable("proxy".into()))?;
            if !proxy.reachable {
                return Err(ClusterError::Unreachable(format!("proxy {}", proxy.id)));
            }
        }

        let teams = self.state.directory_teams.read().unwrap().clone();
        let mut results = Vec::new();
        for (range, team) in teams {
            if range.end.as_slice() <= begin || range.begin.as_slice() >= end {
                continue;
            }
            let clipped = KeyRange::new(
                range.begin.as_slice().max(begin).to_vec(),
                range.end.as_slice().min(end).to_vec(),
            );
            let interfaces = team
                .iter()
                .filter_map(|id| self.state.replica_interface(*id))
                .collect();
            results.push((clipped, interfaces));
            if results.len() >= limit {
                break;
            }
        }
        Ok(results)
    }
}

struct SimWorkerRpc {
    state: Arc<SimState>,
    address: ReplicaAddress,
}

#[async_trait]
impl WorkerRpc for SimWorkerRpc {
    async fn disk_stores(&self, _include_unused: bool) -> Result<Vec<Uid>, ClusterError> {
        let workers = self.state.workers.read().unwrap();
        let worker = workers
            .iter()
            .find(|w| w.address == self.address)
            .ok_or_else(|| ClusterError::Unreachable(self.address.to_string()))?;
        if !worker.reachable {
            return Err(ClusterError::Unreachable(self.address.to_string()));
        }
        Ok(worker.disk_stores.clone())
    }
}

/// Handle to a simulated cluster. Cloning shares the underlying state.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<SimState>,
}

#[async_trait]
impl TxnClient for SimCluster {
    async fn read_version(&self) -> Result<i64, ClusterError> {
        Ok(self.state.version.fetch_add(1, Ordering::SeqCst))
    }

    async fn get_range(
        &self,
        range: &KeyRange,
        limit: usize,
    ) -> Result<Vec<KeyValue>, ClusterError> {
        let rows = self.state.system_rows();
        Ok(rows
            .range(range.begin.clone()..range.end.clone())
            .take(limit)
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ClusterError> {
        Ok(self.state.system_rows().get(key).cloned())
    }

    async fn storage_metrics(
        &self,
        range: &KeyRange,
        _max_wait_bytes: i64,
    ) -> Result<StorageMetrics, ClusterError> {
        // Aggregate size: one representative replica per shard.
        let shards = self.state.shards.read().unwrap().clone();
        let replicas = self.state.replicas.read().unwrap();
        let mut bytes = 0;
        for shard in shards {
            let begin = shard.range.begin.clone().max(range.begin.clone());
            let end = shard.range.end.clone().min(range.end.clone());
            if begin >= end {
                continue;
            }
            if let Some(replica) = shard.src.first().and_then(|id| replicas.get(id)) {
                bytes += SimState::sampled_bytes(replica, &KeyRange::new(begin, end));
            }
        }
        Ok(StorageMetrics { bytes })
    }

    async fn proxies(&self) -> Vec<ProxyInterface> {
        let proxies = self.state.proxies.read().unwrap();
        proxies
            .iter()
            .enumerate()
            .map(|(index, proxy)| ProxyInterface {
                id: proxy.id,
                rpc: Arc::new(SimProxyRpc {
                    state: self.state.clone(),
                    index,
                }),
            })
            .collect()
    }

    async fn proxies_changed(&self) {
        // The simulated roster never changes mid-run.
        futures_util::future::pending::<()>().await;
    }
}

#[async_trait]
impl TopologyService for SimCluster {
    async fn get_workers(
        &self,
        filter: WorkerFilter,
    ) -> Result<Vec<(WorkerInterface, ProcessClass)>, ClusterError> {
        let excluded = self.state.excluded.read().unwrap().clone();
        let workers = self.state.workers.read().unwrap();
        Ok(workers
            .iter()
            .filter(|worker| {
                filter == WorkerFilter::All || !excluded.contains(&worker.address)
            })
            .map(|worker| {
                (
                    WorkerInterface {
                        address: worker.address,
                        rpc: Arc::new(SimWorkerRpc {
                            state: self.state.clone(),
                            address: worker.address,
                        }),
                    },
                    worker.class,
                )
            })
            .collect())
    }

    async fn get_storage_servers(&self) -> Result<Vec<ReplicaInterface>, ClusterError> {
        let ids: Vec<ReplicaId> = self.state.replicas.read().unwrap().keys().copied().collect();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.state.replica_interface(id))
            .collect())
    }

    async fn cluster_roles(&self) -> Result<ClusterRoles, ClusterError> {
        Ok(self.state.roles.read().unwrap().clone())
    }

    fn connect(&self, descriptor: &ReplicaDescriptor) -> Option<ReplicaInterface> {
        self.state.replica_interface(descriptor.id)
    }
}

#[async_trait]
impl QuietDatabase for SimCluster {
    async fn quiet_database(
        &self,
        _phase: &str,
        _max_data_distribution_queue: i64,
        _max_tlog_queue: i64,
    ) -> Result<(), ClusterError> {
        // Queue sizes are sampled later by the structural checks; quiescence
        // itself only fails when the driver is wedged.
        if self.state.quiet_fails.load(Ordering::SeqCst) {
            return Err(ClusterError::Timeout("data distribution still active".into()));
        }
        Ok(())
    }

    async fn data_distribution_queue_size(&self) -> Result<i64, ClusterError> {
        Ok(self.state.dd_queue.load(Ordering::SeqCst))
    }

    async fn max_tlog_queue_size(&self) -> Result<i64, ClusterError> {
        Ok(self.state.tlog_queue.load(Ordering::SeqCst))
    }

    async fn max_storage_queue_size(&self) -> Result<i64, ClusterError> {
        if self.state.storage_queue_unreadable.load(Ordering::SeqCst) {
            return Err(ClusterError::AttributeNotFound);
        }
        let replicas = self.state.replicas.read().unwrap();
        Ok(replicas
            .values()
            .map(|replica| replica.input_queue_bytes)
            .max()
            .unwrap_or(0))
    }

    async fn disable_time_keeper(&self) -> Result<(), ClusterError> {
        self.state.time_keeper_disabled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl SimulatorHook for SimCluster {
    fn is_simulated(&self) -> bool {
        self.state.simulated
    }

    fn reboot_process(&self, address: ReplicaAddress) {
        self.state.rebooted.lock().unwrap().push(address);
    }

    fn processes(&self) -> Vec<SimProcess> {
        let workers = self.state.workers.read().unwrap();
        workers
            .iter()
            .map(|worker| SimProcess {
                address: worker.address,
                reliable: true,
                server: true,
                tester: worker.class == ProcessClass::Tester,
                failed: worker.failed,
            })
            .collect()
    }

    fn spans_multiple_clusters(&self) -> bool {
        self.state.spans_multiple_clusters
    }

    fn fault_injection(&self) -> bool {
        self.state.fault_injection
    }
}

impl SimCluster {
    pub fn builder() -> SimClusterBuilder {
        SimClusterBuilder::default()
    }

    /// Bundle this cluster's seams into an auditor environment.
    pub fn env(&self) -> ClusterEnv {
        ClusterEnv {
            txn: Arc::new(self.clone()),
            topology: Arc::new(self.clone()),
            quiet: Arc::new(self.clone()),
            sim: Arc::new(self.clone()),
        }
    }

    pub fn set_replica_row(&self, id: ReplicaId, key: &[u8], value: &[u8]) {
        if let Some(replica) = self.state.replicas.write().unwrap().get_mut(&id) {
            replica.data.insert(key.to_vec(), value.to_vec());
        }
    }

    pub fn remove_replica_row(&self, id: ReplicaId, key: &[u8]) {
        if let Some(replica) = self.state.replicas.write().unwrap().get_mut(&id) {
            replica.data.remove(key);
        }
    }

    /// Diverge one replica's copy of a system row; `None` hides the row.
    pub fn set_system_delta(&self, id: ReplicaId, key: &[u8], value: Option<Vec<u8>>) {
        if let Some(replica) = self.state.replicas.write().unwrap().get_mut(&id) {
            replica.system_delta.insert(key.to_vec(), value);
        }
    }

    pub fn set_unreachable(&self, id: ReplicaId) {
        if let Some(replica) = self.state.replicas.write().unwrap().get_mut(&id) {
            replica.reachable = false;
        }
    }

    pub fn set_estimate_override(&self, id: ReplicaId, bytes: i64) {
        if let Some(replica) = self.state.replicas.write().unwrap().get_mut(&id) {
            replica.estimate_override = Some(bytes);
        }
    }

    pub fn set_replica_queue_bytes(&self, id: ReplicaId, bytes: i64) {
        if let Some(replica) = self.state.replicas.write().unwrap().get_mut(&id) {
            replica.input_queue_bytes = bytes;
        }
    }

    pub fn set_data_distribution_queue(&self, size: i64) {
        self.state.dd_queue.store(size, Ordering::SeqCst);
    }

    pub fn set_tlog_queue(&self, bytes: i64) {
        self.state.tlog_queue.store(bytes, Ordering::SeqCst);
    }

    pub fn set_quiet_database_fails(&self, fails: bool) {
        self.state.quiet_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_storage_queue_unreadable(&self, unreadable: bool) {
        self.state
            .storage_queue_unreadable
            .store(unreadable, Ordering::SeqCst);
    }

    /// Drop a replica's registration row while keeping the process around.
    pub fn unregister_replica(&self, id: ReplicaId) {
        self.state.unregistered_replicas.write().unwrap().insert(id);
    }

    pub fn add_disk_store(&self, address: ReplicaAddress, id: Uid) {
        let mut workers = self.state.workers.write().unwrap();
        if let Some(worker) = workers.iter_mut().find(|w| w.address == address) {
            worker.disk_stores.push(id);
        }
    }

    pub fn set_worker_failed(&self, address: ReplicaAddress) {
        let mut workers = self.state.workers.write().unwrap();
        if let Some(worker) = workers.iter_mut().find(|w| w.address == address) {
            worker.failed = true;
        }
    }

    pub fn set_proxy_unreachable(&self, index: usize) {
        if let Some(proxy) = self.state.proxies.write().unwrap().get_mut(index) {
            proxy.reachable = false;
        }
    }

    pub fn rebooted_processes(&self) -> Vec<ReplicaAddress> {
        self.state.rebooted.lock().unwrap().clone()
    }

    pub fn time_keeper_disabled(&self) -> bool {
        self.state.time_keeper_disabled.load(Ordering::SeqCst)
    }
}

/// Builds a simulated cluster. Defaults are a healthy single-cluster
/// topology: one Storage-class worker per replica address, every replica's
/// on-disk stores matching its registrations, and one proxy.
pub struct SimClusterBuilder {
    simulated: bool,
    fault_injection: bool,
    spans_multiple_clusters: bool,
    storage_team_size: usize,
    storage_engine: StoreType,
    excluded: BTreeSet<ReplicaAddress>,
    replicas: Vec<(ReplicaId, ReplicaAddress, StoreType, BTreeMap<Key, Vec<u8>>)>,
    shards: Vec<SimShard>,
    workers: Option<Vec<(ReplicaAddress, ProcessClass)>>,
    roles: Option<ClusterRoles>,
    proxy_count: usize,
}

impl Default for SimClusterBuilder {
    fn default() -> Self {
        Self {
            simulated: true,
            fault_injection: false,
            spans_multiple_clusters: false,
            storage_team_size: 1,
            storage_engine: StoreType::Ssd,
            excluded: BTreeSet::new(),
            replicas: Vec::new(),
            shards: Vec::new(),
            workers: None,
            roles: None,
            proxy_count: 1,
        }
    }
}

impl SimClusterBuilder {
    pub fn simulated(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    pub fn fault_injection(mut self, enabled: bool) -> Self {
        self.fault_injection = enabled;
        self
    }

    pub fn spans_multiple_clusters(mut self, spans: bool) -> Self {
        self.spans_multiple_clusters = spans;
        self
    }

    pub fn storage_team_size(mut self, size: usize) -> Self {
        self.storage_team_size = size;
        self
    }

    pub fn storage_engine(mut self, engine: StoreType) -> Self {
        self.storage_engine = engine;
        self
    }

    pub fn exclude_address(mut self, address: ReplicaAddress) -> Self {
        self.excluded.insert(address);
        self
    }

    pub fn proxy_count(mut self, count: usize) -> Self {
        self.proxy_count = count.max(1);
        self
    }

    pub fn replica(mut self, id: u64, address: &str) -> Self {
        self.replicas.push((
            Uid(id),
            address.parse().expect("valid replica address"),
            self.storage_engine,
            BTreeMap::new(),
        ));
        self
    }

    pub fn replica_with_store(mut self, id: u64, address: &str, store_type: StoreType) -> Self {
        self.replicas.push((
            Uid(id),
            address.parse().expect("valid replica address"),
            store_type,
            BTreeMap::new(),
        ));
        self
    }

    /// Install the same rows on every listed replica.
    pub fn rows(mut self, replica_ids: &[u64], rows: &[(&[u8], &[u8])]) -> Self {
        for (id, _, _, data) in &mut self.replicas {
            if replica_ids.contains(&id.0) {
                for (key, value) in rows {
                    data.insert(key.to_vec(), value.to_vec());
                }
            }
        }
        self
    }

    /// Declare a shard; an empty `end` means the top of the user keyspace.
    pub fn shard(mut self, begin: &[u8], end: &[u8], src: &[u64], dest: &[u64]) -> Self {
        let end = if end.is_empty() {
            all_keys().end
        } else {
            end.to_vec()
        };
        self.shards.push(SimShard {
            range: KeyRange::new(begin.to_vec(), end),
            src: src.iter().copied().map(Uid).collect(),
            dest: dest.iter().copied().map(Uid).collect(),
        });
        self
    }

    pub fn worker(mut self, address: &str, class: ProcessClass) -> Self {
        self.workers
            .get_or_insert_with(Vec::new)
            .push((address.parse().expect("valid worker address"), class));
        self
    }

    pub fn roles(mut self, roles: ClusterRoles) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn build(self) -> SimCluster {
        let mut replicas = BTreeMap::new();
        for (id, address, store_type, data) in self.replicas {
            replicas.insert(
                id,
                SimReplica {
                    id,
                    address,
                    store_type,
                    data,
                    system_delta: BTreeMap::new(),
                    reachable: true,
                    estimate_override: None,
                    input_queue_bytes: 0,
                },
            );
        }

        // Default workers: one Storage-class process per replica address.
        let workers: Vec<(ReplicaAddress, ProcessClass)> = self.workers.unwrap_or_else(|| {
            let addresses: BTreeSet<ReplicaAddress> =
                replicas.values().map(|r| r.address).collect();
            addresses
                .into_iter()
                .map(|address| (address, ProcessClass::Storage))
                .collect()
        });

        let workers: Vec<SimWorker> = workers
            .into_iter()
            .map(|(address, class)| SimWorker {
                address,
                class,
                disk_stores: replicas
                    .values()
                    .filter(|replica| replica.address == address)
                    .map(|replica| replica.id)
                    .collect(),
                reachable: true,
                failed: false,
            })
            .collect();

        let roles = self.roles.unwrap_or_else(|| {
            let first = workers
                .first()
                .map(|worker| worker.address)
                .unwrap_or_else(|| "127.0.0.1:1".parse().expect("fallback address"));
            ClusterRoles {
                cluster_controller: first,
                master: first,
                proxies: Vec::new(),
                resolvers: Vec::new(),
                logs: Vec::new(),
            }
        });

        let all_ids: Vec<ReplicaId> = replicas.keys().copied().collect();
        let directory_teams = vec![(key_servers_keys(), all_ids)];

        let mut config_rows: Vec<(Key, Vec<u8>)> = vec![
            (
                with_prefix(CONFIG_PREFIX, b"storage_team_size"),
                self.storage_team_size.to_string().into_bytes(),
            ),
            (
                with_prefix(CONFIG_PREFIX, b"storage_engine"),
                self.storage_engine.to_string().into_bytes(),
            ),
        ];
        for address in &self.excluded {
            config_rows.push((
                with_prefix(CONFIG_PREFIX, format!("excluded/{address}").as_bytes()),
                Vec::new(),
            ));
        }

        let proxies = (0..self.proxy_count)
            .map(|i| SimProxy {
                id: Uid(proxy_id_base() + i as u64),
                reachable: true,
            })
            .collect();

        SimCluster {
            state: Arc::new(SimState {
                simulated: self.simulated,
                fault_injection: self.fault_injection,
                spans_multiple_clusters: self.spans_multiple_clusters,
                version: AtomicI64::new(1),
                replicas: RwLock::new(replicas),
                workers: RwLock::new(workers),
                shards: RwLock::new(self.shards),
                directory_teams: RwLock::new(directory_teams),
                proxies: RwLock::new(proxies),
                config_rows: RwLock::new(config_rows),
                excluded: RwLock::new(self.excluded),
                unregistered_replicas: RwLock::new(BTreeSet::new()),
                roles: RwLock::new(roles),
                dd_queue: AtomicI64::new(0),
                tlog_queue: AtomicI64::new(0),
                quiet_fails: AtomicBool::new(false),
                storage_queue_unreadable: AtomicBool::new(false),
                time_keeper_disabled: AtomicBool::new(false),
                rebooted: Mutex::new(Vec::new()),
            }),
        }
    }
}

fn proxy_id_base() -> u64 {
    0x7000_0000
}

/// Declarative cluster description loadable from JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterFixture {
    #[serde(default = "default_true")]
    pub simulated: bool,
    #[serde(default)]
    pub fault_injection: bool,
    pub storage_team_size: usize,
    pub storage_engine: StoreType,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default = "default_proxy_count")]
    pub proxy_count: usize,
    pub replicas: Vec<ReplicaFixture>,
    pub shards: Vec<ShardFixture>,
    #[serde(default)]
    pub workers: Vec<WorkerFixture>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicaFixture {
    pub id: u64,
    pub address: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardFixture {
    pub begin: String,
    /// Empty means the top of the user keyspace.
    #[serde(default)]
    pub end: String,
    pub src: Vec<u64>,
    #[serde(default)]
    pub dest: Vec<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerFixture {
    pub address: String,
    pub class: ProcessClass,
}

fn default_true() -> bool {
    true
}

fn default_proxy_count() -> usize {
    1
}

impl SimCluster {
    pub fn from_fixture(fixture: &ClusterFixture) -> anyhow::Result<SimCluster> {
        let mut builder = SimCluster::builder()
            .simulated(fixture.simulated)
            .fault_injection(fixture.fault_injection)
            .storage_team_size(fixture.storage_team_size)
            .storage_engine(fixture.storage_engine)
            .proxy_count(fixture.proxy_count);

        for address in &fixture.excluded {
            builder = builder.exclude_address(
                address
                    .parse()
                    .map_err(|err| anyhow::anyhow!("invalid excluded address {address}: {err}"))?,
            );
        }

        for replica in &fixture.replicas {
            replica.address.parse::<ReplicaAddress>().map_err(|err| {
                anyhow::anyhow!("invalid replica address {}: {err}", replica.address)
            })?;
            builder = builder.replica(replica.id, &replica.address);
            let rows: Vec<(&[u8], &[u8])> = replica
                .data
                .iter()
                .map(|(key, value)| (key.as_bytes(), value.as_bytes()))
                .collect();
            builder = builder.rows(&[replica.id], &rows);
        }

        for shard in &fixture.shards {
            builder = builder.shard(
                shard.begin.as_bytes(),
                shard.end.as_bytes(),
                &shard.src,
                &shard.dest,
            );
        }

        for worker in &fixture.workers {
            worker.address.parse::<ReplicaAddress>().map_err(|err| {
                anyhow::anyhow!("invalid worker address {}: {err}", worker.address)
            })?;
            builder = builder.worker(&worker.address, worker.class);
        }

        Ok(builder.build())
    }
}
