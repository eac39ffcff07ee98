//! Structural health checks that only hold against a quiet database:
//! replica placement, store engines, queue drains, on-disk store inventory,
//! and process-class fitness.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ClusterError;
use crate::events::{AuditEvent, AuditLog};
use crate::model::{
    ClusterConfiguration, ClusterRole, Fitness, ProcessClass, ReplicaAddress, Uid,
};
use crate::rpc::{reply_within, ClusterEnv, WorkerFilter, REPLY_DEADLINE};
use crate::CheckConfig;

/// Runs the quiescent structural sub-checks. Each records its own failure and
/// the sequence keeps going, so one broken process does not hide the rest.
pub struct TopologyAuditor<'a> {
    env: &'a ClusterEnv,
    cfg: &'a CheckConfig,
}

impl<'a> TopologyAuditor<'a> {
    pub fn new(env: &'a ClusterEnv, cfg: &'a CheckConfig) -> Self {
        Self { env, cfg }
    }

    pub async fn run(
        &self,
        configuration: &ClusterConfiguration,
        log: &mut AuditLog,
    ) -> Result<(), ClusterError> {
        let has_undesirable_servers = self.check_undesirable_servers(configuration, log).await?;

        let in_flight = self.env.quiet.data_distribution_queue_size().await?;
        if in_flight > 0 {
            log.failure_event(
                AuditEvent::new("ConsistencyCheck_NonZeroDataDistributionQueue")
                    .detail("QueueSize", in_flight),
            );
            log.test_failure("Non-zero data distribution queue/in-flight size");
        }

        let max_tlog_queue = self.env.quiet.max_tlog_queue_size().await?;
        if max_tlog_queue > self.cfg.knobs.max_tlog_queue_bytes {
            log.failure_event(
                AuditEvent::new("ConsistencyCheck_NonZeroTLogQueue")
                    .detail("MaxQueueSize", max_tlog_queue),
            );
            log.test_failure("Non-zero tlog queue size");
        }

        match self.env.quiet.max_storage_queue_size().await {
            Ok(max_storage_queue) => {
                if max_storage_queue > 0 {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_NonZeroStorageServerQueue")
                            .detail("MaxQueueSize", max_storage_queue),
                    );
                    log.test_failure("Non-zero storage server queue size");
                }
            }
            Err(ClusterError::AttributeNotFound) => {
                log.info(
                    AuditEvent::new("ConsistencyCheck_StorageQueueSizeError")
                        .detail("Reason", "Could not read queue size"),
                );
                // An undesirable server already explains the unreadable
                // queue; report only the root cause.
                if !has_undesirable_servers {
                    log.test_failure("Could not read storage queue size");
                }
            }
            Err(err) => return Err(err),
        }

        self.check_for_storage(configuration, log).await?;
        self.check_extra_data_stores(log).await?;

        if !self.check_desired_classes(log).await? {
            log.test_failure("Cluster has machine(s) not using requested classes");
        }

        if !self.check_worker_list(log).await? {
            log.test_failure("Worker list incorrect");
        }

        Ok(())
    }

    /// Flag storage replicas sharing a network address or running the wrong
    /// store engine. Returns true when any undesirable server was found.
    async fn check_undesirable_servers(
        &self,
        configuration: &ClusterConfiguration,
        log: &mut AuditLog,
    ) -> Result<bool, ClusterError> {
        let storage_servers = self.env.topology.get_storage_servers().await?;

        for (i, server) in storage_servers.iter().enumerate() {
            let store_type =
                reply_within(REPLY_DEADLINE, async { server.rpc.kv_store_type().await }).await;
            match store_type {
                None => {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_ServerUnavailable")
                            .detail("ServerId", server.id),
                    );
                    log.test_failure("Storage server unavailable");
                }
                Some(store_type) if store_type != configuration.storage_server_store_type => {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_WrongKeyValueStoreType")
                            .detail("ServerId", server.id)
                            .detail("StoreType", store_type)
                            .detail("DesiredType", configuration.storage_server_store_type),
                    );
                    log.test_failure("Storage server has wrong key-value store type");
                    return Ok(true);
                }
                Some(_) => {}
            }

            for other in &storage_servers[i + 1..] {
                if server.address == other.address {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_UndesirableServer")
                            .detail("StorageServer1", server.id)
                            .detail("StorageServer2", other.id)
                            .detail("Address", server.address),
                    );
                    log.test_failure("Multiple storage servers have the same address");
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Every non-excluded worker eligible for storage must actually host a
    /// replica.
    async fn check_for_storage(
        &self,
        configuration: &ClusterConfiguration,
        log: &mut AuditLog,
    ) -> Result<(), ClusterError> {
        let workers = self.env.topology.get_workers(WorkerFilter::All).await?;
        let storage_servers = self.env.topology.get_storage_servers().await?;
        let storage_addresses: BTreeSet<ReplicaAddress> =
            storage_servers.iter().map(|s| s.address).collect();

        for (worker, class) in &workers {
            let eligible =
                matches!(class, ProcessClass::Storage | ProcessClass::Unset);
            if !configuration.is_excluded(&worker.address)
                && eligible
                && !storage_addresses.contains(&worker.address)
            {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_NoStorage")
                        .detail("Address", worker.address),
                );
                log.test_failure("No storage server on worker");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Every on-disk store on every worker must belong to a registered
    /// storage replica or transaction log at that address.
    async fn check_extra_data_stores(&self, log: &mut AuditLog) -> Result<(), ClusterError> {
        let workers = self.env.topology.get_workers(WorkerFilter::All).await?;
        let storage_servers = self.env.topology.get_storage_servers().await?;
        let roles = self.env.topology.cluster_roles().await?;

        let mut stateful: BTreeMap<ReplicaAddress, BTreeSet<Uid>> = BTreeMap::new();
        for server in &storage_servers {
            stateful.entry(server.address).or_default().insert(server.id);
        }
        for tlog in &roles.logs {
            stateful.entry(tlog.address).or_default().insert(tlog.id);
        }

        let mut found_extra_store = false;
        for (worker, _) in &workers {
            let stores =
                reply_within(REPLY_DEADLINE, async { worker.rpc.disk_stores(false).await })
                    .await;
            let Some(stores) = stores else {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_GetDataStoreFailure")
                        .detail("Address", worker.address),
                );
                log.test_failure("Failed to get data stores");
                return Ok(());
            };

            for id in stores {
                let owned = stateful
                    .get(&worker.address)
                    .is_some_and(|ids| ids.contains(&id));
                if !owned {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_ExtraDataStore")
                            .detail("Address", worker.address)
                            .detail("DataStoreId", id),
                    );
                    if self.env.sim.is_simulated() {
                        log.info(
                            AuditEvent::new("ConsistencyCheck_RebootProcess")
                                .detail("Address", worker.address)
                                .detail("DataStoreId", id),
                        );
                        self.env.sim.reboot_process(worker.address);
                    }
                    found_extra_store = true;
                }
            }
        }

        if found_extra_store {
            log.test_failure("Extra data stores present on workers");
        }
        Ok(())
    }

    /// Every singleton role holder must have the best fitness achievable from
    /// the non-excluded class pool.
    async fn check_desired_classes(&self, log: &mut AuditLog) -> Result<bool, ClusterError> {
        let all_workers = self.env.topology.get_workers(WorkerFilter::All).await?;
        let non_excluded = self
            .env
            .topology
            .get_workers(WorkerFilter::NonExcluded)
            .await?;
        let roles = self.env.topology.cluster_roles().await?;

        let all_classes: BTreeSet<ProcessClass> =
            all_workers.iter().map(|(_, class)| *class).collect();
        let all_map: BTreeMap<ReplicaAddress, ProcessClass> = all_workers
            .iter()
            .map(|(worker, class)| (worker.address, *class))
            .collect();

        let non_excluded_classes: BTreeSet<ProcessClass> =
            non_excluded.iter().map(|(_, class)| *class).collect();
        let non_excluded_map: BTreeMap<ReplicaAddress, ProcessClass> = non_excluded
            .iter()
            .map(|(worker, class)| (worker.address, *class))
            .collect();

        let best_cc = best_available_fitness(&non_excluded_classes, ClusterRole::ClusterController);
        let cc_fitness = non_excluded_map
            .get(&roles.cluster_controller)
            .map(|class| class.machine_class_fitness(ClusterRole::ClusterController));
        if cc_fitness != Some(best_cc) {
            log.failure_event(
                AuditEvent::new("ConsistencyCheck_ClusterControllerNotBest")
                    .detail("BestClusterControllerFitness", format!("{best_cc:?}"))
                    .detail("ExistingFitness", format!("{cc_fitness:?}")),
            );
            return Ok(false);
        }

        // Master has a fallback: when no non-excluded class could ever host
        // it, the best class from the full pool is acceptable at ExcludeFit.
        let mut best_master = best_available_fitness(&non_excluded_classes, ClusterRole::Master);
        if best_master == Fitness::NeverAssign
            && best_available_fitness(&all_classes, ClusterRole::Master) != Fitness::NeverAssign
        {
            best_master = Fitness::ExcludeFit;
        }

        let master_ok = match non_excluded_map.get(&roles.master) {
            Some(class) => class.machine_class_fitness(ClusterRole::Master) == best_master,
            None => best_master == Fitness::ExcludeFit && all_map.contains_key(&roles.master),
        };
        if !master_ok {
            log.failure_event(
                AuditEvent::new("ConsistencyCheck_MasterNotBest")
                    .detail("BestMasterFitness", format!("{best_master:?}"))
                    .detail(
                        "ExistingFitness",
                        format!("{:?}", non_excluded_map.get(&roles.master)),
                    ),
            );
            return Ok(false);
        }

        let best_proxy = best_available_fitness(&non_excluded_classes, ClusterRole::Proxy);
        for proxy in &roles.proxies {
            let fitness = non_excluded_map
                .get(proxy)
                .map(|class| class.machine_class_fitness(ClusterRole::Proxy));
            if fitness != Some(best_proxy) {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_ProxyNotBest")
                        .detail("BestProxyFitness", format!("{best_proxy:?}"))
                        .detail("ExistingFitness", format!("{fitness:?}")),
                );
                return Ok(false);
            }
        }

        let best_resolver = best_available_fitness(&non_excluded_classes, ClusterRole::Resolver);
        for resolver in &roles.resolvers {
            let fitness = non_excluded_map
                .get(resolver)
                .map(|class| class.machine_class_fitness(ClusterRole::Resolver));
            if fitness != Some(best_resolver) {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_ResolverNotBest")
                        .detail("BestResolverFitness", format!("{best_resolver:?}"))
                        .detail("ExistingFitness", format!("{fitness:?}")),
                );
                return Ok(false);
            }
        }

        // TODO: check transaction log fitness once log workers report a
        // process class through the topology service.

        Ok(true)
    }

    /// Simulation only: the topology service's worker list must match the
    /// simulated roster address-for-address.
    async fn check_worker_list(&self, log: &mut AuditLog) -> Result<bool, ClusterError> {
        if !self.env.sim.is_simulated() || self.env.sim.spans_multiple_clusters() {
            return Ok(true);
        }

        let workers = self.env.topology.get_workers(WorkerFilter::All).await?;
        let processes = self.env.sim.processes();

        let mut worker_addresses = BTreeSet::new();
        for (worker, _) in &workers {
            let process = processes.iter().find(|p| p.address == worker.address);
            match process {
                None => {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_FailedWorkerInList")
                            .detail("Address", worker.address),
                    );
                    return Ok(false);
                }
                Some(process) if process.failed => {
                    log.failure_event(
                        AuditEvent::new("ConsistencyCheck_FailedWorkerInList")
                            .detail("Address", worker.address),
                    );
                    return Ok(false);
                }
                Some(_) => {
                    worker_addresses.insert(worker.address);
                }
            }
        }

        for process in &processes {
            if process.reliable
                && process.server
                && !process.tester
                && !worker_addresses.contains(&process.address)
            {
                log.failure_event(
                    AuditEvent::new("ConsistencyCheck_WorkerMissingFromList")
                        .detail("Address", process.address),
                );
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Best fitness any class in the pool can offer for a role.
fn best_available_fitness(classes: &BTreeSet<ProcessClass>, role: ClusterRole) -> Fitness {
    classes
        .iter()
        .map(|class| class.machine_class_fitness(role))
        .min()
        .unwrap_or(Fitness::NeverAssign)
}
