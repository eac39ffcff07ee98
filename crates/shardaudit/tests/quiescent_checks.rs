//! Structural (quiescent-only) check scenarios: placement, queues, stray
//! stores, process classes, and the quiescence gate itself.

mod common;

use common::{event_detail, failure_reasons, quiescent, run_audit, two_replica_cluster};
use shardaudit::model::{ProcessClass, StoreType, Uid};
use shardaudit::rpc::ClusterRoles;
use shardaudit::sim::SimCluster;

#[tokio::test]
async fn duplicate_addresses_fail_fast() {
    let cluster = SimCluster::builder()
        .storage_team_size(2)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.1:4500") // same process hosting two replicas
        .rows(&[1, 2], &[(b"k", b"v")])
        .shard(b"", b"", &[1, 2], &[])
        .build();

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_UndesirableServer"));
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_UndesirableServer", "Address").as_deref(),
        Some("10.0.0.1:4500")
    );
}

#[tokio::test]
async fn wrong_store_type_fails() {
    let cluster = SimCluster::builder()
        .storage_team_size(1)
        .replica_with_store(1, "10.0.0.1:4500", StoreType::Memory)
        .rows(&[1], &[(b"k", b"v")])
        .shard(b"", b"", &[1], &[])
        .build();

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_WrongKeyValueStoreType"));
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("wrong key-value store type")));
}

#[tokio::test]
async fn unreachable_replica_fails_quiescent_run() {
    let cluster = two_replica_cluster();
    cluster.set_unreachable(Uid(2));

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_ServerUnavailable"));
}

#[tokio::test]
async fn nonzero_queues_fail() {
    let cluster = two_replica_cluster();
    cluster.set_data_distribution_queue(12);
    cluster.set_tlog_queue(250_000);
    cluster.set_replica_queue_bytes(Uid(1), 64);

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_NonZeroDataDistributionQueue"));
    assert!(report.has_event("ConsistencyCheck_NonZeroTLogQueue"));
    assert!(report.has_event("ConsistencyCheck_NonZeroStorageServerQueue"));
}

#[tokio::test]
async fn residual_tlog_queue_is_tolerated() {
    let cluster = two_replica_cluster();
    cluster.set_tlog_queue(50_000); // under the drain tolerance

    let report = run_audit(&cluster, quiescent()).await;
    assert!(report.success, "failures: {:?}", failure_reasons(&report));
}

#[tokio::test]
async fn unreadable_storage_queue_is_suppressed_by_undesirable_servers() {
    let duplicated = SimCluster::builder()
        .storage_team_size(2)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.1:4500")
        .rows(&[1, 2], &[(b"k", b"v")])
        .shard(b"", b"", &[1, 2], &[])
        .build();
    duplicated.set_storage_queue_unreadable(true);

    let report = run_audit(&duplicated, quiescent()).await;
    assert!(!report.success);
    // The unreadable queue is explained by the duplicate address, so only
    // that root cause is reported.
    assert!(!failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("storage queue size")));

    let healthy = two_replica_cluster();
    healthy.set_storage_queue_unreadable(true);
    let report = run_audit(&healthy, quiescent()).await;
    assert!(!report.success);
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("storage queue size")));
}

#[tokio::test]
async fn extra_data_store_triggers_reboot_in_simulation() {
    let cluster = two_replica_cluster();
    let address = "10.0.0.2:4500".parse().unwrap();
    cluster.add_disk_store(address, Uid(99));

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_ExtraDataStore"));
    assert!(report.has_event("ConsistencyCheck_RebootProcess"));
    assert_eq!(cluster.rebooted_processes(), vec![address]);
}

#[tokio::test]
async fn storage_class_worker_without_replica_fails() {
    let cluster = SimCluster::builder()
        .storage_team_size(1)
        .replica(1, "10.0.0.1:4500")
        .rows(&[1], &[(b"k", b"v")])
        .shard(b"", b"", &[1], &[])
        .worker("10.0.0.1:4500", ProcessClass::Storage)
        .worker("10.0.0.9:4500", ProcessClass::Storage) // no replica here
        .build();

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_NoStorage"));
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_NoStorage", "Address").as_deref(),
        Some("10.0.0.9:4500")
    );
}

#[tokio::test]
async fn misplaced_master_fails_class_fitness() {
    let storage_address = "10.0.0.1:4500";
    let cluster = SimCluster::builder()
        .storage_team_size(1)
        .replica(1, storage_address)
        .rows(&[1], &[(b"k", b"v")])
        .shard(b"", b"", &[1], &[])
        .worker(storage_address, ProcessClass::Storage)
        .worker("10.0.0.8:4500", ProcessClass::Master)
        .roles(ClusterRoles {
            cluster_controller: "10.0.0.8:4500".parse().unwrap(),
            // A Master-class worker exists, so a Storage-class master is
            // not the best available placement.
            master: storage_address.parse().unwrap(),
            proxies: Vec::new(),
            resolvers: Vec::new(),
            logs: Vec::new(),
        })
        .build();

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_MasterNotBest"));
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("not using requested classes")));
}

#[tokio::test]
async fn failed_worker_breaks_worker_list_agreement() {
    let cluster = two_replica_cluster();
    cluster.set_worker_failed("10.0.0.1:4500".parse().unwrap());

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_FailedWorkerInList"));
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("Worker list incorrect")));
}

#[tokio::test]
async fn quiescence_failure_downgrades_the_run() {
    let cluster = two_replica_cluster();
    cluster.set_quiet_database_fails(true);

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_QuietDatabaseError"));
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("quiet database")));
    // The run continues non-quiescent: data checks still execute and the
    // structural checks are skipped.
    assert!(report.has_event("ConsistencyCheck_FinishedCheck"));
    assert!(report.has_event("ConsistencyCheck_ReadRange"));
    assert!(!report.has_event("ConsistencyCheck_NonZeroDataDistributionQueue"));
    assert!(cluster.time_keeper_disabled());
}

#[tokio::test]
async fn unavailable_proxy_fails_quiescent_directory_collection() {
    let cluster = SimCluster::builder()
        .storage_team_size(2)
        .proxy_count(2)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.2:4500")
        .rows(&[1, 2], &[(b"k", b"v")])
        .shard(b"", b"", &[1, 2], &[])
        .build();
    cluster.set_proxy_unreachable(1);

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_MasterProxyUnavailable"));
    // The directory aborts before any data is diffed.
    assert!(!report.has_event("ConsistencyCheck_ReadRange"));
}

#[tokio::test]
async fn team_size_mismatch_fails_quiescent_run() {
    let cluster = SimCluster::builder()
        .storage_team_size(2)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.2:4500")
        .rows(&[1], &[(b"k", b"v")])
        .shard(b"", b"", &[1], &[]) // one replica despite team size two
        .build();

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_InvalidTeamSize"));
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_InvalidTeamSize", "DesiredTeamSize").as_deref(),
        Some("2")
    );
}

#[tokio::test]
async fn vanished_registration_fails_quiescent_run() {
    let cluster = two_replica_cluster();
    cluster.unregister_replica(Uid(2));

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("serverList changing")));
}
