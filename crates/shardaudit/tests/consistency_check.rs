//! End-to-end data consistency scenarios against the simulated cluster.

mod common;

use common::{event_detail, failure_reasons, non_quiescent, quiescent, run_audit, two_replica_cluster};
use shardaudit::model::Uid;
use shardaudit::sim::SimCluster;
use shardaudit::CheckConfig;

#[tokio::test]
async fn byte_identical_replicas_pass() {
    let cluster = two_replica_cluster();
    let report = run_audit(&cluster, non_quiescent()).await;

    assert!(report.success, "failures: {:?}", failure_reasons(&report));
    assert!(!report.has_event("TestFailure"));
    assert!(report.has_event("ConsistencyCheck_FinishedCheck"));

    // k1/v1 + k2/v2 over one page.
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_ReadRange", "BytesRead").as_deref(),
        Some("8")
    );
}

#[tokio::test]
async fn value_mismatch_is_attributed_and_fails() {
    let cluster = two_replica_cluster();
    cluster.set_replica_row(Uid(2), b"k1", b"divergent");

    let report = run_audit(&cluster, non_quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_DataInconsistent"));
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_DataInconsistent", "ValueMismatches").as_deref(),
        Some("1")
    );
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_DataInconsistent", "ValueMismatchKey").as_deref(),
        Some("k1")
    );
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_DataInconsistent", "MatchingKVPairs").as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn missing_key_on_one_replica_fails() {
    let cluster = two_replica_cluster();
    cluster.remove_replica_row(Uid(2), b"k2");

    let report = run_audit(&cluster, non_quiescent()).await;

    assert!(!report.success);
    // Replica 1 is the reference; the row it alone holds shows up as a
    // reference-side unique.
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_DataInconsistent", "ReferenceUniques").as_deref(),
        Some("1")
    );
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_DataInconsistent", "ReferenceUniqueKey")
            .as_deref(),
        Some("k2")
    );
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_DataInconsistent", "CurrentUniques").as_deref(),
        Some("0")
    );
}

#[tokio::test]
async fn unreachable_destination_replica_is_tolerated_during_relocation() {
    let cluster = SimCluster::builder()
        .storage_team_size(1)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.2:4500")
        .replica(3, "10.0.0.3:4500")
        .rows(&[1, 2, 3], &[(b"k1", b"v1")])
        .shard(b"", b"", &[1], &[2, 3])
        .build();
    cluster.set_unreachable(Uid(3));

    let report = run_audit(&cluster, non_quiescent()).await;

    assert!(report.success, "failures: {:?}", failure_reasons(&report));
    assert!(report.has_event("ConsistencyCheck_FailedToFetchMetrics"));
    assert!(!report.has_event("TestFailure"));
}

#[tokio::test]
async fn estimator_drift_fails_in_quiescent_mode() {
    let cluster = SimCluster::builder()
        .storage_team_size(1)
        .replica(1, "10.0.0.1:4500")
        .rows(&[1], &[(b"k1", b"v1"), (b"k2", b"v2")])
        .shard(b"", b"", &[1], &[])
        .build();
    cluster.set_estimate_override(Uid(1), 1_000_000);

    let report = run_audit(&cluster, quiescent()).await;

    assert!(!report.success);
    assert!(report.has_event("ConsistencyCheck_IncorrectEstimate"));
    assert_eq!(
        event_detail(&report, "ConsistencyCheck_IncorrectEstimate", "EstimatedBytes").as_deref(),
        Some("1000000")
    );
    assert!(failure_reasons(&report)
        .iter()
        .any(|reason| reason.contains("incorrect sampled estimate")));
}

#[tokio::test]
async fn consistent_cluster_passes_quiescent_checks() {
    let cluster = two_replica_cluster();
    let report = run_audit(&cluster, quiescent()).await;
    assert!(report.success, "failures: {:?}", failure_reasons(&report));
}

#[tokio::test]
async fn empty_shard_is_benign() {
    let cluster = SimCluster::builder()
        .storage_team_size(2)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.2:4500")
        .shard(b"", b"", &[1, 2], &[])
        .build();

    let report = run_audit(&cluster, quiescent()).await;
    assert!(report.success, "failures: {:?}", failure_reasons(&report));
    assert!(!report.has_event("ConsistencyCheck_ReadRange"));
}

#[tokio::test]
async fn single_key_shard_does_not_trip_bounds_checks() {
    let cluster = SimCluster::builder()
        .storage_team_size(1)
        .replica(1, "10.0.0.1:4500")
        .rows(&[1], &[(b"only", b"row")])
        .shard(b"", b"", &[1], &[])
        .build();

    let report = run_audit(&cluster, quiescent()).await;
    assert!(report.success, "failures: {:?}", failure_reasons(&report));
    assert!(!report.has_event("ConsistencyCheck_InvalidShardSize"));
}

#[tokio::test]
async fn rate_limited_run_still_completes() {
    let cluster = two_replica_cluster();
    let report = run_audit(
        &cluster,
        CheckConfig {
            rate_limit_bytes_per_sec: 1_000_000,
            ..non_quiescent()
        },
    )
    .await;
    assert!(report.success, "failures: {:?}", failure_reasons(&report));
}

#[tokio::test]
async fn multi_shard_directory_is_stitched_across_batches() {
    let cluster = SimCluster::builder()
        .storage_team_size(2)
        .fault_injection(true) // shrink directory batches to one range
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.2:4500")
        .rows(
            &[1, 2],
            &[(b"a1", b"v"), (b"b1", b"v"), (b"m1", b"v"), (b"z1", b"v")],
        )
        .shard(b"", b"m", &[1, 2], &[])
        .shard(b"m", b"", &[1, 2], &[])
        .build();

    let report = run_audit(&cluster, non_quiescent()).await;
    assert!(report.success, "failures: {:?}", failure_reasons(&report));

    let read_ranges: Vec<_> = report
        .events
        .iter()
        .filter(|event| event.name == "ConsistencyCheck_ReadRange")
        .collect();
    assert_eq!(read_ranges.len(), 2);
}

#[tokio::test]
async fn shuffled_runs_are_reproducible() {
    let config = || CheckConfig {
        shuffle_shards: true,
        shared_random_number: 1234,
        ..non_quiescent()
    };
    let build = || {
        SimCluster::builder()
            .storage_team_size(1)
            .replica(1, "10.0.0.1:4500")
            .rows(&[1], &[(b"a", b"1"), (b"f", b"2"), (b"p", b"3")])
            .shard(b"", b"f", &[1], &[])
            .shard(b"f", b"p", &[1], &[])
            .shard(b"p", b"", &[1], &[])
            .build()
    };

    let first = run_audit(&build(), config()).await;
    let second = run_audit(&build(), config()).await;

    let render = |report: &shardaudit::events::AuditReport| {
        report
            .events
            .iter()
            .map(|event| format!("{}{:?}", event.name, event.details))
            .collect::<Vec<_>>()
    };
    assert_eq!(render(&first), render(&second));
    assert_eq!(first.success, second.success);
}

#[tokio::test]
async fn distributed_clients_split_the_shard_walk() {
    let build = || {
        SimCluster::builder()
            .storage_team_size(1)
            .replica(1, "10.0.0.1:4500")
            .rows(
                &[1],
                &[(b"a", b"1"), (b"g", b"2"), (b"n", b"3"), (b"t", b"4")],
            )
            .shard(b"", b"g", &[1], &[])
            .shard(b"g", b"n", &[1], &[])
            .shard(b"n", b"t", &[1], &[])
            .shard(b"t", b"", &[1], &[])
            .build()
    };

    let first = run_audit(
        &build(),
        CheckConfig {
            client_id: 0,
            client_count: 2,
            ..non_quiescent()
        },
    )
    .await;
    let second = run_audit(
        &build(),
        CheckConfig {
            client_id: 1,
            client_count: 2,
            ..non_quiescent()
        },
    )
    .await;

    assert!(first.success);
    assert!(second.success);

    // The first client fully diffs every other shard; its sibling starts at
    // index two and strides by the client count.
    let ranges = |report: &shardaudit::events::AuditReport| {
        report
            .events
            .iter()
            .filter(|event| event.name == "ConsistencyCheck_ReadRange")
            .filter_map(|event| {
                event
                    .details
                    .iter()
                    .find(|(key, _)| *key == "Range")
                    .map(|(_, value)| value.clone())
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(ranges(&first).len(), 2);
    assert_eq!(ranges(&second).len(), 1);
    assert!(ranges(&second)[0].contains("n"));
}
