//! Shared helpers for auditor integration tests.

#![allow(dead_code)]

use shardaudit::events::AuditReport;
use shardaudit::orchestrator::Orchestrator;
use shardaudit::sim::SimCluster;
use shardaudit::CheckConfig;

/// A healthy two-replica cluster hosting one full-keyspace shard.
pub fn two_replica_cluster() -> SimCluster {
    SimCluster::builder()
        .storage_team_size(2)
        .replica(1, "10.0.0.1:4500")
        .replica(2, "10.0.0.2:4500")
        .rows(&[1, 2], &[(b"k1", b"v1"), (b"k2", b"v2")])
        .shard(b"", b"", &[1, 2], &[])
        .build()
}

pub fn non_quiescent() -> CheckConfig {
    CheckConfig::default()
}

pub fn quiescent() -> CheckConfig {
    CheckConfig {
        perform_quiescent_checks: true,
        ..CheckConfig::default()
    }
}

pub async fn run_audit(cluster: &SimCluster, cfg: CheckConfig) -> AuditReport {
    Orchestrator::new(cluster.env(), cfg).run().await
}

/// Fetch one detail value from the first event with the given name.
pub fn event_detail(report: &AuditReport, name: &str, key: &str) -> Option<String> {
    report
        .find_event(name)
        .and_then(|event| {
            event
                .details
                .iter()
                .find(|(detail_key, _)| *detail_key == key)
                .map(|(_, value)| value.clone())
        })
}

/// Reasons recorded by `TestFailure` events, in order.
pub fn failure_reasons(report: &AuditReport) -> Vec<String> {
    report
        .events
        .iter()
        .filter(|event| event.name == "TestFailure")
        .filter_map(|event| {
            event
                .details
                .iter()
                .find(|(key, _)| *key == "Reason")
                .map(|(_, value)| value.clone())
        })
        .collect()
}
