//! Consistency audit binary.
//!
//! Loads a cluster fixture, runs the auditor against it, and exits non-zero
//! when any check failed. Production deployments wire the trait seams in
//! `shardaudit::rpc` to their own cluster client instead of the fixture.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use shardaudit::orchestrator::Orchestrator;
use shardaudit::sim::{ClusterFixture, SimCluster};
use shardaudit::CheckConfig;

/// Distributed consistency auditor for sharded, replicated key-value clusters.
#[derive(Parser, Debug)]
#[command(name = "shardaudit")]
struct Args {
    /// Path to a cluster fixture (JSON).
    #[arg(long)]
    cluster: PathBuf,

    /// Perform checks that only pass against a quiescent database.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    quiescent: bool,

    /// How long to wait for the database to go quiet before downgrading the
    /// run.
    #[arg(long, default_value = "600s")]
    quiescent_wait_timeout: humantime::Duration,

    /// Partition the expensive shard diffs across cooperating clients.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    distributed: bool,

    /// Out of every this many shards, one is fully data-checked.
    #[arg(long, default_value_t = 1)]
    shard_sample_factor: usize,

    /// Log check failures at error severity instead of warning.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    failure_is_error: bool,

    /// Ideal bytes per second to read from each storage replica (0 =
    /// unlimited).
    #[arg(long, default_value_t = 0)]
    rate_limit: u64,

    /// Deterministically permute shard order each iteration.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    shuffle_shards: bool,

    /// Loop forever with a short pause between iterations.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    indefinite: bool,

    /// This client's index within the cooperating group.
    #[arg(long, default_value_t = 0)]
    client_id: usize,

    /// Total cooperating clients.
    #[arg(long, default_value_t = 1)]
    client_count: usize,

    /// Seed shared by all clients of one run; drives the shard shuffle.
    #[arg(long, default_value_t = 0)]
    shared_random_seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.client_count > 0, "--client-count must be > 0");
    anyhow::ensure!(
        args.client_id < args.client_count,
        "--client-id must be < --client-count"
    );
    anyhow::ensure!(
        args.shard_sample_factor >= 1,
        "--shard-sample-factor must be >= 1"
    );

    let raw = std::fs::read(&args.cluster)
        .with_context(|| format!("read cluster fixture {}", args.cluster.display()))?;
    let fixture: ClusterFixture =
        serde_json::from_slice(&raw).context("parse cluster fixture")?;
    let cluster = SimCluster::from_fixture(&fixture).context("build cluster")?;

    let cfg = CheckConfig {
        perform_quiescent_checks: args.quiescent,
        quiescent_wait_timeout: args.quiescent_wait_timeout.into(),
        distributed: args.distributed,
        shard_sample_factor: args.shard_sample_factor.max(1),
        failure_is_error: args.failure_is_error,
        rate_limit_bytes_per_sec: args.rate_limit,
        shuffle_shards: args.shuffle_shards,
        indefinite: args.indefinite,
        client_id: args.client_id,
        client_count: args.client_count,
        shared_random_number: args.shared_random_seed,
        ..CheckConfig::default()
    };

    let report = Orchestrator::new(cluster.env(), cfg).run().await;

    tracing::info!(
        success = report.success,
        events = report.events.len(),
        "consistency check finished"
    );

    std::process::exit(if report.success { 0 } else { 1 });
}
