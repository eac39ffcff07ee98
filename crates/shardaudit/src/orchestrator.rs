//! Audit lifecycle: the quiescence gate, the iteration loop, and the
//! classification of escaped errors.

use crate::data_differ::DataDiffer;
use crate::error::ClusterError;
use crate::events::{AuditEvent, AuditLog, AuditReport};
use crate::keys::config_keys;
use crate::location_resolver::LocationResolver;
use crate::model::ClusterConfiguration;
use crate::rpc::{with_txn_retry, ClusterEnv};
use crate::shard_directory::ShardDirectory;
use crate::topology::TopologyAuditor;
use crate::CheckConfig;

/// Rows requested when snapshotting the configuration keyspace; hitting the
/// limit means the configuration is implausibly large.
const CONFIG_ROW_LIMIT: usize = 1_000;

/// One auditor client. Owns every subcomponent; the harness keeps a handle
/// only for lifecycle control.
pub struct Orchestrator {
    env: ClusterEnv,
    cfg: CheckConfig,
    /// Downgraded to false when the cluster refuses to go quiet.
    perform_quiescent_checks: bool,
    repetitions: u64,
}

impl Orchestrator {
    pub fn new(env: ClusterEnv, cfg: CheckConfig) -> Self {
        let perform_quiescent_checks = cfg.perform_quiescent_checks;
        Self {
            env,
            cfg,
            perform_quiescent_checks,
            repetitions: 0,
        }
    }

    /// Run the audit to completion and produce the report.
    pub async fn run(mut self) -> AuditReport {
        let mut log = AuditLog::new(self.cfg.failure_is_error, self.perform_quiescent_checks);
        log.info(
            AuditEvent::new("ConsistencyCheck_Start")
                .detail("ClientId", self.cfg.client_id)
                .detail("ClientCount", self.cfg.client_count)
                .detail("Quiescent", self.perform_quiescent_checks),
        );

        self.wait_for_quiescence(&mut log).await;

        loop {
            self.run_iteration(&mut log).await;
            if !self.cfg.indefinite {
                break;
            }
            self.repetitions += 1;
            tokio::time::sleep(self.cfg.knobs.iteration_delay).await;
        }

        log.into_report()
    }

    /// Drive the cluster quiet before the first iteration. Failure to
    /// quiesce records one failure and downgrades the run rather than
    /// aborting it.
    async fn wait_for_quiescence(&mut self, log: &mut AuditLog) {
        if !self.cfg.first_client() || !self.perform_quiescent_checks {
            return;
        }

        if self.env.sim.is_simulated() {
            if let Err(err) = self.env.quiet.disable_time_keeper().await {
                tracing::warn!(error = %err, "failed to disable time keeper");
            }
        }

        let quiesce = self.env.quiet.quiet_database(
            "ConsistencyCheckStart",
            0,
            self.cfg.knobs.max_tlog_queue_bytes,
        );
        let outcome = tokio::time::timeout(self.cfg.quiescent_wait_timeout, quiesce).await;
        let failed = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(ClusterError::Timeout("quiet database".into())),
        };

        if let Some(err) = failed {
            log.info(
                AuditEvent::new("ConsistencyCheck_QuietDatabaseError").detail("Error", err),
            );
            log.test_failure("Unable to achieve a quiet database");
            self.perform_quiescent_checks = false;
            log.set_quiescent(false);
        }
    }

    async fn run_iteration(&mut self, log: &mut AuditLog) {
        if self.cfg.first_client() || self.cfg.distributed {
            match self.check_once(log).await {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    // Known transient read errors are logged and the
                    // iteration moves on without re-running the check.
                    log.info(
                        AuditEvent::new("ConsistencyCheck_Retry")
                            .detail("Error", err.name())
                            .detail("Code", err.code()),
                    );
                }
                Err(err) => {
                    log.test_failure(&format!("Error {} - {}", err.code(), err.name()));
                }
            }
        }

        log.info(
            AuditEvent::new("ConsistencyCheck_FinishedCheck")
                .detail("Repetitions", self.repetitions),
        );
    }

    async fn check_once(&mut self, log: &mut AuditLog) -> Result<(), ClusterError> {
        let configuration = self.load_configuration(log).await?;

        if self.cfg.first_client() && self.perform_quiescent_checks {
            TopologyAuditor::new(&self.env, &self.cfg)
                .run(&configuration, log)
                .await?;
        }

        let quiescent = self.perform_quiescent_checks;

        let directory = ShardDirectory::new(&self.env, &self.cfg, quiescent);
        let Some(assignments) = directory.collect(log).await? else {
            return Ok(());
        };

        let resolver = LocationResolver::new(&self.env, &self.cfg, quiescent);
        let Some(locations) = resolver.resolve(&assignments, log).await? else {
            return Ok(());
        };

        let differ = DataDiffer::new(&self.env, &self.cfg, quiescent, self.repetitions);
        differ.check(&locations, &configuration, log).await?;

        Ok(())
    }

    /// Snapshot the recognized cluster configuration options.
    async fn load_configuration(
        &self,
        log: &mut AuditLog,
    ) -> Result<ClusterConfiguration, ClusterError> {
        let span = config_keys();
        let rows =
            with_txn_retry(|| self.env.txn.get_range(&span, CONFIG_ROW_LIMIT)).await?;
        if rows.len() == CONFIG_ROW_LIMIT {
            log.failure_event(AuditEvent::new("ConsistencyCheck_TooManyConfigOptions"));
            log.test_failure("Read too many configuration options");
        }

        let mut configuration = ClusterConfiguration::default();
        for row in &rows {
            configuration.set(&row.key, &row.value);
        }
        Ok(configuration)
    }
}
