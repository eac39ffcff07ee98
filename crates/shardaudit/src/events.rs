//! Structured diagnostic events and the per-client audit report.
//!
//! Every check emits named `ConsistencyCheck_*` records. Events are mirrored
//! to `tracing` as they happen and recorded in order so a finished run can be
//! compared event-for-event against a rerun of the same snapshot.

/// Event severity as rendered to the tracing sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// One structured diagnostic record.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub name: &'static str,
    pub severity: Severity,
    pub details: Vec<(&'static str, String)>,
}

impl AuditEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            severity: Severity::Info,
            details: Vec::new(),
        }
    }

    pub fn detail(mut self, key: &'static str, value: impl ToString) -> Self {
        self.details.push((key, value.to_string()));
        self
    }
}

/// Ordered event log plus the sticky pass/fail verdict for one auditor client.
#[derive(Debug)]
pub struct AuditLog {
    failure_is_error: bool,
    quiescent: bool,
    success: bool,
    events: Vec<AuditEvent>,
}

impl AuditLog {
    pub fn new(failure_is_error: bool, quiescent: bool) -> Self {
        Self {
            failure_is_error,
            quiescent,
            success: true,
            events: Vec::new(),
        }
    }

    /// Label recorded failures with the mode they were found in. The
    /// orchestrator downgrades this when the cluster refuses to go quiet.
    pub fn set_quiescent(&mut self, quiescent: bool) {
        self.quiescent = quiescent;
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Emit an informational diagnostic.
    pub fn info(&mut self, event: AuditEvent) {
        self.push(event);
    }

    /// Emit a warning diagnostic for a tolerated anomaly.
    pub fn warn(&mut self, mut event: AuditEvent) {
        event.severity = Severity::Warn;
        self.push(event);
    }

    /// Emit a diagnostic accompanying a failed check, at the severity the run
    /// was configured with.
    pub fn failure_event(&mut self, mut event: AuditEvent) {
        event.severity = if self.failure_is_error {
            Severity::Error
        } else {
            Severity::Warn
        };
        self.push(event);
    }

    /// Record one failed check. The verdict is sticky: once any check fails
    /// the report can never turn green again.
    pub fn test_failure(&mut self, reason: &str) {
        self.success = false;
        let workload = if self.quiescent {
            "QuiescentCheck"
        } else {
            "ConsistencyCheck"
        };
        self.failure_event(
            AuditEvent::new("TestFailure")
                .detail("Workload", workload)
                .detail("Reason", format!("Consistency check: {reason}")),
        );
    }

    fn push(&mut self, event: AuditEvent) {
        match event.severity {
            Severity::Error => {
                tracing::error!(event = event.name, details = ?event.details, "audit event")
            }
            Severity::Warn => {
                tracing::warn!(event = event.name, details = ?event.details, "audit event")
            }
            Severity::Info => {
                tracing::info!(event = event.name, details = ?event.details, "audit event")
            }
        }
        self.events.push(event);
    }

    pub fn into_report(self) -> AuditReport {
        AuditReport {
            success: self.success,
            events: self.events,
        }
    }
}

/// Final outcome of an audit run: the verdict plus every event in emission
/// order.
#[derive(Debug)]
pub struct AuditReport {
    pub success: bool,
    pub events: Vec<AuditEvent>,
}

impl AuditReport {
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.iter().map(|e| e.name).collect()
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name == name)
    }

    pub fn find_event(&self, name: &str) -> Option<&AuditEvent> {
        self.events.iter().find(|e| e.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_is_sticky_false() {
        let mut log = AuditLog::new(false, false);
        assert!(log.success());
        log.test_failure("Data inconsistent");
        log.info(AuditEvent::new("ConsistencyCheck_ReadRange"));
        assert!(!log.success());

        let report = log.into_report();
        assert!(!report.success);
        assert!(report.has_event("TestFailure"));
    }

    #[test]
    fn failure_severity_follows_configuration() {
        let mut warn_log = AuditLog::new(false, true);
        warn_log.test_failure("x");
        assert_eq!(warn_log.into_report().events[0].severity, Severity::Warn);

        let mut error_log = AuditLog::new(true, true);
        error_log.test_failure("x");
        let report = error_log.into_report();
        assert_eq!(report.events[0].severity, Severity::Error);
        let (_, workload) = report.events[0]
            .details
            .iter()
            .find(|(k, _)| *k == "Workload")
            .cloned()
            .unwrap();
        assert_eq!(workload, "QuiescentCheck");
    }
}
