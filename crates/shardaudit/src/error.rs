//! Cluster-facing error codes shared by every RPC seam.

use thiserror::Error;

/// Errors surfaced by the transactional client and replica RPC endpoints.
///
/// The numeric codes are part of the audit log format: fatal errors are
/// reported with `code` and `name` details so operators can correlate them
/// with server-side traces.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("transaction too old")]
    TransactionTooOld,
    #[error("read version is ahead of the storage replica")]
    FutureVersion,
    #[error("request sent to a replica that no longer hosts the shard")]
    WrongShardServer,
    #[error("all alternative endpoints failed")]
    AllAlternativesFailed,
    #[error("server request queue is full")]
    ServerRequestQueueFull,
    #[error("requested attribute not found")]
    AttributeNotFound,
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// Stable numeric code reported in failure events.
    pub fn code(&self) -> i32 {
        match self {
            ClusterError::TransactionTooOld => 1007,
            ClusterError::FutureVersion => 1009,
            ClusterError::WrongShardServer => 1013,
            ClusterError::AllAlternativesFailed => 1020,
            ClusterError::ServerRequestQueueFull => 1042,
            ClusterError::AttributeNotFound => 1051,
            ClusterError::Unreachable(_) => 1501,
            ClusterError::Decode(_) => 1502,
            ClusterError::Timeout(_) => 1503,
            ClusterError::Internal(_) => 1500,
        }
    }

    /// Stable symbolic name reported in failure events.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterError::TransactionTooOld => "transaction_too_old",
            ClusterError::FutureVersion => "future_version",
            ClusterError::WrongShardServer => "wrong_shard_server",
            ClusterError::AllAlternativesFailed => "all_alternatives_failed",
            ClusterError::ServerRequestQueueFull => "server_request_queue_full",
            ClusterError::AttributeNotFound => "attribute_not_found",
            ClusterError::Unreachable(_) => "unreachable",
            ClusterError::Decode(_) => "decode_failed",
            ClusterError::Timeout(_) => "timed_out",
            ClusterError::Internal(_) => "internal_error",
        }
    }

    /// Whether the orchestrator treats this error as transient.
    ///
    /// The list matches the read-path errors a live cluster produces while
    /// shards move or versions expire. Anything else is a hard failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::TransactionTooOld
                | ClusterError::FutureVersion
                | ClusterError::WrongShardServer
                | ClusterError::AllAlternativesFailed
                | ClusterError::ServerRequestQueueFull
        )
    }

    /// Version-expiry subset retried by the pagination loops themselves.
    pub fn is_version_retry(&self) -> bool {
        matches!(
            self,
            ClusterError::TransactionTooOld | ClusterError::FutureVersion
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_set_matches_transient_read_errors() {
        assert!(ClusterError::TransactionTooOld.is_retryable());
        assert!(ClusterError::FutureVersion.is_retryable());
        assert!(ClusterError::WrongShardServer.is_retryable());
        assert!(ClusterError::AllAlternativesFailed.is_retryable());
        assert!(ClusterError::ServerRequestQueueFull.is_retryable());
        assert!(!ClusterError::AttributeNotFound.is_retryable());
        assert!(!ClusterError::Internal("boom".into()).is_retryable());
    }

    #[test]
    fn version_retry_is_a_subset_of_retryable() {
        for err in [
            ClusterError::TransactionTooOld,
            ClusterError::FutureVersion,
            ClusterError::WrongShardServer,
        ] {
            if err.is_version_retry() {
                assert!(err.is_retryable());
            }
        }
        assert!(!ClusterError::WrongShardServer.is_version_retry());
    }
}
