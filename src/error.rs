//! Error types for the nestvc sync engine
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context the owning loop needs to decide between
//! requeue-with-backoff, drop, and surface-as-anomaly.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for sync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from either cluster backend
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A write was attempted against a physical object this engine does not
    /// own (marker missing or recording a different virtual UID)
    #[error("ownership conflict for {key}: {message}")]
    OwnershipConflict {
        /// "namespace/name" of the physical object
        key: String,
        /// Description of the mismatch
        message: String,
    },

    /// A ClusterKey or naming target could not be derived for an item
    #[error("malformed key for {key}: {message}")]
    MalformedKey {
        /// The offending item, as close to "namespace/name" as derivable
        key: String,
        /// Description of what's missing or invalid
        message: String,
    },

    /// A patrol pass was aborted before any action was applied
    #[error("patrol aborted for tenant {cluster_key}: {message}")]
    PatrolAborted {
        /// Cluster key of the tenant whose pass was abandoned
        cluster_key: String,
        /// Which listing failed and why
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dws", "patrol", "watcher")
        context: String,
    },
}

impl Error {
    /// Create an ownership conflict error for the given physical object
    pub fn ownership_conflict(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OwnershipConflict {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a malformed-key error for the given item
    pub fn malformed_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a patrol-aborted error for the given tenant
    pub fn patrol_aborted(cluster_key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PatrolAborted {
            cluster_key: cluster_key.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error should be retried on the same key.
    ///
    /// Transient backend errors (network, timeout, write conflict) retry with
    /// backoff. Ownership conflicts never retry as writes: they resolve only
    /// through patrol's delete-stale path or operator intervention. Malformed
    /// keys are fatal to the single item and drop from the queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, 409).
                // Don't retry on other 4xx errors (validation, forbidden, ...).
                match source {
                    kube::Error::Api(ae) => ae.code == 409 || !(400..500).contains(&ae.code),
                    _ => true,
                }
            }
            Error::OwnershipConflict { .. } => false,
            Error::MalformedKey { .. } => false,
            Error::PatrolAborted { .. } => true, // next scheduled pass retries
            Error::Internal { .. } => true,
        }
    }

    /// Whether this is a 409 from the backend, e.g. a failed delete
    /// precondition on an object that was replaced underneath us
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn transient_backend_errors_are_retryable() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        // Write conflict on optimistic concurrency retries too
        assert!(api_error(409).is_retryable());
    }

    #[test]
    fn conflicts_are_recognizable() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
        assert!(!Error::internal("x").is_conflict());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!api_error(400).is_retryable());
        assert!(!api_error(403).is_retryable());
        assert!(!api_error(422).is_retryable());
    }

    #[test]
    fn ownership_conflicts_never_retry_as_writes() {
        let err = Error::ownership_conflict("ns-a/pvc-1", "marker records uid 999");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ns-a/pvc-1"));
        assert!(err.to_string().contains("ownership conflict"));
    }

    #[test]
    fn malformed_keys_drop_from_the_queue() {
        let err = Error::malformed_key("???/pvc-1", "virtual object has no UID");
        assert!(!err.is_retryable());
    }

    #[test]
    fn patrol_abort_is_retried_by_the_next_pass() {
        let err = Error::patrol_aborted("tenant-1-abc123-test", "super listing failed");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("tenant-1-abc123-test"));
    }

    #[test]
    fn internal_error_carries_context() {
        let err = Error::internal_with_context("dws", "unexpected state");
        assert!(err.is_retryable());
        assert_eq!(err.context(), Some("dws"));
        assert!(err.to_string().contains("[dws]"));

        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
    }
}
