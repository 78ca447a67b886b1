//! Error types for the MinIO operator
//!
//! Provides structured error types for the reconcile engine, the trigger
//! queue, the Kubernetes adapters and the object store backend.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Caches did not sync: {0}")]
    CacheSync(String),

    // =========================================================================
    // Reconcile Errors
    // =========================================================================
    #[error("No ready node left to schedule pod {pod}")]
    SchedulingExhausted { pod: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Shutdown requested during {operation}")]
    Cancelled { operation: String },

    #[error("Reconcile {key} failed: {source}")]
    Reconcile {
        key: String,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Object Store Errors
    // =========================================================================
    #[error("Object store {operation} against {endpoint} failed: {reason}")]
    ObjectStore {
        endpoint: String,
        operation: String,
        reason: String,
    },

    #[error("Object store HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML encode error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Classify a kube error raised while operating on `kind/name`.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::ResourceExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Error::Kube(err),
        }
    }

    /// Wrap this error with the workload identity it was raised for.
    pub fn for_key(self, key: impl ToString) -> Self {
        Error::Reconcile {
            key: key.to_string(),
            source: Box::new(self),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Reconcile { source, .. } => source.action(),

            // A malformed key never becomes valid by retrying
            Error::InvalidKey(_)
            | Error::Configuration(_)
            | Error::Cancelled { .. }
            | Error::Metrics(_) => {
                ErrorAction::NoRequeue
            }

            // Everything else: transient I/O, exhausted scheduling, timeouts
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Target object vanished
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Reconcile { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Create raced with another writer
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Reconcile { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_kube_error_classification() {
        let err = Error::from_kube(api_error(404, "NotFound"), "Pod", "store/minio-a-0");
        assert!(err.is_not_found());

        let err = Error::from_kube(api_error(409, "AlreadyExists"), "Service", "store/minio-a-internal");
        assert!(err.is_already_exists());

        let err = Error::from_kube(api_error(409, "Conflict"), "Minio", "store/minio-a");
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());

        let err = Error::from_kube(api_error(500, "InternalError"), "Minio", "store/minio-a");
        assert!(matches!(err, Error::Kube(_)));
    }

    #[test]
    fn test_error_actions() {
        let err = Error::SchedulingExhausted {
            pod: "minio-a-1".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);

        let err = Error::Timeout {
            operation: "pod readiness".into(),
            after: Duration::from_secs(30),
        };
        assert!(err.is_retryable());

        let err = Error::InvalidKey("a/b/c".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_wrapped_error_keeps_classification() {
        let err = Error::ResourceNotFound {
            kind: "Minio".into(),
            name: "minio-a".into(),
        }
        .for_key("store/minio-a");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("store/minio-a"));

        let err = Error::InvalidKey("x".into()).for_key("x");
        assert!(!err.is_retryable());
    }
}
