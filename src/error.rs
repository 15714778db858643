//! Error types for the OpenSearch operator

use thiserror::Error;

/// Main error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Transport-level HTTP failure (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// A remote REST API answered with a non-success status code
    #[error("{method} request to {path} returned [{status}] status code: {body}")]
    RemoteApi {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A bounded poll ran out of time
    #[error("Timeout waiting for {0}")]
    Timeout(String),

    /// The cluster cannot be reached yet; the whole cycle is deferred
    #[error("OpenSearch is not ready yet: {0}")]
    NotReady(String),

    #[error("Replication error: {0}")]
    ReplicationError(String),

    #[error("Users recovery error: {0}")]
    UsersRecoveryError(String),
}

impl Error {
    /// Whether the reconciler should retry quickly after this error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::HttpError(_) | Error::Timeout(_) | Error::NotReady(_)
        )
    }

    /// Short machine-readable category used for metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::RemoteApi { .. } => "remote_api",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::Timeout(_) => "timeout",
            Error::NotReady(_) => "not_ready",
            Error::ReplicationError(_) => "replication",
            Error::UsersRecoveryError(_) => "users_recovery",
        }
    }

    /// True when the error is an optimistic-concurrency conflict from the API server
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    /// True when the Kubernetes object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_api_message_carries_request_context() {
        let err = Error::RemoteApi {
            method: "PUT".to_string(),
            path: "_cluster/settings".to_string(),
            status: 500,
            body: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "PUT request to _cluster/settings returned [500] status code: boom"
        );
        assert!(!err.is_retriable());
        assert_eq!(err.kind(), "remote_api");
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::Timeout("replication".into()).is_retriable());
        assert!(Error::NotReady("probe".into()).is_retriable());
        assert!(!Error::ValidationError("mode".into()).is_retriable());
        assert!(!Error::ReplicationError("x".into()).is_retriable());
    }
}
