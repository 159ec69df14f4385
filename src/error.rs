//! Error types for the istiod certificate provisioner

use thiserror::Error;

use crate::leader_election::LeaderElectionError;

/// Main error type for provisioner operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// A resource is missing data the provisioner needs
    #[error("validation error: {0}")]
    Validation(String),

    /// Watch or notification stream failure
    #[error("watch error: {0}")]
    Watch(String),

    /// Leader election failure
    #[error("leader election error: {0}")]
    LeaderElection(#[from] LeaderElectionError),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a watch error with the given message
    pub fn watch(msg: impl Into<String>) -> Self {
        Self::Watch(msg.into())
    }

    /// Whether a reconcile that failed with this error should be requeued
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(_) | Error::Watch(_) | Error::LeaderElection(_) => true,
            Error::Config(_) | Error::Validation(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a bad flag is rejected before anything talks to the API server
    #[test]
    fn story_config_errors_are_fatal() {
        let err = Error::config("renew-before (2h0m0s) must be less than duration (1h0m0s)");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("renew-before"));
        assert!(!err.is_retryable());
    }

    /// Story: API server hiccups are surfaced and retried by the dispatcher
    #[test]
    fn story_kube_errors_are_retried() {
        let err = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: request timed out".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }));
        assert!(err.to_string().contains("kubernetes error"));
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_errors_wait_for_a_fix() {
        let err = Error::validation("Certificate istiod has no namespace");
        assert!(err.to_string().starts_with("validation error"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn watch_errors_are_retryable() {
        let err = Error::watch("configmap watch stream ended");
        assert_eq!(err.to_string(), "watch error: configmap watch stream ended");
        assert!(err.is_retryable());
    }
}
