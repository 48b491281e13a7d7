//! Error types for the Local Volume Manager
//!
//! Provides structured error types for discovery, the volume registry,
//! volume publication, claim binding and recreation.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the manager
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

    // =========================================================================
    // Node Errors
    // =========================================================================
    #[error("Node {node} is missing required label {key}")]
    MissingNodeLabel { node: String, key: String },

    #[error("Invalid node affinity: {0}")]
    InvalidAffinity(String),

    #[error("Command on node {node} failed: {command} - {reason}")]
    NodeExec {
        node: String,
        command: String,
        reason: String,
    },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("Discovery root {root} could not be listed: {reason}")]
    DiscoveryRoot { root: String, reason: String },

    #[error("Content setup failed for {path}: {reason}")]
    ContentSetup { path: String, reason: String },

    #[error("Content cleanup failed for {path}: {reason}")]
    ContentCleanup { path: String, reason: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Volume not found: {volume_id}")]
    VolumeNotFound { volume_id: String },

    #[error("Claim not found: {claim_id}")]
    ClaimNotFound { claim_id: String },

    #[error("Invariant violation on {subject}: {reason}")]
    InvariantViolation { subject: String, reason: String },

    // =========================================================================
    // Waiting
    // =========================================================================
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Cancelled while waiting for {what}")]
    Cancelled { what: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

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
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::NodeExec { .. }
            | Error::DiscoveryRoot { .. }
            | Error::ContentCleanup { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Waiting gave up; the caller decides whether to wait again
            Error::Timeout { .. } => ErrorAction::RequeueAfter(Duration::from_secs(30)),

            // Configuration errors and contract violations - never retried
            Error::Configuration(_)
            | Error::MissingNodeLabel { .. }
            | Error::InvalidAffinity(_)
            | Error::CapacityParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::InvariantViolation { .. }
            | Error::ContentSetup { .. }
            | Error::Cancelled { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::Kube(_)
            | Error::NodeExec { .. }
            | Error::DiscoveryRoot { .. }
            | Error::ContentCleanup { .. }
            | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error is a configuration problem that must stop the manager
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::MissingNodeLabel { .. }
                | Error::InvalidAffinity(_)
                | Error::JsonParse(_)
                | Error::YamlParse(_)
        )
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Timeout {
            what: "volume /tmp/disks/vol-1".into(),
            after: Duration::from_secs(600),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::InvariantViolation {
            subject: "local-pv-1".into(),
            reason: "bound".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_requeue_classes() {
        let transient = Error::NodeExec {
            node: "node-1".into(),
            command: "df".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(transient.action(), ErrorAction::RequeueWithBackoff);
        assert!(transient.is_transient());

        let config_err = Error::MissingNodeLabel {
            node: "node-1".into(),
            key: "kubernetes.io/hostname".into(),
        };
        assert_eq!(config_err.action(), ErrorAction::NoRequeue);
        assert!(!config_err.is_transient());
        assert!(config_err.is_fatal());
    }

    #[test]
    fn test_timeout_is_not_not_found() {
        let err = Error::Timeout {
            what: "claim default/pvc".into(),
            after: Duration::from_secs(60),
        };
        assert!(!matches!(err, Error::ResourceNotFound { .. }));
        assert!(err.to_string().contains("Timed out"));
    }
}
