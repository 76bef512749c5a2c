//! Error taxonomy for a single reconcile attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A queue key that does not decode into `namespace/name`. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KeyError {
    #[error("invalid resource key {0:?}: expected namespace/name")]
    Malformed(String),
}

/// Failures of the pluggable transform. Treated as transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransformError {
    #[error("could not decode annotation: watch values should be strings of the form 'key=value'. Value is '{0}'")]
    Directive(String),
    #[error("invalid URL ({url}): {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("could not fetch data for annotation URL: request failed: {0}")]
    Fetch(String),
    #[error("could not fetch data for annotation URL: url responded with status: {0}")]
    Status(u16),
    #[error("could not fetch data for annotation URL: could not read body: {0}")]
    Body(String),
}

/// Remote store failures, with optimistic-concurrency conflicts kept apart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("store: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("update failed: {0}")]
    Write(#[from] StoreError),
    #[error("update timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("reconcile panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Whether retrying the same key can succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ReconcileError::Key(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Write(StoreError::Conflict(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_key_errors_are_permanent() {
        assert!(!ReconcileError::from(KeyError::Malformed("x".into())).is_transient());
        assert!(ReconcileError::from(TransformError::Fetch("connection refused".into())).is_transient());
        assert!(ReconcileError::from(StoreError::Conflict("rv".into())).is_transient());
        assert!(ReconcileError::WriteTimeout(Duration::from_secs(10)).is_transient());
    }

    #[test]
    fn transform_messages_carry_cause() {
        let e = TransformError::Fetch("connection refused".into());
        assert!(e.to_string().contains("connection refused"));
        assert_eq!(
            TransformError::Status(404).to_string(),
            "could not fetch data for annotation URL: url responded with status: 404"
        );
    }

    #[test]
    fn conflict_is_detected() {
        assert!(ReconcileError::from(StoreError::Conflict("x".into())).is_conflict());
        assert!(!ReconcileError::from(StoreError::Other("x".into())).is_conflict());
    }
}
