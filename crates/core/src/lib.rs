//! curlme core types: resource keys, resources, change events and the
//! collaborator traits the reconciliation engine is wired through.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod error;
pub mod mock;

pub use error::{KeyError, ReconcileError, StoreError, TransformError};

/// Canonical `namespace/name` identity of a resource.
///
/// Immutable once constructed. The queue deduplicates on its string form and
/// the cache is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    namespace: String,
    name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Decode a `namespace/name` key. Both halves must be non-empty and the
    /// name must not contain a further separator.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }

    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The unit of state being reconciled: identity, directives and payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub namespace: String,
    pub name: String,
    pub resource_version: Option<String>,
    pub uid: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), ..Default::default() }
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace.clone(), self.name.clone()) }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.resource_version = Some(rv.into());
        self
    }

    /// Resource version as a number, when the server handed out a numeric one.
    pub fn version_number(&self) -> Option<u64> {
        self.resource_version.as_deref().and_then(|rv| rv.parse::<u64>().ok())
    }
}

/// Typed notification pushed by a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// Created or updated.
    Applied(Resource),
    Deleted(ObjectKey),
    /// Full relist; anything not in the list no longer exists.
    Restarted(Vec<Resource>),
}

/// Result of one reconcile attempt, consumed by the worker pool.
#[derive(Debug)]
pub enum Outcome {
    Unchanged,
    Updated,
    TransientFailure(ReconcileError),
    PermanentFailure(ReconcileError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Unchanged => "unchanged",
            Outcome::Updated => "updated",
            Outcome::TransientFailure(_) => "transient_failure",
            Outcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
}

/// An event about a resource, handed to an [`EventRecorder`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub key: ObjectKey,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub severity: Severity,
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn for_resource(resource: &Resource, severity: Severity, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: resource.key(),
            uid: resource.uid.clone(),
            resource_version: resource.resource_version.clone(),
            severity,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn for_key(key: ObjectKey, severity: Severity, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { key, uid: None, resource_version: None, severity, reason: reason.into(), message: message.into() }
    }
}

pub mod prelude {
    pub use super::{
        CacheReader, ChangeEvent, ChangeFeed, Event, EventRecorder, ObjectKey, Outcome, RemoteStore, Resource,
        Severity, Transform,
    };
    pub use super::error::{KeyError, ReconcileError, StoreError, TransformError};
}

/// Read side of the local cache. Lookups may be stale or miss entirely.
pub trait CacheReader: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Resource>>;
}

/// Source of change notifications (list, watch, relist).
#[async_trait::async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Push events into `tx` until the source ends or the receiver is gone.
    async fn run(&self, tx: mpsc::Sender<ChangeEvent>) -> anyhow::Result<()>;
}

/// Remote CRUD store the reconciler writes through.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Resource>, StoreError>;

    /// Write `resource` guarded by its resource version. A concurrent
    /// modification surfaces as [`StoreError::Conflict`].
    async fn update(&self, resource: &Resource) -> Result<Resource, StoreError>;
}

/// Computes the desired state of a resource from its directives.
///
/// `Ok(None)` means no directive applies.
#[async_trait::async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, resource: Resource) -> Result<Option<Resource>, TransformError>;
}

/// Fire-and-forget event sink. Implementations must not block the caller.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: Event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_parses_namespace_and_name() {
        let k = ObjectKey::parse("ns/cm1").expect("ok");
        assert_eq!(k.namespace(), "ns");
        assert_eq!(k.name(), "cm1");
        assert_eq!(k.to_string(), "ns/cm1");
    }

    #[test]
    fn object_key_rejects_malformed() {
        for bad in ["", "cm1", "/cm1", "ns/", "a/b/c", "/"] {
            assert!(ObjectKey::parse(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn version_number_only_for_numeric_versions() {
        assert_eq!(Resource::new("ns", "a").with_resource_version("42").version_number(), Some(42));
        assert_eq!(Resource::new("ns", "a").with_resource_version("abc").version_number(), None);
        assert_eq!(Resource::new("ns", "a").version_number(), None);
    }

    #[test]
    fn events_serialize_with_key_and_severity() {
        let r = Resource::new("ns", "cm1").with_resource_version("7");
        let ev = Event::for_resource(&r, Severity::Normal, "Synced", "ConfigMap updated successfully");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["key"]["namespace"], "ns");
        assert_eq!(v["key"]["name"], "cm1");
        assert_eq!(v["resource_version"], "7");
        assert_eq!(v["severity"], "Normal");
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(Outcome::Updated.label(), "updated");
        let e = ReconcileError::Key(KeyError::Malformed("x".into()));
        assert_eq!(Outcome::PermanentFailure(e).label(), "permanent_failure");
    }
}
