//! ksync core types: resource identities, watch events and the callback boundary.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod config;
pub mod error;
pub mod hash;
pub mod patch;

pub use error::{Diverged, SyncError, SyncResult};

/// Annotation written by `kubectl apply`; carries a full copy of the object.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Group/version/resource triple identifying a class of cluster objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindDescriptor {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl KindDescriptor {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// `apiVersion` as it appears in object bodies (`v1` or `apps/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

/// Stable dispatch key: `version/resource` for the core group, `group/version/resource` otherwise.
impl fmt::Display for KindDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// How objects of one kind are transmitted to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    #[default]
    FullReplace,
    Patch,
}

/// Globally unique object address. `name` is the composite namespace+name key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub cluster: String,
    pub kind: KindDescriptor,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(cluster: impl Into<String>, kind: KindDescriptor, name: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), kind, name: name.into() }
    }

    /// Identity of a raw object, from `metadata.namespace` and `metadata.name`.
    pub fn from_object(cluster: &str, kind: &KindDescriptor, object: &Json) -> Option<Self> {
        let meta = object.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
        Some(Self::new(cluster, kind.clone(), ns_name_to_key(namespace, name)))
    }

    /// Decoded `(namespace, name)`; namespace is empty for cluster-scoped objects.
    pub fn namespace_and_name(&self) -> (&str, &str) {
        key_to_ns_name(&self.name)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.cluster, self.kind, self.name)
    }
}

/// Composite key for an object. Kubernetes names never contain `/`, so the split is unambiguous.
pub fn ns_name_to_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() { name.to_string() } else { format!("{}/{}", namespace, name) }
}

/// Inverse of [`ns_name_to_key`].
pub fn key_to_ns_name(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("", key),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a cluster watch stream, carrying the raw object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(Json),
    Modified(Json),
    Deleted(Json),
    Error(String),
}

impl WatchEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
            WatchEvent::Error(_) => EventType::Error,
        }
    }

    pub fn object(&self) -> Option<&Json> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Error(_) => None,
        }
    }

    /// Dedup key `TYPE-identity`; identity is `metadata.uid`, else the composite name key.
    pub fn dedup_key(&self) -> String {
        let identity = match self {
            WatchEvent::Error(msg) => msg.clone(),
            _ => self.object().map(object_identity).unwrap_or_default(),
        };
        make_event_key(self.event_type(), &identity)
    }
}

pub fn make_event_key(event_type: EventType, identity: &str) -> String {
    format!("{}-{}", event_type.as_str(), identity)
}

fn object_identity(object: &Json) -> String {
    let meta = object.get("metadata");
    if let Some(uid) = meta.and_then(|m| m.get("uid")).and_then(|v| v.as_str()) {
        return uid.to_string();
    }
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
    ns_name_to_key(namespace, name)
}

/// Drop fields that churn without semantic change before an object leaves the process.
pub fn filter_object(object: &mut Json) {
    #[cfg(feature = "strip-managed-fields")]
    if let Some(meta) = object.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        if let Some(ann) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            ann.remove(LAST_APPLIED_ANNOTATION);
        }
    }
}

pub fn filter_and_marshal(mut object: Json) -> SyncResult<Vec<u8>> {
    filter_object(&mut object);
    Ok(serde_json::to_vec(&object)?)
}

/// Transport-facing consumer notified by resource clients. Invoked synchronously
/// from the client; implementations decide how data travels onward.
#[async_trait::async_trait]
pub trait Callbacks: Send + Sync {
    async fn object_added(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()>;
    async fn object_deleted(&self, id: &ResourceIdentity) -> anyhow::Result<()>;
    async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()>;
    async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> anyhow::Result<()>;
    /// Ask the remote side to resynchronize from `base_object` (may be empty).
    async fn get_object(&self, id: &ResourceIdentity, base_object: &[u8]) -> anyhow::Result<()>;
}

pub mod prelude {
    pub use super::{
        Callbacks, Diverged, EventType, KindDescriptor, ResourceIdentity, SyncError, SyncResult, SyncStrategy,
        WatchEvent,
    };
}
