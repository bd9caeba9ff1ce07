//! In-process cluster: objects per kind in ordered maps, with watch fan-out,
//! injected failures and mutation counters. Used by tests and dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use ksync_core::config::ResourceConfig;
use ksync_core::{ns_name_to_key, KindDescriptor, SyncError, SyncResult, WatchEvent};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};

use crate::{ClusterApi, ClusterConnector, ObjectList, WatchStream};

#[derive(Default)]
pub struct MemoryCluster {
    resources: Mutex<FxHashMap<KindDescriptor, Arc<MemoryResource>>>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// The store for `kind`, created on first use.
    pub fn resource(&self, kind: &KindDescriptor) -> Arc<MemoryResource> {
        let mut map = self.resources.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(map.entry(kind.clone()).or_insert_with(|| Arc::new(MemoryResource::default())))
    }
}

impl ClusterConnector for MemoryCluster {
    fn resource_api(&self, resource: &ResourceConfig) -> Arc<dyn ClusterApi> {
        self.resource(&resource.kind_descriptor())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Get,
    Create,
    Replace,
    Delete,
    Watch,
}

/// Calls that reached the store, failed ones included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mutations {
    pub lists: usize,
    pub gets: usize,
    pub creates: usize,
    pub replaces: usize,
    pub deletes: usize,
}

#[derive(Default)]
pub struct MemoryResource {
    inner: Mutex<Inner>,
}

struct Inner {
    objects: BTreeMap<String, Json>,
    resource_version: u64,
    watchers: Vec<UnboundedSender<SyncResult<WatchEvent>>>,
    watch_versions: Vec<Option<String>>,
    failures: VecDeque<(Op, Option<u16>, String)>,
    counts: Mutations,
    list_bodies: bool,
}

impl MemoryResource {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store `object` without notifying watchers.
    pub fn seed(&self, object: Json) -> Json {
        let mut g = self.lock();
        g.store(object)
    }

    /// Create or update `object` and broadcast ADDED/MODIFIED.
    pub fn apply(&self, object: Json) -> Json {
        let mut g = self.lock();
        let existed = object_key(&object).map(|k| g.objects.contains_key(&k)).unwrap_or(false);
        let stored = g.store(object);
        let ev = if existed { WatchEvent::Modified(stored.clone()) } else { WatchEvent::Added(stored.clone()) };
        g.broadcast(ev);
        stored
    }

    /// Remove an object and broadcast DELETED.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<Json> {
        let mut g = self.lock();
        let removed = g.objects.remove(&ns_name_to_key(namespace, name))?;
        g.broadcast(WatchEvent::Deleted(removed.clone()));
        Some(removed)
    }

    /// Send a raw event to every open watch.
    pub fn emit(&self, event: WatchEvent) { self.lock().broadcast(event); }

    /// Send a stream-level error to every open watch.
    pub fn emit_error(&self, message: impl Into<String>) {
        let message = message.into();
        let mut g = self.lock();
        g.watchers.retain(|tx| tx.unbounded_send(Err(SyncError::Watch(message.clone()))).is_ok());
    }

    /// End every open watch stream.
    pub fn close_watches(&self) { self.lock().watchers.clear(); }

    /// Fail the next call of `op` with an upstream error carrying `code`.
    pub fn fail_next(&self, op: Op, code: Option<u16>) {
        self.lock().failures.push_back((op, code, format!("injected {op:?} failure")));
    }

    /// List responses carry only type and metadata when disabled.
    pub fn set_list_bodies(&self, enabled: bool) { self.lock().list_bodies = enabled; }

    pub fn object(&self, namespace: &str, name: &str) -> Option<Json> {
        self.lock().objects.get(&ns_name_to_key(namespace, name)).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn mutations(&self) -> Mutations { self.lock().counts }

    /// Versions passed to each `watch` call so far.
    pub fn watch_versions(&self) -> Vec<Option<String>> { self.lock().watch_versions.clone() }

    pub fn open_watches(&self) -> usize {
        let mut g = self.lock();
        g.watchers.retain(|tx| !tx.is_closed());
        g.watchers.len()
    }
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            resource_version: 1,
            watchers: Vec::new(),
            watch_versions: Vec::new(),
            failures: VecDeque::new(),
            counts: Mutations::default(),
            list_bodies: true,
        }
    }
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    /// Stamp uid and resourceVersion, then insert. Objects without a name are stored under "".
    fn store(&mut self, mut object: Json) -> Json {
        let key = object_key(&object).unwrap_or_default();
        let version = self.next_version();
        if !object.get("metadata").map(|m| m.is_object()).unwrap_or(false) {
            object["metadata"] = json!({});
        }
        let meta = &mut object["metadata"];
        if meta.get("uid").and_then(|v| v.as_str()).is_none() {
            let uid = match self.objects.get(&key).and_then(|o| o["metadata"]["uid"].as_str()) {
                Some(existing) => existing.to_string(),
                None => format!("uid-{}", key.replace('/', "-")),
            };
            meta["uid"] = json!(uid);
        }
        meta["resourceVersion"] = json!(version);
        self.objects.insert(key, object.clone());
        object
    }

    fn broadcast(&mut self, ev: WatchEvent) {
        self.watchers.retain(|tx| tx.unbounded_send(Ok(ev.clone())).is_ok());
    }

    fn take_failure(&mut self, op: Op) -> SyncResult<()> {
        if let Some(pos) = self.failures.iter().position(|(o, _, _)| *o == op) {
            if let Some((_, code, message)) = self.failures.remove(pos) {
                return Err(SyncError::upstream(code, message));
            }
        }
        Ok(())
    }
}

fn object_key(object: &Json) -> Option<String> {
    let meta = object.get("metadata")?;
    let name = meta.get("name")?.as_str()?;
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
    Some(ns_name_to_key(namespace, name))
}

fn not_found(key: &str) -> SyncError { SyncError::upstream(Some(404), format!("{key} not found")) }

fn headers_only(object: &Json) -> Json {
    json!({
        "apiVersion": object.get("apiVersion").cloned().unwrap_or(Json::Null),
        "kind": object.get("kind").cloned().unwrap_or(Json::Null),
        "metadata": object.get("metadata").cloned().unwrap_or_else(|| json!({})),
    })
}

#[async_trait::async_trait]
impl ClusterApi for MemoryResource {
    async fn list(&self) -> SyncResult<ObjectList> {
        let mut g = self.lock();
        g.counts.lists += 1;
        g.take_failure(Op::List)?;
        let items = if g.list_bodies {
            g.objects.values().cloned().collect()
        } else {
            g.objects.values().map(headers_only).collect()
        };
        Ok(ObjectList { items, resource_version: Some(g.resource_version.to_string()) })
    }

    async fn get(&self, namespace: &str, name: &str) -> SyncResult<Json> {
        let mut g = self.lock();
        g.counts.gets += 1;
        g.take_failure(Op::Get)?;
        let key = ns_name_to_key(namespace, name);
        g.objects.get(&key).cloned().ok_or_else(|| not_found(&key))
    }

    async fn create(&self, object: &Json) -> SyncResult<Json> {
        let mut g = self.lock();
        g.counts.creates += 1;
        g.take_failure(Op::Create)?;
        let key = object_key(object).ok_or_else(|| SyncError::upstream(Some(422), "metadata.name is required"))?;
        if g.objects.contains_key(&key) {
            return Err(SyncError::upstream(Some(409), format!("{key} already exists")));
        }
        let stored = g.store(object.clone());
        g.broadcast(WatchEvent::Added(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, object: &Json) -> SyncResult<Json> {
        let mut g = self.lock();
        g.counts.replaces += 1;
        g.take_failure(Op::Replace)?;
        let key = object_key(object).ok_or_else(|| SyncError::upstream(Some(422), "metadata.name is required"))?;
        if !g.objects.contains_key(&key) {
            return Err(not_found(&key));
        }
        let stored = g.store(object.clone());
        g.broadcast(WatchEvent::Modified(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> SyncResult<()> {
        let mut g = self.lock();
        g.counts.deletes += 1;
        g.take_failure(Op::Delete)?;
        let key = ns_name_to_key(namespace, name);
        let removed = g.objects.remove(&key).ok_or_else(|| not_found(&key))?;
        g.broadcast(WatchEvent::Deleted(removed));
        Ok(())
    }

    async fn watch(&self, resource_version: Option<&str>) -> SyncResult<WatchStream> {
        let mut g = self.lock();
        g.watch_versions.push(resource_version.map(str::to_string));
        g.take_failure(Op::Watch)?;
        let (tx, rx) = unbounded();
        // like the API server, a watch without a cursor starts with the current state
        if matches!(resource_version, None | Some("0")) {
            for obj in g.objects.values() {
                let _ = tx.unbounded_send(Ok(WatchEvent::Added(obj.clone())));
            }
        }
        g.watchers.push(tx);
        Ok(rx.boxed())
    }
}
