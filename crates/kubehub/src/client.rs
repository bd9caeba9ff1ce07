//! Per-kind resource client: the outbound list/watch loop and the inbound
//! get/put/patch/delete/verify operations.
//!
//! Outbound, watch events flow through a [`CooldownQueue`] into a dispatcher
//! task that invokes the callbacks, so a slow callback never stalls the watch
//! read beyond the queue's backpressure.
//!
//! The shadow store lock is taken only for map updates, with one exception:
//! `get_object` on a patch-strategy kind holds it from the diff until the
//! callback returns, so concurrent transmissions of a kind never diff against
//! the same baseline. A callback that hangs there also holds up Deleted
//! handling for that kind, and callbacks must not call back into the same
//! client while they run.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use ksync_core::config::{QueueConfig, ResourceConfig};
use ksync_core::hash::CanonicalHasher;
use ksync_core::patch::{apply_merge_patch, create_merge_patch};
use ksync_core::{
    filter_and_marshal, Callbacks, Diverged, KindDescriptor, ResourceIdentity, SyncError, SyncResult, SyncStrategy,
    WatchEvent,
};
use ksync_store::{CooldownQueue, ShadowStore};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::{with_retry, RetryPolicy};
use crate::ClusterApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Listing,
    Watching,
    Stopped,
}

pub struct ResourceClient {
    cluster: String,
    kind: KindDescriptor,
    strategy: SyncStrategy,
    list_first: bool,
    api: Arc<dyn ClusterApi>,
    callbacks: Arc<dyn Callbacks>,
    shadow: Mutex<ShadowStore>,
    hasher: CanonicalHasher,
    retry: RetryPolicy,
    queue: QueueConfig,
    cancel: CancellationToken,
    state_tx: watch::Sender<ClientState>,
}

impl ResourceClient {
    pub fn new(
        cluster: impl Into<String>,
        resource: &ResourceConfig,
        api: Arc<dyn ClusterApi>,
        callbacks: Arc<dyn Callbacks>,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ClientState::Idle);
        Self {
            cluster: cluster.into(),
            kind: resource.kind_descriptor(),
            strategy: resource.strategy,
            list_first: resource.list_first,
            api,
            callbacks,
            shadow: Mutex::new(ShadowStore::new()),
            hasher: CanonicalHasher::default(),
            retry: RetryPolicy::default(),
            queue: QueueConfig::default(),
            cancel,
            state_tx,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_hasher(mut self, hasher: CanonicalHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn kind(&self) -> &KindDescriptor { &self.kind }
    pub fn strategy(&self) -> SyncStrategy { self.strategy }

    pub fn state(&self) -> ClientState { *self.state_tx.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> { self.state_tx.subscribe() }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_replace(state);
    }

    /// Last object transmitted for `name` (composite key), if any.
    pub async fn shadow_entry(&self, name: &str) -> Option<Vec<u8>> {
        self.shadow.lock().await.get(name).map(|b| b.to_vec())
    }

    pub async fn shadow_len(&self) -> usize { self.shadow.lock().await.len() }

    fn kind_label(&self) -> String { self.kind.to_string() }

    /// Optional list pass, then watch until the stream ends, errors or the
    /// client is cancelled. Returns `Ok` on stream end and cancellation.
    pub async fn run(self: &Arc<Self>) -> SyncResult<()> {
        let res = self.run_inner().await;
        self.set_state(ClientState::Stopped);
        match &res {
            Ok(()) => info!(kind = %self.kind, "resource client stopped"),
            Err(e) => warn!(kind = %self.kind, error = %e, "resource client stopped with error"),
        }
        res
    }

    async fn run_inner(self: &Arc<Self>) -> SyncResult<()> {
        let mut cursor = None;
        if self.list_first {
            self.set_state(ClientState::Listing);
            cursor = match self.list_existing().await {
                Ok(rv) => rv,
                Err(SyncError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
        }

        let mut stream = self.api.watch(cursor.as_deref()).await?;
        self.set_state(ClientState::Watching);
        info!(kind = %self.kind, from = ?cursor, "watch started");

        let (queue, mut events) =
            CooldownQueue::with_cancel(self.queue.capacity, self.queue.cooldown(), self.cancel.child_token());
        let dispatcher = {
            let me = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(ev) = events.recv().await {
                    me.dispatch(ev).await;
                }
            })
        };

        let res = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                next = stream.next() => match next {
                    None => {
                        info!(kind = %self.kind, "watch stream closed");
                        break Ok(());
                    }
                    Some(Err(e)) => break Err(e),
                    Some(Ok(WatchEvent::Error(msg))) => {
                        error!(kind = %self.kind, error = %msg, "watch error event");
                        break Err(SyncError::Watch(msg));
                    }
                    Some(Ok(ev)) => {
                        counter!("ksync_watch_events_total", 1u64, "kind" => self.kind_label(), "type" => ev.event_type().as_str());
                        queue.enqueue(ev).await;
                    }
                },
            }
        };

        drop(stream);
        if self.cancel.is_cancelled() {
            queue.stop();
        } else {
            // events still cooling down are delivered before the loop reports back
            queue.close();
        }
        if let Err(e) = dispatcher.await {
            error!(kind = %self.kind, error = %e, "event dispatcher panicked");
        }
        res
    }

    /// Announce every existing object, fetching each individually since list
    /// bodies may be incomplete. Returns the list's resource version.
    async fn list_existing(&self) -> SyncResult<Option<String>> {
        let list = with_retry(&self.retry, &self.cancel, "list", || self.api.list()).await?;
        debug!(kind = %self.kind, count = list.items.len(), "listed existing objects");
        for item in &list.items {
            let Some(id) = ResourceIdentity::from_object(&self.cluster, &self.kind, item) else {
                warn!(kind = %self.kind, "listed object without metadata.name");
                continue;
            };
            let bytes = match self.fetch(&id).await {
                Ok(b) => b,
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    error!(id = %id, error = %e, "cannot get listed object");
                    continue;
                }
            };
            if let Err(e) = self.callbacks.object_added(&id, &bytes).await {
                counter!("ksync_callback_errors_total", 1u64, "op" => "object_added");
                error!(id = %id, error = %format!("{e:#}"), "cannot handle added resource");
            }
        }
        Ok(list.resource_version)
    }

    async fn dispatch(&self, ev: WatchEvent) {
        let (obj, deleted) = match ev {
            WatchEvent::Added(o) | WatchEvent::Modified(o) => (o, false),
            WatchEvent::Deleted(o) => (o, true),
            WatchEvent::Error(_) => return,
        };
        let Some(id) = ResourceIdentity::from_object(&self.cluster, &self.kind, &obj) else {
            warn!(kind = %self.kind, "watch event without metadata.name");
            return;
        };
        if deleted {
            info!(id = %id, "deleted resource");
            if let Err(e) = self.callbacks.object_deleted(&id).await {
                counter!("ksync_callback_errors_total", 1u64, "op" => "object_deleted");
                error!(id = %id, error = %format!("{e:#}"), "cannot handle deleted resource");
            }
            if self.strategy == SyncStrategy::Patch {
                self.shadow.lock().await.remove(&id.name);
            }
            return;
        }
        let bytes = match filter_and_marshal(obj) {
            Ok(b) => b,
            Err(e) => {
                error!(id = %id, error = %e, "cannot marshal resource");
                return;
            }
        };
        info!(id = %id, "added resource");
        if let Err(e) = self.callbacks.object_added(&id, &bytes).await {
            counter!("ksync_callback_errors_total", 1u64, "op" => "object_added");
            error!(id = %id, error = %format!("{e:#}"), "cannot handle added resource");
        }
    }

    /// Current filtered representation of `id`, with retries.
    async fn fetch(&self, id: &ResourceIdentity) -> SyncResult<Vec<u8>> {
        let (ns, name) = id.namespace_and_name();
        let obj = with_retry(&self.retry, &self.cancel, "get", || self.api.get(ns, name)).await?;
        filter_and_marshal(obj)
    }

    /// Transmit the current state of `id`. For patch-strategy kinds a
    /// non-empty `base_object` first replaces the shadow entry, and the
    /// transmission is a patch against the shadow when one exists. The shadow
    /// advances only once the callback has accepted the object.
    pub async fn get_object(&self, id: &ResourceIdentity, base_object: &[u8]) -> SyncResult<()> {
        let started = Instant::now();
        let current = self.fetch(id).await?;
        let res = match self.strategy {
            SyncStrategy::FullReplace => self.send_put(id, &current).await,
            SyncStrategy::Patch => {
                let mut shadow = self.shadow.lock().await;
                if !base_object.is_empty() {
                    shadow.insert(id.name.clone(), base_object.to_vec());
                }
                let previous = shadow.get(&id.name).map(|b| b.to_vec());
                let sent = match previous {
                    Some(old) => self.send_patch(id, &old, &current).await,
                    None => self.send_put(id, &current).await,
                };
                if sent.is_ok() {
                    shadow.insert(id.name.clone(), current);
                }
                sent
            }
        };
        histogram!("ksync_get_object_ms", started.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn send_put(&self, id: &ResourceIdentity, object: &[u8]) -> SyncResult<()> {
        self.callbacks.put_object(id, object).await.map_err(|e| SyncError::callback("put object", e))?;
        counter!("ksync_puts_sent_total", 1u64, "kind" => self.kind_label());
        Ok(())
    }

    async fn send_patch(&self, id: &ResourceIdentity, old: &[u8], current: &[u8]) -> SyncResult<()> {
        let checksum = self.hasher.hash(current)?;
        let patch = create_merge_patch(old, current)?;
        self.callbacks
            .patch_object(id, &checksum, &patch)
            .await
            .map_err(|e| SyncError::callback("patch object", e))?;
        counter!("ksync_patches_sent_total", 1u64, "kind" => self.kind_label());
        Ok(())
    }

    /// Apply an inbound merge patch to the live object, verify the result
    /// against `checksum` and persist it. Failures after the live object was
    /// read carry it as the base for resynchronization.
    pub async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> Result<(), Diverged> {
        if self.strategy != SyncStrategy::Patch {
            return Err(SyncError::StrategyNotEnabled(self.kind.to_string()).into());
        }
        let base = self.fetch(id).await?;
        let modified = match apply_merge_patch(&base, patch) {
            Ok(m) => m,
            Err(e) => return Err(Diverged::new(Some(base), e)),
        };
        let actual = match self.hasher.hash(&modified) {
            Ok(h) => h,
            Err(e) => return Err(Diverged::new(Some(base), e)),
        };
        if actual != checksum {
            counter!("ksync_checksum_mismatch_total", 1u64, "kind" => self.kind_label());
            warn!(id = %id, expected = checksum, actual = %actual, "patched object checksum mismatch");
            let err = SyncError::ChecksumMismatch { expected: checksum.to_string(), actual };
            return Err(Diverged::new(Some(base), err));
        }
        let object: Json = match serde_json::from_slice(&modified) {
            Ok(o) => o,
            Err(e) => return Err(Diverged::new(Some(base), e.into())),
        };
        self.shadow.lock().await.insert(id.name.clone(), modified);
        if let Err(e) = self.upsert(&object).await {
            return Err(Diverged::new(Some(base), e));
        }
        debug!(id = %id, "applied inbound patch");
        Ok(())
    }

    /// Create the object, replacing it if it already exists. The body must
    /// name the object `id` refers to.
    pub async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> SyncResult<()> {
        let object: Json = serde_json::from_slice(object)?;
        match ResourceIdentity::from_object(&self.cluster, &self.kind, &object) {
            Some(body) if body.name == id.name => {}
            body => {
                let found = body.map(|b| b.name).unwrap_or_default();
                warn!(id = %id, body = %found, "put object body names a different object");
                return Err(SyncError::Permanent(format!("object {found:?} does not match {}", id.name)));
            }
        }
        self.upsert(&object).await
    }

    async fn upsert(&self, object: &Json) -> SyncResult<()> {
        match with_retry(&self.retry, &self.cancel, "create", || self.api.create(object)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(kind = %self.kind, "object exists; replacing");
                with_retry(&self.retry, &self.cancel, "replace", || self.api.replace(object)).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete `id` from the cluster. An object that is already gone counts as
    /// deleted. On failure the shadow entry is restored unless a newer one was
    /// recorded meanwhile. The shadow lock is not held while the cluster call
    /// retries.
    pub async fn delete_object(&self, id: &ResourceIdentity) -> SyncResult<()> {
        let (ns, name) = id.namespace_and_name();
        let previous = match self.strategy {
            SyncStrategy::Patch => self.shadow.lock().await.remove(&id.name),
            SyncStrategy::FullReplace => None,
        };
        match with_retry(&self.retry, &self.cancel, "delete", || self.api.delete(ns, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(id = %id, "object already deleted");
                Ok(())
            }
            Err(e) => {
                if let Some(p) = previous {
                    let mut shadow = self.shadow.lock().await;
                    if !shadow.contains(&id.name) {
                        shadow.insert(id.name.clone(), p);
                    }
                }
                Err(e)
            }
        }
    }

    /// Return the current filtered object when its canonical hash equals `checksum`.
    pub async fn verify_object(&self, id: &ResourceIdentity, checksum: &str) -> Result<Vec<u8>, Diverged> {
        let current = self.fetch(id).await?;
        let actual = match self.hasher.hash(&current) {
            Ok(h) => h,
            Err(e) => return Err(Diverged::new(Some(current), e)),
        };
        if actual != checksum {
            counter!("ksync_checksum_mismatch_total", 1u64, "kind" => self.kind_label());
            let err = SyncError::ChecksumMismatch { expected: checksum.to_string(), actual };
            return Err(Diverged::new(Some(current), err));
        }
        Ok(current)
    }
}
