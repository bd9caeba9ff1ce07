use std::sync::{Arc, Mutex};
use std::time::Duration;

use ksync_core::config::Config;
use ksync_core::{Callbacks, Diverged, ResourceIdentity, SyncError, SyncResult};
use ksync_kubehub::{ClusterConnector, ResourceClient, RetryPolicy};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Adapter;

/// Dispatches inbound operations to one [`ResourceClient`] per configured kind.
///
/// The kind table is built once in [`InClusterAdapter::new`] and never changes,
/// so lookups need no lock.
pub struct InClusterAdapter {
    clients: FxHashMap<String, Arc<ResourceClient>>,
    callbacks: Arc<dyn Callbacks>,
    cancel: CancellationToken,
    restart_delay: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InClusterAdapter {
    pub fn new(
        cfg: &Config,
        connector: &dyn ClusterConnector,
        callbacks: Arc<dyn Callbacks>,
        cancel: CancellationToken,
    ) -> Self {
        let retry = RetryPolicy::from(&cfg.retry);
        let mut clients = FxHashMap::default();
        for r in &cfg.resources {
            let client = ResourceClient::new(
                cfg.cluster.clone(),
                r,
                connector.resource_api(r),
                Arc::clone(&callbacks),
                cancel.child_token(),
            )
            .with_queue(cfg.queue.clone())
            .with_retry_policy(retry.clone());
            clients.insert(r.kind_descriptor().to_string(), Arc::new(client));
        }
        Self { clients, callbacks, cancel, restart_delay: cfg.watch_restart_delay(), tasks: Mutex::new(Vec::new()) }
    }

    /// Launch one supervised list+watch loop per kind. A loop that stops is
    /// started again after the restart delay until the adapter shuts down.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for client in self.clients.values() {
            let client = Arc::clone(client);
            let cancel = self.cancel.clone();
            let delay = self.restart_delay;
            tasks.push(tokio::spawn(supervise(client, cancel, delay)));
        }
        info!(kinds = self.clients.len(), "in-cluster adapter started");
    }

    /// Cancel every loop and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "resource loop task failed");
            }
        }
        info!("in-cluster adapter stopped");
    }

    pub fn client(&self, kind_key: &str) -> Option<&Arc<ResourceClient>> { self.clients.get(kind_key) }

    pub fn kinds(&self) -> impl Iterator<Item = &str> { self.clients.keys().map(String::as_str) }

    fn lookup(&self, id: &ResourceIdentity) -> SyncResult<&Arc<ResourceClient>> {
        let key = id.kind.to_string();
        self.clients.get(&key).ok_or(SyncError::UnknownResourceKind(key))
    }

    /// Ask the remote side for a full resync from the base object the failed
    /// operation read. Gating and cancellation errors are returned as is.
    async fn fall_back(&self, id: &ResourceIdentity, op: &'static str, diverged: Diverged) -> SyncResult<()> {
        if matches!(diverged.source, SyncError::StrategyNotEnabled(_) | SyncError::Cancelled) {
            return Err(diverged.source);
        }
        warn!(id = %id, error = %diverged.source, "{op} object failed, sending get object");
        counter!("ksync_fallbacks_total", 1u64, "op" => op);
        let base = diverged.base_object.unwrap_or_default();
        self.callbacks.get_object(id, &base).await.map_err(|e| SyncError::callback("get object", e))
    }
}

async fn supervise(client: Arc<ResourceClient>, cancel: CancellationToken, delay: Duration) {
    loop {
        if let Err(e) = client.run().await {
            warn!(kind = %client.kind(), error = %e, "resource loop ended");
        }
        if cancel.is_cancelled() {
            break;
        }
        debug!(kind = %client.kind(), delay_ms = delay.as_millis() as u64, "restarting resource loop");
        counter!("ksync_watch_restarts_total", 1u64, "kind" => client.kind().to_string());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[async_trait::async_trait]
impl Adapter for InClusterAdapter {
    async fn get_object(&self, id: &ResourceIdentity, base_object: &[u8]) -> SyncResult<()> {
        self.lookup(id)?.get_object(id, base_object).await
    }

    async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> SyncResult<()> {
        self.lookup(id)?.put_object(id, object).await
    }

    async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> SyncResult<()> {
        match self.lookup(id)?.patch_object(id, checksum, patch).await {
            Ok(()) => Ok(()),
            Err(diverged) => self.fall_back(id, "patch", diverged).await,
        }
    }

    async fn delete_object(&self, id: &ResourceIdentity) -> SyncResult<()> {
        self.lookup(id)?.delete_object(id).await
    }

    async fn verify_object(&self, id: &ResourceIdentity, checksum: &str) -> SyncResult<()> {
        match self.lookup(id)?.verify_object(id, checksum).await {
            Ok(_) => Ok(()),
            Err(diverged) => self.fall_back(id, "verify", diverged).await,
        }
    }
}
