//! ksync kubehub – cluster access and per-kind resource clients.
//!
//! [`ClusterApi`] is the seam between the sync logic and the cluster: the
//! kube-rs implementation talks to a real API server, [`MemoryCluster`]
//! keeps objects in process.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use ksync_core::config::ResourceConfig;
use ksync_core::{SyncResult, WatchEvent};
use serde_json::Value as Json;

mod client;
mod dynamic;
mod memory;
mod retry;

pub use client::{ClientState, ResourceClient};
pub use dynamic::{DynamicResourceApi, KubeCluster};
pub use memory::{MemoryCluster, MemoryResource, Mutations, Op};
pub use retry::{with_retry, RetryPolicy};

/// Watch stream of one resource kind. Ends when the server closes the watch.
pub type WatchStream = BoxStream<'static, SyncResult<WatchEvent>>;

#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<Json>,
    /// Cursor to resume a watch from.
    pub resource_version: Option<String>,
}

/// Raw object access for a single resource kind. An empty namespace addresses
/// cluster-scoped objects (or all namespaces for list/watch).
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list(&self) -> SyncResult<ObjectList>;
    async fn get(&self, namespace: &str, name: &str) -> SyncResult<Json>;
    async fn create(&self, object: &Json) -> SyncResult<Json>;
    async fn replace(&self, object: &Json) -> SyncResult<Json>;
    async fn delete(&self, namespace: &str, name: &str) -> SyncResult<()>;
    /// Watch from `resource_version`, or from "now" when `None`.
    async fn watch(&self, resource_version: Option<&str>) -> SyncResult<WatchStream>;
}

/// Hands out a [`ClusterApi`] per configured resource kind.
pub trait ClusterConnector: Send + Sync {
    fn resource_api(&self, resource: &ResourceConfig) -> Arc<dyn ClusterApi>;
}
