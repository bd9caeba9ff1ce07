use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use ksync_core::config::ResourceConfig;
use ksync_core::{SyncError, SyncResult, WatchEvent};
use serde_json::Value as Json;
use tracing::debug;

use crate::{ClusterApi, ClusterConnector, ObjectList, WatchStream};

/// Connector backed by a kube [`Client`]; every kind shares the client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    /// In-cluster config, falling back to the local kubeconfig.
    pub async fn try_default() -> SyncResult<Self> {
        let client = Client::try_default().await.map_err(map_kube_err)?;
        Ok(Self::new(client))
    }
}

impl ClusterConnector for KubeCluster {
    fn resource_api(&self, resource: &ResourceConfig) -> Arc<dyn ClusterApi> {
        Arc::new(DynamicResourceApi::new(self.client.clone(), resource))
    }
}

/// Untyped object access for one group/version/resource.
pub struct DynamicResourceApi {
    client: Client,
    ar: ApiResource,
}

impl DynamicResourceApi {
    pub fn new(client: Client, resource: &ResourceConfig) -> Self {
        let kind = resource.kind_descriptor();
        let ar = ApiResource {
            group: kind.group.clone(),
            version: kind.version.clone(),
            api_version: kind.api_version(),
            kind: resource.kind.clone().unwrap_or_default(),
            plural: kind.resource.clone(),
        };
        Self { client, ar }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &self.ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &self.ar)
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for DynamicResourceApi {
    async fn list(&self) -> SyncResult<ObjectList> {
        let list = self.api("").list(&ListParams::default()).await.map_err(map_kube_err)?;
        let items = list.items.iter().map(serde_json::to_value).collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectList { items, resource_version: list.metadata.resource_version })
    }

    async fn get(&self, namespace: &str, name: &str) -> SyncResult<Json> {
        let obj = self.api(namespace).get(name).await.map_err(map_kube_err)?;
        Ok(serde_json::to_value(&obj)?)
    }

    async fn create(&self, object: &Json) -> SyncResult<Json> {
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        let created = self.api(&ns).create(&PostParams::default(), &obj).await.map_err(map_kube_err)?;
        Ok(serde_json::to_value(&created)?)
    }

    async fn replace(&self, object: &Json) -> SyncResult<Json> {
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        let ns = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| SyncError::Permanent("object missing metadata.name".into()))?;
        let replaced = self.api(&ns).replace(&name, &PostParams::default(), &obj).await.map_err(map_kube_err)?;
        Ok(serde_json::to_value(&replaced)?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> SyncResult<()> {
        self.api(namespace).delete(name, &DeleteParams::default()).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn watch(&self, resource_version: Option<&str>) -> SyncResult<WatchStream> {
        let version = resource_version.unwrap_or("0");
        let stream = self.api("").watch(&WatchParams::default(), version).await.map_err(map_kube_err)?;
        debug!(resource = %self.ar.plural, version, "watch opened");
        Ok(stream.filter_map(|res| futures::future::ready(convert(res))).boxed())
    }
}

fn convert(res: kube::Result<KubeWatchEvent<DynamicObject>>) -> Option<SyncResult<WatchEvent>> {
    match res {
        Ok(KubeWatchEvent::Added(o)) => Some(to_json(&o).map(WatchEvent::Added)),
        Ok(KubeWatchEvent::Modified(o)) => Some(to_json(&o).map(WatchEvent::Modified)),
        Ok(KubeWatchEvent::Deleted(o)) => Some(to_json(&o).map(WatchEvent::Deleted)),
        Ok(KubeWatchEvent::Bookmark(_)) => None,
        Ok(KubeWatchEvent::Error(e)) => Some(Ok(WatchEvent::Error(format!("{} ({})", e.message, e.code)))),
        Err(e) => Some(Err(SyncError::Watch(e.to_string()))),
    }
}

fn to_json(obj: &DynamicObject) -> SyncResult<Json> {
    Ok(serde_json::to_value(obj)?)
}

/// API status errors keep their HTTP code; transport errors carry none and are retried.
pub(crate) fn map_kube_err(e: kube::Error) -> SyncError {
    match e {
        kube::Error::Api(status) => SyncError::upstream(Some(status.code), status.message),
        other => SyncError::upstream(None, other.to_string()),
    }
}
