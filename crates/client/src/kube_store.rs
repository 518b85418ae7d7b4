//! `ResourceStore` backed by a live cluster through kube-rs.

use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, WatchParams},
    Client, Resource,
};
use kfx_core::{KfObject, StoreError};
use tracing::{debug, info};

use crate::store::{ObjectList, Propagation, ResourceStore, WatchEvent, WatchStream};

/// Classify kube errors into the store's conflict/not-found/other classes.
pub fn store_error(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(ae.message),
        other => StoreError::Other(other.to_string()),
    }
}

pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self { Self { client: self.client.clone(), _kind: PhantomData } }
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }

    /// Connect using the ambient kubeconfig or in-cluster environment.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client { &self.client }
}

impl<K> KubeStore<K>
where
    K: KfObject + Resource<Scope = NamespaceResourceScope>,
{
    fn api(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }
}

fn name_of<K: KfObject>(obj: &K) -> Result<&str, StoreError> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| StoreError::Other(format!("{} is missing metadata.name", K::FRIENDLY_NAME)))
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: KfObject + Resource<Scope = NamespaceResourceScope>,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.api(namespace).get(name).await.map_err(store_error)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        self.api(namespace).create(&PostParams::default(), obj).await.map_err(store_error)
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = name_of(obj)?;
        self.api(namespace).replace(name, &PostParams::default(), obj).await.map_err(store_error)
    }

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> Result<(), StoreError> {
        let dp = match propagation {
            Propagation::Foreground => DeleteParams::foreground(),
            Propagation::Background => DeleteParams::background(),
            Propagation::Orphan => DeleteParams::orphan(),
        };
        let _ = self.api(namespace).delete(name, &dp).await.map_err(store_error)?;
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<ObjectList<K>, StoreError> {
        let list = self.api(namespace).list(&ListParams::default()).await.map_err(store_error)?;
        Ok(ObjectList { items: list.items, resource_version: list.metadata.resource_version })
    }

    async fn watch(&self, namespace: &str, name: &str, resource_version: &str) -> Result<WatchStream<K>, StoreError> {
        let wp = WatchParams::default().fields(&format!("metadata.name={}", name));
        let stream = self.api(namespace).watch(&wp, resource_version).await.map_err(store_error)?;
        info!(kind = K::FRIENDLY_NAME, ns = %namespace, name = %name, rv = %resource_version, "watch started");
        let mapped = stream.map(|ev| match ev {
            Ok(kube::api::WatchEvent::Added(o)) => Ok(WatchEvent::Added(o)),
            Ok(kube::api::WatchEvent::Modified(o)) => Ok(WatchEvent::Modified(o)),
            Ok(kube::api::WatchEvent::Deleted(o)) => Ok(WatchEvent::Deleted(o)),
            Ok(kube::api::WatchEvent::Bookmark(b)) => {
                debug!(rv = %b.metadata.resource_version, "watch bookmark");
                Ok(WatchEvent::Bookmark(b.metadata.resource_version))
            }
            Ok(kube::api::WatchEvent::Error(e)) => Ok(WatchEvent::Error { code: e.code, reason: e.reason, message: e.message }),
            Err(e) => Err(store_error(e)),
        });
        Ok(mapped.boxed())
    }
}
