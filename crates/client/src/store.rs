//! Backing-store contract consumed by the generic client.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kfx_core::{KfObject, StoreError};

/// How dependents of a deleted object are cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    /// The object is only gone once everything it owns is gone.
    #[default]
    Foreground,
    Background,
    Orphan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying a newer resourceVersion.
    Bookmark(String),
    /// Status failure delivered in-band (e.g. an expired resourceVersion).
    Error { code: u16, reason: String, message: String },
}

/// Stream of watch events; dropping it stops the watch.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, StoreError>>;

#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    /// Collection resourceVersion to resume watches from.
    pub resource_version: Option<String>,
}

/// Namespace-scoped CRUD + watch for one kind.
///
/// `update` must report a lost optimistic-concurrency race as
/// [`StoreError::Conflict`] and missing objects as [`StoreError::NotFound`].
#[async_trait]
pub trait ResourceStore<K: KfObject>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;
    async fn update(&self, namespace: &str, obj: &K) -> Result<K, StoreError>;
    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> Result<(), StoreError>;
    async fn list(&self, namespace: &str) -> Result<ObjectList<K>, StoreError>;
    /// Watch a single object by name, starting after `resource_version`.
    async fn watch(&self, namespace: &str, name: &str, resource_version: &str) -> Result<WatchStream<K>, StoreError>;
}

#[async_trait]
impl<K: KfObject, S: ResourceStore<K> + ?Sized> ResourceStore<K> for Arc<S> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        (**self).get(namespace, name).await
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        (**self).create(namespace, obj).await
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        (**self).update(namespace, obj).await
    }

    async fn delete(&self, namespace: &str, name: &str, propagation: Propagation) -> Result<(), StoreError> {
        (**self).delete(namespace, name, propagation).await
    }

    async fn list(&self, namespace: &str) -> Result<ObjectList<K>, StoreError> {
        (**self).list(namespace).await
    }

    async fn watch(&self, namespace: &str, name: &str, resource_version: &str) -> Result<WatchStream<K>, StoreError> {
        (**self).watch(namespace, name, resource_version).await
    }
}
