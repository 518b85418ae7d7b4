//! In-process `ResourceStore` with the semantics the client relies on:
//! resourceVersion conflict detection, generation bumps on spec changes and
//! resumable per-object watches.
//!
//! Used by tests and dry runs; it stands in for the orchestration API, so it
//! also exposes the reconciler side (`update_status`, `reconcile`).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use kfx_core::{KfObject, StoreError};
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{ObjectList, Propagation, ResourceStore, WatchEvent, WatchStream};

#[derive(Debug, Clone)]
struct Recorded<K> {
    rv: u64,
    namespace: String,
    name: String,
    event: WatchEvent<K>,
}

struct Inner<K> {
    last_rv: u64,
    objects: BTreeMap<(String, String), K>,
    history: Vec<Recorded<K>>,
    events: broadcast::Sender<Recorded<K>>,
}

pub struct MemoryStore<K: KfObject> {
    inner: Mutex<Inner<K>>,
}

impl<K: KfObject> Default for MemoryStore<K> {
    fn default() -> Self { Self::new() }
}

fn other(e: impl std::fmt::Display) -> StoreError { StoreError::Other(e.to_string()) }

fn spec_of<K: KfObject>(obj: &K) -> Json {
    serde_json::to_value(obj).ok().and_then(|v| v.get("spec").cloned()).unwrap_or(Json::Null)
}

/// Copy `status` from `src` onto `dst`, leaving everything else of `dst` intact.
fn with_status_of<K: KfObject>(dst: &K, src: &K) -> Result<K, StoreError> {
    let mut v = serde_json::to_value(dst).map_err(other)?;
    let status = serde_json::to_value(src).map_err(other)?.get("status").cloned();
    if let Some(map) = v.as_object_mut() {
        match status {
            Some(s) if !s.is_null() => { map.insert("status".into(), s); }
            _ => { map.remove("status"); }
        }
    }
    serde_json::from_value(v).map_err(other)
}

impl<K: KfObject> MemoryStore<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self { inner: Mutex::new(Inner { last_rv: 0, objects: BTreeMap::new(), history: Vec::new(), events }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        // A panic while holding the lock only happens in a failing test; keep serving.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current resourceVersion of the whole store.
    pub fn resource_version(&self) -> String { self.lock().last_rv.to_string() }

    /// Reconciler-side write: replace only the status of the stored object.
    pub fn update_status(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        let name = obj.meta().name.clone().ok_or_else(|| other("object is missing metadata.name"))?;
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.clone());
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(format!("{} {:?}", K::FRIENDLY_NAME, name)))?;
        check_version(&stored, obj)?;
        let mut next = with_status_of(&stored, obj)?;
        let rv = inner.next_rv();
        next.meta_mut().resource_version = Some(rv.to_string());
        inner.commit(rv, namespace, &name, next.clone(), WatchEvent::Modified(next.clone()));
        Ok(next)
    }

    /// Act as the reconciler: apply `f` to the stored object's status and
    /// mark the current generation as observed.
    pub fn reconcile(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> Result<K, StoreError> {
        let mut obj = {
            let inner = self.lock();
            inner
                .objects
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("{} {:?}", K::FRIENDLY_NAME, name)))?
        };
        f(&mut obj);
        let generation = obj.generation();
        obj.set_observed_generation(generation);
        self.update_status(namespace, &obj)
    }

    /// Close every open watch stream, as an API server does on timeout.
    pub fn disconnect_watchers(&self) {
        let mut inner = self.lock();
        let (events, _) = broadcast::channel(1024);
        inner.events = events;
    }
}

impl<K: KfObject> Inner<K> {
    fn next_rv(&mut self) -> u64 {
        self.last_rv += 1;
        self.last_rv
    }

    fn commit(&mut self, rv: u64, namespace: &str, name: &str, obj: K, event: WatchEvent<K>) {
        let key = (namespace.to_string(), name.to_string());
        if matches!(event, WatchEvent::Deleted(_)) {
            self.objects.remove(&key);
        } else {
            self.objects.insert(key, obj);
        }
        let rec = Recorded { rv, namespace: namespace.to_string(), name: name.to_string(), event };
        self.history.push(rec.clone());
        // no receivers is fine
        let _ = self.events.send(rec);
    }
}

fn check_version<K: KfObject>(stored: &K, incoming: &K) -> Result<(), StoreError> {
    match incoming.meta().resource_version.as_deref() {
        Some(rv) if Some(rv) != stored.meta().resource_version.as_deref() => Err(StoreError::Conflict(format!(
            "the object has been modified; please apply your changes to the latest version (have {}, stored {})",
            rv,
            stored.meta().resource_version.as_deref().unwrap_or("")
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
impl<K: KfObject> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        // yield so concurrent callers interleave like real round trips
        tokio::task::yield_now().await;
        let inner = self.lock();
        inner
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {:?} not found", K::FRIENDLY_NAME, name)))
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        tokio::task::yield_now().await;
        let name = obj.meta().name.clone().ok_or_else(|| other("object is missing metadata.name"))?;
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!("{} {:?} already exists", K::FRIENDLY_NAME, name)));
        }
        let mut next = obj.clone();
        let rv = inner.next_rv();
        let meta = next.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.generation = Some(1);
        meta.resource_version = Some(rv.to_string());
        inner.commit(rv, namespace, &name, next.clone(), WatchEvent::Added(next.clone()));
        debug!(kind = K::FRIENDLY_NAME, ns = %namespace, name = %name, rv, "created");
        Ok(next)
    }

    async fn update(&self, namespace: &str, obj: &K) -> Result<K, StoreError> {
        tokio::task::yield_now().await;
        let name = obj.meta().name.clone().ok_or_else(|| other("object is missing metadata.name"))?;
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.clone());
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(format!("{} {:?} not found", K::FRIENDLY_NAME, name)))?;
        check_version(&stored, obj)?;

        // Status is owned by the reconciler; spec writers can't touch it.
        let mut next = with_status_of(obj, &stored)?;
        let generation = stored.generation() + i64::from(spec_of(&stored) != spec_of(obj));
        let rv = inner.next_rv();
        let meta = next.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.generation = Some(generation);
        meta.resource_version = Some(rv.to_string());
        inner.commit(rv, namespace, &name, next.clone(), WatchEvent::Modified(next.clone()));
        debug!(kind = K::FRIENDLY_NAME, ns = %namespace, name = %name, rv, generation, "updated");
        Ok(next)
    }

    async fn delete(&self, namespace: &str, name: &str, _propagation: Propagation) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let stored = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(format!("{} {:?} not found", K::FRIENDLY_NAME, name)))?;
        let rv = inner.next_rv();
        inner.commit(rv, namespace, name, stored.clone(), WatchEvent::Deleted(stored));
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<ObjectList<K>, StoreError> {
        tokio::task::yield_now().await;
        let inner = self.lock();
        let items = inner.objects.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, o)| o.clone()).collect();
        Ok(ObjectList { items, resource_version: Some(inner.last_rv.to_string()) })
    }

    async fn watch(&self, namespace: &str, name: &str, resource_version: &str) -> Result<WatchStream<K>, StoreError> {
        let inner = self.lock();
        let ns = namespace.to_string();
        let name = name.to_string();
        let (since, mut replay) = if resource_version.is_empty() {
            // Start "now": synthesize the current state like an initial list.
            let current = inner.objects.get(&(ns.clone(), name.clone())).cloned();
            (inner.last_rv, current.map(WatchEvent::Added).into_iter().collect::<Vec<_>>())
        } else {
            let since: u64 = resource_version.parse().map_err(|_| other(format!("invalid resourceVersion {:?}", resource_version)))?;
            (since, Vec::new())
        };
        replay.extend(
            inner
                .history
                .iter()
                .filter(|r| r.rv > since && r.namespace == ns && r.name == name)
                .map(|r| r.event.clone()),
        );
        let replayed_until = inner.last_rv;
        let rx = inner.events.subscribe();
        drop(inner);

        let live = futures::stream::unfold(rx, move |mut rx| {
            let ns = ns.clone();
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(rec) if rec.rv > replayed_until && rec.namespace == ns && rec.name == name => return Some((Ok(rec.event), rx)),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(StoreError::Other(format!("watch fell behind by {} events", n))), rx));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(replay.into_iter().map(Ok)).chain(live).boxed())
    }
}
