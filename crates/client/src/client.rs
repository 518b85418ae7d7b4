//! Generic resource client: pass-through CRUD, conflict-retrying
//! `transform`/`upsert`, and condition-polling waits.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use kfx_core::conditions::{self, CheckResult};
use kfx_core::{App, AppConditionType, KfObject, StoreError, Task, TaskConditionType};
use metrics::counter;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::{Propagation, ResourceStore};
use crate::ClientError;

fn cancelled<K: KfObject>() -> ClientError { ClientError::Cancelled { kind: K::FRIENDLY_NAME } }

/// Run a store call, abandoning it with `on_cancel` once `cancel` fires.
async fn or_cancel<T>(cancel: &CancellationToken, on_cancel: ClientError, call: impl Future<Output = T>) -> Result<T, ClientError> {
    tokio::select! {
        out = call => Ok(out),
        _ = cancel.cancelled() => Err(on_cancel),
    }
}

pub struct Client<K, S> {
    store: S,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S: Clone> Clone for Client<K, S> {
    fn clone(&self) -> Self { Self { store: self.store.clone(), _kind: PhantomData } }
}

impl<K: KfObject, S: ResourceStore<K>> Client<K, S> {
    pub fn new(store: S) -> Self { Self { store, _kind: PhantomData } }

    pub fn store(&self) -> &S { &self.store }

    pub async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClientError> {
        Ok(self.store.create(namespace, obj).await?)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<K, ClientError> {
        Ok(self.store.get(namespace, name).await?)
    }

    /// Delete with foreground propagation: the object lingers until
    /// everything it owns is gone.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.store
            .delete(namespace, name, Propagation::Foreground)
            .await
            .map_err(|source| ClientError::Delete { kind: K::FRIENDLY_NAME, name: name.to_string(), source })
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<K>, ClientError> {
        self.store
            .list(namespace)
            .await
            .map(|l| l.items)
            .map_err(|source| ClientError::List { kind: K::FRIENDLY_PLURAL, source })
    }

    /// Read/modify/write the named object, retrying the whole cycle for as
    /// long as the update loses an optimistic-concurrency race.
    ///
    /// Mutator errors abort immediately. The only bound on retries is
    /// `cancel`.
    pub async fn transform<M>(&self, namespace: &str, name: &str, mut mutator: M, cancel: &CancellationToken) -> Result<K, ClientError>
    where
        M: FnMut(&mut K) -> anyhow::Result<()> + Send,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(cancelled::<K>());
            }
            let mut obj = or_cancel(cancel, cancelled::<K>(), self.get(namespace, name)).await??;
            mutator(&mut obj).map_err(ClientError::Mutation)?;
            match or_cancel(cancel, cancelled::<K>(), self.store.update(namespace, &obj)).await? {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    debug!(kind = K::FRIENDLY_NAME, ns = %namespace, name = %name, "transform conflict; retrying");
                    counter!("kfx_client_conflict_retries_total", 1u64, "kind" => K::FRIENDLY_NAME, "op" => "transform");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Create `desired` if absent, otherwise update with
    /// `merge(desired, existing)`. Conflicts, including a lost create race,
    /// re-fetch and re-merge, so `merge` must be pure.
    pub async fn upsert<F>(&self, namespace: &str, desired: &K, mut merge: F, cancel: &CancellationToken) -> Result<K, ClientError>
    where
        F: FnMut(&K, &K) -> anyhow::Result<K> + Send,
    {
        let name = desired.meta().name.clone().ok_or(ClientError::MissingName { kind: K::FRIENDLY_NAME })?;
        while !cancel.is_cancelled() {
            let existing = match or_cancel(cancel, cancelled::<K>(), self.store.get(namespace, &name)).await? {
                Ok(o) => o,
                Err(e) if e.is_not_found() => {
                    info!(kind = K::FRIENDLY_NAME, ns = %namespace, name = %name, "creating");
                    match or_cancel(cancel, cancelled::<K>(), self.store.create(namespace, desired)).await? {
                        Ok(created) => return Ok(created),
                        // someone else created it first; merge into theirs
                        Err(e) if e.is_conflict() => {
                            counter!("kfx_client_conflict_retries_total", 1u64, "kind" => K::FRIENDLY_NAME, "op" => "upsert");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            };
            let merged = merge(desired, &existing).map_err(ClientError::Merge)?;
            match or_cancel(cancel, cancelled::<K>(), self.store.update(namespace, &merged)).await? {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    debug!(kind = K::FRIENDLY_NAME, ns = %namespace, name = %name, "upsert conflict; retrying");
                    counter!("kfx_client_conflict_retries_total", 1u64, "kind" => K::FRIENDLY_NAME, "op" => "upsert");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(cancelled::<K>())
    }

    /// Poll until `predicate` holds on an up-to-date object. The first poll
    /// happens immediately; a `False` condition fails the wait.
    pub async fn wait_for<P>(&self, namespace: &str, name: &str, interval: Duration, predicate: P, cancel: &CancellationToken) -> Result<K, ClientError>
    where
        P: Fn(&K) -> bool + Send,
    {
        self.wait_for_e(namespace, name, interval, conditions::wrap_predicate(predicate), cancel)
            .await?
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    /// Poll every `interval` until `condition` reports done or `cancel` fires.
    /// Fetch errors are handed to `condition`, which decides if they end the wait.
    async fn wait_for_e<F>(&self, namespace: &str, name: &str, interval: Duration, mut condition: F, cancel: &CancellationToken) -> Result<Option<K>, ClientError>
    where
        F: FnMut(Result<&K, &StoreError>) -> CheckResult + Send,
    {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        tick.tick().await;
        loop {
            let fetched = or_cancel(cancel, ClientError::TimedOut { kind: K::FRIENDLY_NAME }, self.store.get(namespace, name)).await?;
            counter!("kfx_client_wait_polls_total", 1u64, "kind" => K::FRIENDLY_NAME);
            if condition(fetched.as_ref())? {
                return Ok(fetched.ok());
            }
            tokio::select! {
                _ = tick.tick() => {}
                _ = cancel.cancelled() => return Err(ClientError::TimedOut { kind: K::FRIENDLY_NAME }),
            }
        }
    }

    pub async fn wait_for_deletion(&self, namespace: &str, name: &str, interval: Duration, cancel: &CancellationToken) -> Result<(), ClientError> {
        self.wait_for_e(namespace, name, interval, conditions::condition_deleted::<K>, cancel).await?;
        Ok(())
    }

    pub async fn wait_for_condition_true(&self, namespace: &str, name: &str, interval: Duration, condition: K::Condition, cancel: &CancellationToken) -> Result<K, ClientError> {
        self.wait_for_e(namespace, name, interval, move |fetched| conditions::check_condition_true(fetched, condition), cancel)
            .await?
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    pub async fn wait_for_condition_ready_true(&self, namespace: &str, name: &str, interval: Duration, cancel: &CancellationToken) -> Result<K, ClientError> {
        use kfx_core::ConditionType;
        self.wait_for_condition_true(namespace, name, interval, K::Condition::READY, cancel).await
    }
}

impl<S: ResourceStore<App>> Client<App, S> {
    pub async fn wait_for_condition_routes_ready_true(&self, namespace: &str, name: &str, interval: Duration, cancel: &CancellationToken) -> Result<App, ClientError> {
        self.wait_for_condition_true(namespace, name, interval, AppConditionType::RoutesReady, cancel).await
    }

    pub async fn wait_for_condition_service_bindings_ready_true(&self, namespace: &str, name: &str, interval: Duration, cancel: &CancellationToken) -> Result<App, ClientError> {
        self.wait_for_condition_true(namespace, name, interval, AppConditionType::ServiceBindingsReady, cancel).await
    }
}

impl<S: ResourceStore<Task>> Client<Task, S> {
    pub async fn wait_for_condition_succeeded_true(&self, namespace: &str, name: &str, interval: Duration, cancel: &CancellationToken) -> Result<Task, ClientError> {
        self.wait_for_condition_true(namespace, name, interval, TaskConditionType::Succeeded, cancel).await
    }

    /// Ask the reconciler to stop a running Task.
    pub async fn terminate(&self, namespace: &str, name: &str, cancel: &CancellationToken) -> Result<Task, ClientError> {
        self.transform(
            namespace,
            name,
            |task| {
                task.spec.terminated = true;
                Ok(())
            },
            cancel,
        )
        .await
    }
}
