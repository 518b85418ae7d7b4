//! kfx client – one generic resource client shared by Apps, Routes and Tasks.

#![forbid(unsafe_code)]

use std::time::Duration;

use kfx_core::conditions::CheckError;
use kfx_core::{App, ReconciliationFailure, Route, StoreError, Task};
use tokio_util::sync::CancellationToken;

pub mod client;
pub mod kube_store;
pub mod memory;
pub mod store;

pub use client::Client;
pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use store::{ObjectList, Propagation, ResourceStore, WatchEvent, WatchStream};

pub type AppsClient<S = KubeStore<App>> = Client<App, S>;
pub type RoutesClient<S = KubeStore<Route>> = Client<Route, S>;
pub type TasksClient<S = KubeStore<Task>> = Client<Task, S>;

/// Errors surfaced by [`Client`]. Store conflicts never appear here: they
/// are retried inside `transform` and `upsert`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Mutation(anyhow::Error),
    #[error(transparent)]
    Merge(anyhow::Error),
    #[error(transparent)]
    ReconciliationFailed(ReconciliationFailure),
    #[error("waiting for {kind} timed out")]
    TimedOut { kind: &'static str },
    #[error("{kind} update cancelled")]
    Cancelled { kind: &'static str },
    #[error("{kind} is missing metadata.name")]
    MissingName { kind: &'static str },
    #[error("couldn't list {kind}: {source}")]
    List { kind: &'static str, #[source] source: StoreError },
    #[error("couldn't delete the {kind} with the name {name:?}: {source}")]
    Delete { kind: &'static str, name: String, #[source] source: StoreError },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound(_) => true,
            ClientError::Store(e) | ClientError::List { source: e, .. } | ClientError::Delete { source: e, .. } => e.is_not_found(),
            _ => false,
        }
    }

    /// Deadline or cancellation ended the operation before it finished.
    pub fn is_timeout(&self) -> bool { matches!(self, ClientError::TimedOut { .. } | ClientError::Cancelled { .. }) }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => ClientError::NotFound(msg),
            other => ClientError::Store(other),
        }
    }
}

impl From<CheckError> for ClientError {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::Fetch(e) => e.into(),
            CheckError::Failed(f) => ClientError::ReconciliationFailed(f),
        }
    }
}

/// Token that cancels itself after `timeout`. Must be called within a Tokio runtime.
pub fn cancel_after(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
    token
}

/// Poll interval for condition waits (`KFX_POLL_INTERVAL_MS`, default 1s).
pub fn poll_interval() -> Duration {
    let ms = std::env::var("KFX_POLL_INTERVAL_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(1000);
    Duration::from_millis(ms.max(1))
}

/// Overall deadline for waits (`KFX_WAIT_TIMEOUT_SECS`, default 300s).
pub fn wait_timeout() -> Duration {
    let secs = std::env::var("KFX_WAIT_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(300);
    Duration::from_secs(secs)
}
