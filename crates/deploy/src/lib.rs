//! kfx deploy: follow an App from source build to ready instances.
//!
//! The pipeline watches a single App and walks
//! `AwaitingSource -> TailingBuild -> AwaitingDeploy -> Ready | Failed`,
//! streaming build logs while the source is building and printing
//! `[deploy] ` progress lines to the caller's sink.

#![forbid(unsafe_code)]

use std::time::Duration;

use kfx_core::{App, StoreError};

mod pipeline;

pub use pipeline::DeployPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingSource,
    TailingBuild,
    AwaitingDeploy,
    Ready,
    Failed,
}

/// Which rollout to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub namespace: String,
    pub app_name: String,
    /// Watch from here; empty means "current state".
    pub resource_version: String,
    /// The App is stopped, so success is a finished build.
    pub no_start: bool,
}

impl DeployTarget {
    /// Target the rollout of the App exactly as it was written.
    pub fn for_app(app: &App) -> Self {
        Self {
            namespace: app.metadata.namespace.clone().unwrap_or_default(),
            app_name: app.metadata.name.clone().unwrap_or_default(),
            resource_version: app.metadata.resource_version.clone().unwrap_or_default(),
            no_start: app.spec.instances.stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployReport {
    pub build: Option<Duration>,
    /// Unset when the App was deployed without starting.
    pub deploy: Option<Duration>,
    pub total: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("couldn't watch App {name:?}: {source}")]
    Watch { name: String, #[source] source: StoreError },
    #[error("build failed: {0}")]
    BuildFailed(String),
    #[error("deployment failed: {0}")]
    DeployFailed(String),
    #[error("App was deleted")]
    AppDeleted,
    #[error("stopped waiting for the deployment")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
