use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kfx_client::{ResourceStore, WatchEvent};
use kfx_core::conditions::{find_condition, observed_generation_matches_generation};
use kfx_core::{App, AppConditionType, ConditionStatus, KfObject};
use kfx_ops::{BuildLogs, SharedSink};
use metrics::histogram;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DeployError, DeployReport, DeployTarget, Phase};

const LOG_PREFIX: &str = "[deploy] ";

/// How long exit waits for the build-log task to notice cancellation.
const TAIL_SHUTDOWN: Duration = Duration::from_secs(1);

/// Pause between a watch session ending without a verdict and the next one.
const REWATCH_BACKOFF: Duration = Duration::from_millis(250);

/// Follows one App rollout through its watch stream and reports progress.
pub struct DeployPipeline<S> {
    store: S,
    logs: Arc<dyn BuildLogs>,
    target: DeployTarget,
    phase: Phase,
    resource_version: String,
    started: Instant,
    build: Option<Duration>,
    deploy_started: Option<Instant>,
    cancel: CancellationToken,
    tail: Option<JoinHandle<()>>,
}

enum Outcome {
    Done(DeployReport),
    NotDone,
}

impl<S: ResourceStore<App>> DeployPipeline<S> {
    pub fn new(store: S, logs: Arc<dyn BuildLogs>, target: DeployTarget) -> Self {
        let resource_version = target.resource_version.clone();
        Self {
            store,
            logs,
            target,
            phase: Phase::AwaitingSource,
            resource_version,
            started: Instant::now(),
            build: None,
            deploy_started: None,
            cancel: CancellationToken::new(),
            tail: None,
        }
    }

    pub fn phase(&self) -> Phase { self.phase }

    /// Block until the rollout finishes or `cancel` fires. Watch sessions
    /// that end without a verdict are resumed, after a short pause, from a
    /// refreshed resourceVersion.
    pub async fn run(&mut self, mut sink: SharedSink, cancel: &CancellationToken) -> Result<DeployReport, DeployError> {
        self.started = Instant::now();
        say(&mut sink, &format!("Starting app: {}", self.target.app_name))?;
        let res = loop {
            let outcome = tokio::select! {
                out = self.session(&mut sink) => out,
                _ = cancel.cancelled() => Err(DeployError::Cancelled),
            };
            match outcome {
                Ok(Outcome::Done(report)) => break Ok(report),
                Ok(Outcome::NotDone) => {}
                Err(e) => break Err(e),
            }
            tokio::select! {
                _ = tokio::time::sleep(REWATCH_BACKOFF) => {}
                _ = cancel.cancelled() => break Err(DeployError::Cancelled),
            }
            let listed = tokio::select! {
                l = self.store.list(&self.target.namespace) => l,
                _ = cancel.cancelled() => break Err(DeployError::Cancelled),
            };
            // Not worth reporting: the next watch just starts from the old version.
            match listed {
                Ok(list) => {
                    if let Some(rv) = list.resource_version {
                        self.resource_version = rv;
                    }
                }
                Err(e) => debug!(error = %e, "relist failed"),
            }
            debug!(app = %self.target.app_name, rv = %self.resource_version, "re-watching");
        };
        if res.is_err() {
            self.phase = Phase::Failed;
        }
        self.shutdown_tail().await;
        res
    }

    async fn session(&mut self, sink: &mut SharedSink) -> Result<Outcome, DeployError> {
        let mut events = self
            .store
            .watch(&self.target.namespace, &self.target.app_name, &self.resource_version)
            .await
            .map_err(|source| DeployError::Watch { name: self.target.app_name.clone(), source })?;
        info!(app = %self.target.app_name, rv = %self.resource_version, phase = ?self.phase, "watch session started");

        while let Some(ev) = events.next().await {
            match ev {
                Err(e) => {
                    warn!(error = %e, "watch stream error");
                    return Ok(Outcome::NotDone);
                }
                Ok(WatchEvent::Bookmark(rv)) => self.resource_version = rv,
                Ok(WatchEvent::Error { code, reason, message }) => {
                    debug!(code, "watch status error");
                    say(sink, &format!("status error: {}:{}", reason, message))?;
                    return Ok(Outcome::NotDone);
                }
                Ok(WatchEvent::Deleted(_)) => return Err(DeployError::AppDeleted),
                Ok(WatchEvent::Added(app)) | Ok(WatchEvent::Modified(app)) => {
                    if let Some(rv) = app.metadata.resource_version.clone() {
                        self.resource_version = rv;
                    }
                    // skip out of date apps
                    if !observed_generation_matches_generation(&app) {
                        debug!(generation = app.generation(), observed = app.observed_generation(), "stale App event");
                        continue;
                    }
                    if let Outcome::Done(report) = self.on_update(&app, sink)? {
                        return Ok(Outcome::Done(report));
                    }
                }
            }
        }
        Ok(Outcome::NotDone)
    }

    fn on_update(&mut self, app: &App, sink: &mut SharedSink) -> Result<Outcome, DeployError> {
        let Some(source) = find_condition(app, AppConditionType::SourceReady) else {
            // source might still be creating
            return Ok(Outcome::NotDone);
        };
        if !source.message.is_empty() {
            say(sink, &format!("Updated state to: {}", source.message))?;
        }
        if let Some(pending) = pending_conditions(app) {
            say(sink, &pending)?;
        }

        match source.status {
            ConditionStatus::True => {
                if matches!(self.phase, Phase::AwaitingSource | Phase::TailingBuild) {
                    let built = self.started.elapsed();
                    self.build = Some(built);
                    self.deploy_started = Some(Instant::now());
                    self.cancel_tail();
                    self.phase = Phase::AwaitingDeploy;
                    histogram!("kfx_deploy_build_seconds", built.as_secs_f64());
                    say(sink, &format!("Built in {:.2} seconds", built.as_secs_f64()))?;
                }
            }
            ConditionStatus::False => {
                self.cancel_tail();
                say(sink, &format!("Failed to build: {}", source.message))?;
                return Err(DeployError::BuildFailed(source.message.clone()));
            }
            ConditionStatus::Unknown => {
                if self.phase == Phase::AwaitingSource && self.start_tail(app, sink.clone()) {
                    self.phase = Phase::TailingBuild;
                }
                return Ok(Outcome::NotDone);
            }
        }

        if self.target.no_start {
            let total = self.started.elapsed();
            say(sink, &format!("Total deploy time {:.2} seconds", total.as_secs_f64()))?;
            self.phase = Phase::Ready;
            return Ok(Outcome::Done(DeployReport { build: self.build, deploy: None, total }));
        }

        let Some(ready) = find_condition(app, AppConditionType::Ready) else {
            return Ok(Outcome::NotDone);
        };
        if !ready.message.is_empty() {
            say(sink, &format!("Updated state to: {}", ready.message))?;
        }
        match ready.status {
            ConditionStatus::True => {
                let deploy = self.deploy_started.map(|t| t.elapsed()).unwrap_or_default();
                let total = self.started.elapsed();
                histogram!("kfx_deploy_ready_seconds", deploy.as_secs_f64());
                say(sink, &format!("App took {:.2} seconds to become ready.", deploy.as_secs_f64()))?;
                say(sink, &format!("Total deploy time {:.2} seconds", total.as_secs_f64()))?;
                self.phase = Phase::Ready;
                Ok(Outcome::Done(DeployReport { build: self.build, deploy: Some(deploy), total }))
            }
            ConditionStatus::False => {
                say(sink, &format!("Failed to deploy: {}", ready.message))?;
                Err(DeployError::DeployFailed(ready.message.clone()))
            }
            ConditionStatus::Unknown => Ok(Outcome::NotDone),
        }
    }

    /// Spawn the build-log tail; false while the App names no build yet.
    fn start_tail(&mut self, app: &App, sink: SharedSink) -> bool {
        let Some(build) = app.status.as_ref().and_then(|s| s.latest_created_source_name.clone()).filter(|b| !b.is_empty()) else {
            debug!(app = %self.target.app_name, "no build to tail yet");
            return false;
        };
        let logs = self.logs.clone();
        let namespace = self.target.namespace.clone();
        let cancel = self.cancel.child_token();
        info!(build = %build, "tailing build logs");
        self.tail = Some(tokio::spawn(async move {
            // tail errors are spurious (pod not scheduled yet, stream reset)
            if let Err(e) = logs.tail(&namespace, &build, sink, cancel).await {
                debug!(build = %build, error = %e, "build log tail ended");
            }
        }));
        true
    }

    fn cancel_tail(&self) { self.cancel.cancel(); }

    async fn shutdown_tail(&mut self) {
        self.cancel.cancel();
        if let Some(mut handle) = self.tail.take() {
            if tokio::time::timeout(TAIL_SHUTDOWN, &mut handle).await.is_err() {
                handle.abort();
            }
        }
    }
}

impl<S> Drop for DeployPipeline<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.tail.take() {
            handle.abort();
        }
    }
}

fn say(sink: &mut SharedSink, msg: &str) -> Result<(), DeployError> {
    sink.write_line(&format!("{}{}", LOG_PREFIX, msg))?;
    Ok(())
}

/// `Pending Conditions: A: False, B: Unknown`, sorted, or `None` if all are true.
fn pending_conditions(app: &App) -> Option<String> {
    let mut conds: Vec<String> = app
        .conditions()
        .iter()
        .filter(|c| c.status != ConditionStatus::True)
        .map(|c| format!("{}: {}", c.type_, c.status))
        .collect();
    if conds.is_empty() {
        return None;
    }
    conds.sort();
    Some(format!("Pending Conditions: {}", conds.join(", ")))
}
