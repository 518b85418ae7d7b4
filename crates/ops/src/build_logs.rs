//! Build log tailing. A build runs as one pod whose step containers execute
//! in order; tailing follows each step's log to completion.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, LogParams},
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{lines::pump_lines, OpsError, SharedSink};

/// Sidecars injected next to build steps; their output is noise.
const DENYLIST_STEPS: &[&str] = &["istio-proxy", "istio-init", "sidecar-server"];

/// Label the build controller stamps on the pod it runs for a build.
const BUILD_LABEL: &str = "tekton.dev/taskRun";

/// Streams a build's logs into a sink until the build finishes or `cancel`
/// fires. Callers treat failures as best-effort.
#[async_trait]
pub trait BuildLogs: Send + Sync {
    async fn tail(&self, namespace: &str, build_name: &str, sink: SharedSink, cancel: CancellationToken) -> Result<(), OpsError>;
}

/// Kubernetes-backed [`BuildLogs`]: locates the build pod by label and
/// follows each step container in order.
#[derive(Clone)]
pub struct KubeBuildLogs {
    client: Client,
    poll: Duration,
}

impl KubeBuildLogs {
    pub fn new(client: Client) -> Self { Self { client, poll: Duration::from_millis(100) } }

    /// Waits for the build's pod to be scheduled; returns `None` if cancelled.
    async fn find_pod(&self, api: &Api<Pod>, build_name: &str, cancel: &CancellationToken) -> Result<Option<Pod>, OpsError> {
        let lp = ListParams::default().labels(&format!("{}={}", BUILD_LABEL, build_name));
        loop {
            let pods = api.list(&lp).await?;
            if let Some(pod) = pods.items.into_iter().next() {
                return Ok(Some(pod));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }
}

/// Step containers worth tailing, in execution order.
pub fn step_containers(pod: &Pod) -> Vec<String> {
    let Some(spec) = pod.spec.as_ref() else { return Vec::new() };
    spec.init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter())
        .map(|c| c.name.clone())
        .filter(|n| !DENYLIST_STEPS.contains(&n.as_str()))
        .collect()
}

/// `[<build>/<step>] ` with the controller's `step-` naming stripped.
pub fn step_prefix(build_name: &str, container: &str) -> String {
    format!("[{}/{}] ", build_name, container.strip_prefix("step-").unwrap_or(container))
}

#[async_trait]
impl BuildLogs for KubeBuildLogs {
    async fn tail(&self, namespace: &str, build_name: &str, mut sink: SharedSink, cancel: CancellationToken) -> Result<(), OpsError> {
        use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let Some(pod) = self.find_pod(&api, build_name, &cancel).await? else {
            return Ok(());
        };
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        sink.write_line(&format!("Reading build logs from Pod {}", pod_name))?;

        for container in step_containers(&pod) {
            if cancel.is_cancelled() {
                break;
            }
            let lp = LogParams { follow: true, container: Some(container.clone()), ..LogParams::default() };
            info!(pod = %pod_name, container = %container, "build log stream starting");
            let reader = match api.log_stream(&pod_name, &lp).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(container = %container, error = %e, "step log unavailable");
                    continue;
                }
            };
            // futures AsyncRead -> tokio AsyncRead -> Bytes stream
            let stream = ReaderStream::new(reader.compat());
            pump_lines(stream, &mut sink, &step_prefix(build_name, &container), &cancel, Some(&pod_name)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn container(name: &str) -> Container { Container { name: name.into(), ..Default::default() } }

    #[test]
    fn steps_run_init_first_and_skip_sidecars() {
        let pod = Pod {
            spec: Some(PodSpec {
                init_containers: Some(vec![container("prepare"), container("istio-init")]),
                containers: vec![container("step-build"), container("istio-proxy"), container("step-export")],
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(step_containers(&pod), vec!["prepare", "step-build", "step-export"]);
    }

    #[test]
    fn prefix_strips_step_naming() {
        assert_eq!(step_prefix("app-1", "step-build"), "[app-1/build] ");
        assert_eq!(step_prefix("app-1", "prepare"), "[app-1/prepare] ");
    }
}
