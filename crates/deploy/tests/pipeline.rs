#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kfx_client::{cancel_after, MemoryStore, ObjectList, Propagation, ResourceStore, WatchEvent, WatchStream};
use kfx_core::{App, AppSpec, Condition, ConditionStatus, KfObject, StoreError};
use kfx_deploy::{DeployError, DeployPipeline, DeployTarget, Phase};
use kfx_ops::{BuildLogs, OpsError, SharedSink};
use tokio_util::sync::CancellationToken;

const NS: &str = "space";
const BUILD: &str = "web-build-1";

#[derive(Default)]
struct FakeLogs {
    started: Mutex<Vec<String>>,
    cancelled: AtomicBool,
}

#[async_trait]
impl BuildLogs for FakeLogs {
    async fn tail(&self, _namespace: &str, build_name: &str, mut sink: SharedSink, cancel: CancellationToken) -> Result<(), OpsError> {
        self.started.lock().expect("lock").push(build_name.to_string());
        sink.write_line(&format!("[{}/build] compiling", build_name))?;
        cancel.cancelled().await;
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl FakeLogs {
    fn started(&self) -> Vec<String> { self.started.lock().expect("lock").clone() }
    fn was_cancelled(&self) -> bool { self.cancelled.load(Ordering::SeqCst) }
}

/// Reconciler stand-in: replace the given conditions and mark the App observed.
fn set(store: &MemoryStore<App>, conds: &[(&str, ConditionStatus, &str)]) {
    store
        .reconcile(NS, "web", |app| {
            for (t, s, m) in conds {
                app.conditions_mut().retain(|c| c.type_ != *t);
                app.conditions_mut().push(Condition::new(*t, *s).with_message(*m));
            }
            app.status.get_or_insert_with(Default::default).latest_created_source_name = Some(BUILD.into());
        })
        .expect("reconcile");
}

async fn setup(stopped: bool) -> (Arc<MemoryStore<App>>, App) {
    let store = Arc::new(MemoryStore::<App>::new());
    let mut app = App::new("web", AppSpec::default());
    app.spec.instances.stopped = stopped;
    let created = store.create(NS, &app).await.expect("create");
    (store, created)
}

fn output() -> (Arc<Mutex<Vec<u8>>>, SharedSink) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let sink = SharedSink::from_shared(buf.clone());
    (buf, sink)
}

fn text(buf: &Arc<Mutex<Vec<u8>>>) -> String { String::from_utf8_lossy(&buf.lock().expect("lock")).into_owned() }

async fn step() { tokio::time::sleep(Duration::from_millis(10)).await; }

#[tokio::test]
async fn successful_deploy_reports_build_and_ready_durations() {
    let (store, created) = setup(false).await;
    let logs = Arc::new(FakeLogs::default());
    let script = {
        let store = store.clone();
        tokio::spawn(async move {
            step().await;
            set(&store, &[("SourceReady", ConditionStatus::Unknown, "Building")]);
            step().await;
            set(&store, &[("SourceReady", ConditionStatus::True, ""), ("Ready", ConditionStatus::Unknown, "Deploying")]);
            step().await;
            set(&store, &[("Ready", ConditionStatus::True, "")]);
        })
    };
    let (buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), logs.clone(), DeployTarget::for_app(&created));
    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").expect("deployed");
    script.await.expect("join");

    let build = report.build.expect("build duration");
    let deploy = report.deploy.expect("deploy duration");
    assert!(build > Duration::ZERO);
    assert!(deploy > Duration::ZERO);
    assert!(report.total >= build);
    assert_eq!(pipeline.phase(), Phase::Ready);
    assert_eq!(logs.started(), vec![BUILD.to_string()]);
    assert!(logs.was_cancelled());

    let out = text(&buf);
    assert!(out.starts_with("[deploy] Starting app: web\n"), "{}", out);
    assert!(out.contains("[deploy] Updated state to: Building\n"));
    assert!(out.contains("[deploy] Pending Conditions: SourceReady: Unknown\n"));
    assert!(out.contains("[web-build-1/build] compiling\n"));
    assert!(out.contains("[deploy] Built in "));
    assert!(out.contains("[deploy] Pending Conditions: Ready: Unknown\n"));
    assert!(out.contains("[deploy] App took "));
    assert!(out.contains("[deploy] Total deploy time "));
}

#[tokio::test]
async fn build_failure_carries_message_and_stops_tail() {
    let (store, created) = setup(false).await;
    let logs = Arc::new(FakeLogs::default());
    let script = {
        let store = store.clone();
        tokio::spawn(async move {
            step().await;
            set(&store, &[("SourceReady", ConditionStatus::Unknown, "")]);
            step().await;
            set(&store, &[("SourceReady", ConditionStatus::False, "boom")]);
        })
    };
    let (buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), logs.clone(), DeployTarget::for_app(&created));
    let err = tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").unwrap_err();
    script.await.expect("join");

    assert!(matches!(err, DeployError::BuildFailed(ref m) if m == "boom"));
    assert_eq!(err.to_string(), "build failed: boom");
    assert_eq!(pipeline.phase(), Phase::Failed);
    assert!(logs.was_cancelled());
    assert!(text(&buf).contains("[deploy] Failed to build: boom\n"));
}

#[tokio::test]
async fn deploy_failure_is_reported() {
    let (store, created) = setup(false).await;
    set(&store, &[("SourceReady", ConditionStatus::True, ""), ("Ready", ConditionStatus::False, "crash loop")]);
    let (buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), Arc::new(FakeLogs::default()), DeployTarget::for_app(&created));
    let err = tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").unwrap_err();
    assert_eq!(err.to_string(), "deployment failed: crash loop");
    assert!(text(&buf).contains("[deploy] Failed to deploy: crash loop\n"));
}

#[tokio::test]
async fn stopped_app_finishes_after_build_without_ready() {
    let (store, created) = setup(true).await;
    let logs = Arc::new(FakeLogs::default());
    let script = {
        let store = store.clone();
        tokio::spawn(async move {
            step().await;
            set(&store, &[("SourceReady", ConditionStatus::Unknown, "")]);
            step().await;
            set(&store, &[("SourceReady", ConditionStatus::True, "")]);
        })
    };
    let (buf, sink) = output();
    let target = DeployTarget::for_app(&created);
    assert!(target.no_start);
    let mut pipeline = DeployPipeline::new(store.clone(), logs.clone(), target);
    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").expect("built");
    script.await.expect("join");

    assert!(report.build.is_some());
    assert!(report.deploy.is_none());
    let out = text(&buf);
    assert!(out.contains("[deploy] Total deploy time "));
    assert!(!out.contains("App took"));
}

#[tokio::test]
async fn stale_generations_are_ignored() {
    let (store, created) = setup(false).await;
    let mut scaled = created.clone();
    scaled.spec.instances.replicas = Some(3);
    store.update(NS, &scaled).await.expect("scale");

    // status written for the previous generation
    let mut stale = store.get(NS, "web").await.expect("get");
    assert_eq!(stale.generation(), 2);
    stale.set_observed_generation(1);
    stale.conditions_mut().push(Condition::new("SourceReady", ConditionStatus::False).with_message("old failure"));
    store.update_status(NS, &stale).expect("stale status");

    set(&store, &[("SourceReady", ConditionStatus::True, ""), ("Ready", ConditionStatus::True, "")]);

    let (buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), Arc::new(FakeLogs::default()), DeployTarget::for_app(&created));
    tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").expect("deployed");
    assert!(!text(&buf).contains("old failure"));
}

#[tokio::test]
async fn deleted_app_ends_the_pipeline() {
    let (store, created) = setup(false).await;
    let deleter = {
        let store = store.clone();
        tokio::spawn(async move {
            step().await;
            store.delete(NS, "web", Propagation::Foreground).await.expect("delete");
        })
    };
    let (_buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), Arc::new(FakeLogs::default()), DeployTarget::for_app(&created));
    let err = tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").unwrap_err();
    deleter.await.expect("join");
    assert!(matches!(err, DeployError::AppDeleted));
    assert_eq!(err.to_string(), "App was deleted");
}

#[tokio::test]
async fn watch_establishment_errors_are_returned() {
    let (store, created) = setup(false).await;
    let mut target = DeployTarget::for_app(&created);
    target.resource_version = "not-a-version".into();
    let (_buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store, Arc::new(FakeLogs::default()), target);
    let err = pipeline.run(sink, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, DeployError::Watch { .. }));
    assert!(err.to_string().contains("invalid resourceVersion"));
}

/// Serves pre-scripted watch sessions and records where each one started.
struct Scripted {
    sessions: Mutex<VecDeque<Vec<WatchEvent<App>>>>,
    list_rv: Option<String>,
    watched_from: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(sessions: Vec<Vec<WatchEvent<App>>>, list_rv: Option<&str>) -> Arc<Self> {
        Arc::new(Self { sessions: Mutex::new(sessions.into()), list_rv: list_rv.map(str::to_string), watched_from: Mutex::new(Vec::new()) })
    }

    fn watched_from(&self) -> Vec<String> { self.watched_from.lock().expect("lock").clone() }
}

#[async_trait]
impl ResourceStore<App> for Scripted {
    async fn get(&self, _ns: &str, _name: &str) -> Result<App, StoreError> { Err(StoreError::Other("unused".into())) }
    async fn create(&self, _ns: &str, _obj: &App) -> Result<App, StoreError> { Err(StoreError::Other("unused".into())) }
    async fn update(&self, _ns: &str, _obj: &App) -> Result<App, StoreError> { Err(StoreError::Other("unused".into())) }
    async fn delete(&self, _ns: &str, _name: &str, _p: Propagation) -> Result<(), StoreError> { Err(StoreError::Other("unused".into())) }

    async fn list(&self, _ns: &str) -> Result<ObjectList<App>, StoreError> {
        match &self.list_rv {
            Some(rv) => Ok(ObjectList { items: Vec::new(), resource_version: Some(rv.clone()) }),
            None => Err(StoreError::Other("list forbidden".into())),
        }
    }

    async fn watch(&self, _ns: &str, _name: &str, rv: &str) -> Result<WatchStream<App>, StoreError> {
        self.watched_from.lock().expect("lock").push(rv.to_string());
        let events = self.sessions.lock().expect("lock").pop_front().unwrap_or_default();
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

fn ready_app() -> App {
    let mut app = App::new("web", AppSpec::default());
    app.metadata.generation = Some(1);
    app.set_observed_generation(1);
    app.conditions_mut().push(Condition::new("SourceReady", ConditionStatus::True));
    app.conditions_mut().push(Condition::new("Ready", ConditionStatus::True));
    app
}

fn target() -> DeployTarget {
    DeployTarget { namespace: NS.into(), app_name: "web".into(), resource_version: "1".into(), no_start: false }
}

#[tokio::test]
async fn status_error_relists_and_rewatches() {
    let store = Scripted::new(
        vec![
            vec![WatchEvent::Error { code: 410, reason: "Expired".into(), message: "too old".into() }],
            vec![WatchEvent::Modified(ready_app())],
        ],
        Some("42"),
    );
    let (buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), Arc::new(FakeLogs::default()), target());
    tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").expect("deployed");
    assert_eq!(store.watched_from(), vec!["1".to_string(), "42".to_string()]);
    assert!(text(&buf).contains("[deploy] status error: Expired:too old\n"));
}

#[tokio::test]
async fn bookmarks_advance_the_resume_point() {
    let store = Scripted::new(vec![vec![WatchEvent::Bookmark("7".into())], vec![WatchEvent::Added(ready_app())]], None);
    let (_buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), Arc::new(FakeLogs::default()), target());
    tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new())).await.expect("finished").expect("deployed");
    assert_eq!(store.watched_from(), vec!["1".to_string(), "7".to_string()]);
}

#[tokio::test]
async fn empty_sessions_back_off_until_cancelled() {
    let store = Scripted::new(Vec::new(), None);
    let (_buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store.clone(), Arc::new(FakeLogs::default()), target());
    let err = tokio::time::timeout(Duration::from_secs(2), pipeline.run(sink, &cancel_after(Duration::from_millis(600))))
        .await
        .expect("run outlived its deadline")
        .unwrap_err();
    assert!(matches!(err, DeployError::Cancelled));
    assert_eq!(pipeline.phase(), Phase::Failed);
    let watches = store.watched_from().len();
    assert!((2..=4).contains(&watches), "{} watch sessions", watches);
}

fn building_app(build: Option<&str>) -> App {
    let mut app = App::new("web", AppSpec::default());
    app.metadata.generation = Some(1);
    app.set_observed_generation(1);
    app.conditions_mut().push(Condition::new("SourceReady", ConditionStatus::Unknown));
    app.status.get_or_insert_with(Default::default).latest_created_source_name = build.map(str::to_string);
    app
}

#[tokio::test]
async fn build_tail_starts_once_the_build_is_named() {
    let store = Scripted::new(
        vec![vec![
            WatchEvent::Modified(building_app(None)),
            WatchEvent::Modified(building_app(Some(BUILD))),
            WatchEvent::Modified(ready_app()),
        ]],
        None,
    );
    let logs = Arc::new(FakeLogs::default());
    let (_buf, sink) = output();
    let mut pipeline = DeployPipeline::new(store, logs.clone(), target());
    let report = tokio::time::timeout(Duration::from_secs(5), pipeline.run(sink, &CancellationToken::new()))
        .await
        .expect("finished")
        .expect("deployed");
    assert!(report.build.is_some());
    assert_eq!(logs.started(), vec![BUILD.to_string()]);
}
