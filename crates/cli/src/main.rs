use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::NamespaceResourceScope;
use kfx_client::{cancel_after, poll_interval, wait_timeout, AppsClient, Client, KubeStore, TasksClient};
use kfx_core::kinds::RouteSpecFields;
use kfx_core::{App, ConditionType, KfObject, Route, Task};
use kfx_deploy::{DeployError, DeployPipeline, DeployTarget};
use kfx_ops::{demux_stream, random_prefix, KubeBuildLogs, LineDemux, SharedSink};
use kfx_routes::RouteBinder;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod next_actions;

use next_actions::NextActions;

#[derive(Parser, Debug)]
#[command(name = "kfxctl", version, about = "kfx CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { App, Route, Task }

impl Kind {
    fn cli_name(self) -> &'static str {
        match self {
            Kind::App => "app",
            Kind::Route => "route",
            Kind::Task => "task",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow an App's build and rollout until it is ready
    DeployLogs {
        app: String,
    },
    /// Bind an App to a Route, creating the Route if needed
    MapRoute {
        app: String,
        domain: String,
        #[arg(long, default_value = "")]
        hostname: String,
        #[arg(long, default_value = "")]
        path: String,
        /// Return without waiting for the App's routes to become ready
        #[arg(long = "async", action = ArgAction::SetTrue)]
        no_wait: bool,
    },
    /// Remove an App from a Route
    UnmapRoute {
        app: String,
        domain: String,
        #[arg(long, default_value = "")]
        hostname: String,
        #[arg(long, default_value = "")]
        path: String,
    },
    /// Block until a resource reports a condition as True, or is gone
    Wait {
        #[arg(value_enum)]
        kind: Kind,
        name: String,
        /// Condition type, e.g. Ready, RoutesReady, Succeeded
        #[arg(long)]
        condition: Option<String>,
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "condition")]
        deleted: bool,
    },
    /// Delete a resource and wait for it to disappear
    Delete {
        #[arg(value_enum)]
        kind: Kind,
        name: String,
        #[arg(long = "async", action = ArgAction::SetTrue)]
        no_wait: bool,
    },
    /// Stop a running Task
    TerminateTask {
        name: String,
    },
    /// Split prefixed lines on stdin into per-prefix files
    Demux {
        /// PREFIX=FILE; lines containing PREFIX go to FILE, the rest to stdout
        #[arg(long = "route", value_parser = parse_route)]
        routes: Vec<(String, PathBuf)>,
    },
    /// Print a fresh random prefix for tagging a producer's output
    Prefix,
}

fn parse_route(s: &str) -> Result<(String, PathBuf), String> {
    match s.rsplit_once('=') {
        Some((prefix, file)) if !prefix.is_empty() && !file.is_empty() => Ok((prefix.to_string(), PathBuf::from(file))),
        _ => Err(format!("expected PREFIX=FILE, got {:?}", s)),
    }
}

fn init_tracing() {
    let env = std::env::var("KFX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries command output
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KFX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KFX_METRICS_ADDR; expected host:port");
        }
    }
}

/// Overall bound on `deploy-logs` (`KFX_DEPLOY_TIMEOUT_SECS`, default 15m).
fn deploy_timeout() -> Duration {
    let secs = std::env::var("KFX_DEPLOY_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(900);
    Duration::from_secs(secs)
}

struct Ctx {
    client: kube::Client,
    namespace: String,
    output: Output,
}

impl Ctx {
    async fn connect(namespace: Option<String>, output: Output) -> Result<Self> {
        let client = kube::Client::try_default().await.context("couldn't connect to the cluster")?;
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        Ok(Self { client, namespace, output })
    }

    fn kind<K>(&self) -> Client<K, KubeStore<K>>
    where
        K: KfObject + Resource<Scope = NamespaceResourceScope>,
    {
        Client::new(KubeStore::new(self.client.clone()))
    }

    fn apps(&self) -> AppsClient { self.kind::<App>() }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let output = cli.output;
    let mut next = NextActions::default();

    match run(cli, &mut next).await {
        Ok(()) => {
            if output == Output::Human && !next.is_empty() {
                if let Err(e) = next.flush(&mut std::io::stdout()) {
                    warn!(error = %e, "couldn't print next steps");
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, next: &mut NextActions) -> Result<()> {
    match cli.command {
        Commands::Demux { routes } => return demux(routes).await,
        Commands::Prefix => {
            println!("{}", random_prefix());
            return Ok(());
        }
        _ => {}
    }

    let ctx = Ctx::connect(cli.namespace, cli.output).await?;
    match cli.command {
        Commands::DeployLogs { app } => deploy_logs(&ctx, &app, next).await,
        Commands::MapRoute { app, domain, hostname, path, no_wait } => {
            let fields = RouteSpecFields::new(hostname, domain, path);
            map_route(&ctx, &app, &fields, no_wait, next).await.context("failed to map Route")
        }
        Commands::UnmapRoute { app, domain, hostname, path } => {
            let fields = RouteSpecFields::new(hostname, domain, path);
            unmap_route(&ctx, &app, &fields, next).await.context("failed to unmap Route")
        }
        Commands::Wait { kind, name, condition, deleted } => match kind {
            Kind::App => wait::<App>(&ctx, &name, condition.as_deref(), deleted).await,
            Kind::Route => wait::<Route>(&ctx, &name, condition.as_deref(), deleted).await,
            Kind::Task => wait::<Task>(&ctx, &name, condition.as_deref(), deleted).await,
        },
        Commands::Delete { kind, name, no_wait } => {
            match kind {
                Kind::App => delete::<App>(&ctx, &name, no_wait).await?,
                Kind::Route => delete::<Route>(&ctx, &name, no_wait).await?,
                Kind::Task => delete::<Task>(&ctx, &name, no_wait).await?,
            }
            if no_wait {
                next.push(format!("Use 'kfxctl wait {} {} --deleted' to wait for the deletion to finish", kind.cli_name(), name));
            }
            Ok(())
        }
        Commands::TerminateTask { name } => {
            let tasks: TasksClient = ctx.kind::<Task>();
            let cancel = cancel_after(wait_timeout());
            tasks.terminate(&ctx.namespace, &name, &cancel).await.with_context(|| format!("failed to terminate Task {:?}", name))?;
            println!("Terminating Task {:?} in namespace {:?}", name, ctx.namespace);
            next.push(format!("Use 'kfxctl wait task {} --condition Succeeded' to wait for the Task to stop", name));
            Ok(())
        }
        Commands::Demux { .. } | Commands::Prefix => Ok(()),
    }
}

async fn deploy_logs(ctx: &Ctx, name: &str, next: &mut NextActions) -> Result<()> {
    let app = ctx.apps().get(&ctx.namespace, name).await.with_context(|| format!("couldn't get App {:?}", name))?;
    let mut target = DeployTarget::for_app(&app);
    target.namespace = ctx.namespace.clone();
    // watch from "now": the current state is replayed as the first event
    target.resource_version.clear();
    info!(app = %name, ns = %ctx.namespace, no_start = target.no_start, "following deployment");

    let logs = Arc::new(KubeBuildLogs::new(ctx.client.clone()));
    let mut pipeline = DeployPipeline::new(KubeStore::<App>::new(ctx.client.clone()), logs, target);
    let report = match pipeline.run(SharedSink::stdout(), &cancel_after(deploy_timeout())).await {
        Err(DeployError::Cancelled) => bail!("timed out waiting for App {:?} to deploy", name),
        other => other?,
    };

    if ctx.output == Output::Json {
        let v = serde_json::json!({
            "app": name,
            "buildSeconds": report.build.map(|d| d.as_secs_f64()),
            "deploySeconds": report.deploy.map(|d| d.as_secs_f64()),
            "totalSeconds": report.total.as_secs_f64(),
        });
        println!("{}", serde_json::to_string_pretty(&v)?);
    }
    if report.deploy.is_none() {
        next.push(format!("App {:?} is stopped; start it to create instances", name));
    }
    Ok(())
}

async fn map_route(ctx: &Ctx, app: &str, fields: &RouteSpecFields, no_wait: bool, next: &mut NextActions) -> Result<()> {
    let cancel = cancel_after(wait_timeout());
    let apps = ctx.apps();
    let binder = RouteBinder::new(ctx.kind::<Route>());

    binder.bind(&ctx.namespace, fields, app, &cancel).await?;
    apps.transform(
        &ctx.namespace,
        app,
        |a| {
            if !a.spec.routes.contains(fields) {
                a.spec.routes.push(fields.clone());
            }
            Ok(())
        },
        &cancel,
    )
    .await?;
    println!("Mapped Route {} to App {:?}", fields, app);

    if no_wait {
        next.push(format!("Use 'kfxctl wait app {} --condition RoutesReady' to wait for the Route to become ready", app));
        return Ok(());
    }
    println!("Waiting for App {:?} routes to become ready...", app);
    apps.wait_for_condition_routes_ready_true(&ctx.namespace, app, poll_interval(), &cancel).await?;
    println!("Route {} is ready", fields);
    Ok(())
}

async fn unmap_route(ctx: &Ctx, app: &str, fields: &RouteSpecFields, next: &mut NextActions) -> Result<()> {
    let cancel = cancel_after(wait_timeout());
    let binder = RouteBinder::new(ctx.kind::<Route>());
    binder.unbind(&ctx.namespace, &fields.object_name(), app, &cancel).await?;
    ctx.apps()
        .transform(
            &ctx.namespace,
            app,
            |a| {
                a.spec.routes.retain(|r| r != fields);
                Ok(())
            },
            &cancel,
        )
        .await?;
    println!("Unmapped Route {} from App {:?}", fields, app);
    next.push(format!("Use 'kfxctl delete route {}' to remove the Route once no Apps use it", fields.object_name()));
    Ok(())
}

async fn wait<K>(ctx: &Ctx, name: &str, condition: Option<&str>, deleted: bool) -> Result<()>
where
    K: KfObject + Resource<Scope = NamespaceResourceScope>,
{
    let client = ctx.kind::<K>();
    let cancel = cancel_after(wait_timeout());
    if deleted {
        println!("Waiting for {} {:?} to be deleted...", K::FRIENDLY_NAME, name);
        client.wait_for_deletion(&ctx.namespace, name, poll_interval(), &cancel).await?;
        println!("{} {:?} is gone", K::FRIENDLY_NAME, name);
        return Ok(());
    }
    let cond = match condition {
        Some(c) => <K::Condition as ConditionType>::parse(c).ok_or_else(|| anyhow!("unknown {} condition {:?}", K::FRIENDLY_NAME, c))?,
        None => <K::Condition as ConditionType>::READY,
    };
    println!("Waiting for {} {:?} to be {}...", K::FRIENDLY_NAME, name, cond);
    client.wait_for_condition_true(&ctx.namespace, name, poll_interval(), cond, &cancel).await?;
    println!("{} {:?} is {}", K::FRIENDLY_NAME, name, cond);
    Ok(())
}

async fn delete<K>(ctx: &Ctx, name: &str, no_wait: bool) -> Result<()>
where
    K: KfObject + Resource<Scope = NamespaceResourceScope>,
{
    let client = ctx.kind::<K>();
    client.delete(&ctx.namespace, name).await?;
    println!("Deleting {} {:?} in namespace {:?}", K::FRIENDLY_NAME, name, ctx.namespace);
    if !no_wait {
        let cancel = cancel_after(wait_timeout());
        client.wait_for_deletion(&ctx.namespace, name, poll_interval(), &cancel).await?;
        println!("{} {:?} deleted", K::FRIENDLY_NAME, name);
    }
    Ok(())
}

async fn demux(routes: Vec<(String, PathBuf)>) -> Result<()> {
    let mut demux = LineDemux::new(std::io::stdout());
    for (prefix, path) in routes {
        let file = std::fs::File::create(&path).with_context(|| format!("couldn't create {}", path.display()))?;
        demux = demux.route(prefix, file);
    }
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping demux");
            on_signal.cancel();
        }
    });
    let stdin = tokio_util::io::ReaderStream::new(tokio::io::stdin());
    let n = demux_stream(stdin, &mut demux, &cancel).await?;
    info!(bytes = n, "demux finished");
    Ok(())
}
