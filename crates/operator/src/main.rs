use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use appstore_charts::{ChartCatalog, ChartMirror};
use appstore_core::AppDeployment;
use appstore_engine::Reconciler;
use appstore_ingest::{Consumer, DeploymentHandler, Publisher, StatusPublisher};
use appstore_kubehub::{get_kube_client, KubeRecords, KubeValues};
use appstore_release::{HelmCli, ReleaseManager};
use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod controller;

use config::{MirrorArgs, RunArgs};

/// Pending status updates before new ones are dropped.
const STATUS_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "appstore-operator", version, about = "Reconciles AppDeployment resources into Helm releases")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller, chart mirror and message consumer
    Run(Box<RunArgs>),
    /// Print the AppDeployment CustomResourceDefinition
    Crd,
    /// Sync the chart mirror once and list the charts it holds
    Charts(MirrorArgs),
}

fn init_tracing() {
    let env = std::env::var("APPSTORE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPSTORE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "APPSTORE_METRICS_ADDR is not a socket address");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run(*args).await
        }
        Commands::Crd => {
            let crd = AppDeployment::crd();
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&crd)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&crd)?),
            }
            Ok(())
        }
        Commands::Charts(args) => list_charts(&args, cli.output).await,
    }
}

async fn list_charts(args: &MirrorArgs, output: Output) -> Result<()> {
    let mirror = ChartMirror::new(args.mirror_config());
    let token = CancellationToken::new();
    let sync = mirror.start(token.clone()).await.context("syncing chart mirror")?;
    token.cancel();
    let _ = sync.await;

    let state = mirror.state().await;
    let mut rows = Vec::new();
    for name in mirror.list().await? {
        let version = match mirror.descriptor(&name).await {
            Ok(d) => Some(d.version),
            Err(e) => {
                warn!(chart = %name, error = %format!("{:#}", e), "unreadable chart descriptor");
                None
            }
        };
        rows.push((name, version));
    }

    match output {
        Output::Human => {
            println!("HEAD {}", state.head.as_deref().unwrap_or("-"));
            println!("{:<32} VERSION", "CHART");
            for (name, version) in &rows {
                println!("{:<32} {}", name, version.as_deref().unwrap_or("?"));
            }
        }
        Output::Json => {
            let charts: Vec<_> =
                rows.iter().map(|(name, version)| serde_json::json!({"name": name, "version": version})).collect();
            let doc = serde_json::json!({"head": state.head, "charts": charts});
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let token = CancellationToken::new();
    let client = get_kube_client().await?;

    let mirror = ChartMirror::new(args.mirror.mirror_config());
    let mirror_task = mirror.start(token.clone()).await.context("starting chart mirror")?;
    info!(repo = %args.mirror.charts_repo_url, path = %args.mirror.charts_path.display(), "chart mirror ready");

    let catalog: Arc<dyn ChartCatalog> = mirror.clone();
    let helm = Arc::new(HelmCli::new(&args.helm_bin));
    let releases = Arc::new(ReleaseManager::new(helm, catalog.clone(), args.manager_config()));
    let records = Arc::new(KubeRecords::new(client.clone()));
    let values = Arc::new(KubeValues::new(client.clone()));

    let mut engine = Reconciler::new(releases, records.clone(), values, catalog, args.engine_config());

    let mut consumer_task = None;
    let mut publisher_task = None;
    match args.consumer_config() {
        Some(cfg) => {
            if args.publish_status {
                let publisher = Arc::new(Publisher::new(&cfg.url, &cfg.exchange, "appstore-operator"));
                let (notifier, task) = StatusPublisher::spawn(publisher, STATUS_QUEUE_CAPACITY, token.clone());
                engine = engine.with_notifier(Arc::new(notifier));
                publisher_task = Some(task);
            }
            info!(exchange = %cfg.exchange, queue = %cfg.queue, "message consumer enabled");
            let consumer = Consumer::new(cfg, Arc::new(DeploymentHandler::new(records)));
            let token = token.clone();
            consumer_task = Some(tokio::spawn(async move { consumer.run(token).await }));
        }
        None => info!("APPSTORE_AMQP_URL not set; message consumer disabled"),
    }

    let signals = tokio::spawn(watch_signals(token.clone(), mirror.clone()));

    info!(lock = ?args.release_lock, timeout_secs = args.helm_timeout_secs, "controller starting");
    controller::run(client, engine, token.clone()).await;
    info!("controller stopped");

    token.cancel();
    if let Some(task) = consumer_task {
        if let Err(e) = task.await {
            error!(error = %e, "message consumer task failed");
        }
    }
    if let Some(task) = publisher_task {
        if let Err(e) = task.await {
            error!(error = %e, "status publisher task failed");
        }
    }
    if let Err(e) = mirror_task.await {
        error!(error = %e, "chart mirror task failed");
    }
    signals.abort();
    Ok(())
}

/// Ctrl-C and SIGTERM stop the process; SIGHUP forces a chart sync.
#[cfg(unix)]
async fn watch_signals(token: CancellationToken, mirror: Arc<ChartMirror>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut hup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(t), Ok(h)) => (t, h),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "signal handlers unavailable; waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            token.cancel();
            return;
        }
    };
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
            _ = hup.recv() => {
                info!("SIGHUP: syncing chart mirror");
                if let Err(e) = mirror.force_sync().await {
                    warn!(error = %format!("{:#}", e), "forced chart sync failed");
                }
            }
        }
    }
    info!("shutdown requested");
    token.cancel();
}

#[cfg(not(unix))]
async fn watch_signals(token: CancellationToken, _mirror: Arc<ChartMirror>) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            token.cancel();
        }
    }
}
