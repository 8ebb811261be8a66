//! snapsched Kubernetes Operator
//!
//! Takes scheduled VolumeSnapshots of PersistentVolumeClaims and prunes them
//! according to each SnapshotSchedule's retention policy.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use snapsched::config::{parse_duration, ReconcilerConfig};
use snapsched::crd::SnapshotSchedule;

mod controller;
mod error;
mod metrics;

use controller::Controller;

#[derive(Parser, Debug)]
#[command(name = "snapsched-operator")]
#[command(about = "Kubernetes Operator for scheduled volume snapshots")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, env = "SNAPSCHED_NAMESPACE", default_value = "")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "8080")]
    metrics_port: u16,

    /// Health check port
    #[arg(short = 'H', long, default_value = "8081")]
    health_port: u16,

    /// Log level or filter directive
    #[arg(short, long, env = "SNAPSCHED_LOG", default_value = "info")]
    log_level: String,

    /// Reconciler configuration file (JSON)
    #[arg(short, long, env = "SNAPSCHED_CONFIG")]
    config: Option<PathBuf>,

    /// Upper bound on a single reconcile, e.g. "60s"
    #[arg(long, value_parser = parse_cli_duration)]
    reconcile_timeout: Option<Duration>,

    /// Maximum concurrent snapshot creations per schedule
    #[arg(long)]
    max_concurrent_operations: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SnapshotSchedule CRD as YAML
    Crd,
}

fn parse_cli_duration(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|e| e.to_string())
}

impl Args {
    fn reconciler_config(&self) -> anyhow::Result<ReconcilerConfig> {
        let mut config = match &self.config {
            Some(path) => ReconcilerConfig::from_file(path)?,
            None => ReconcilerConfig::default(),
        };
        if let Some(timeout) = self.reconcile_timeout {
            config.reconcile_timeout = timeout;
        }
        if let Some(max) = self.max_concurrent_operations {
            config.max_concurrent_operations = max;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(Command::Crd) = args.command {
        print!("{}", serde_yaml::to_string(&SnapshotSchedule::crd())?);
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.reconciler_config()?;

    info!("Starting snapsched Kubernetes Operator");
    info!(namespace = %args.namespace, "Watching namespace");

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port));

    // Start health server
    let health_handle = tokio::spawn(run_health_server(args.health_port));

    let controller = Controller::new(args.namespace.clone(), config).await?;
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Schedule controller error");
        }
    });

    info!("Controller started");

    // Wait for any task to complete (usually due to shutdown signal)
    tokio::select! {
        _ = controller_handle => info!("Schedule controller stopped"),
        result = metrics_handle => log_server_exit("Metrics", result),
        result = health_handle => log_server_exit("Health", result),
    }

    Ok(())
}

fn log_server_exit(server: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(server, "Server stopped"),
        Ok(Err(e)) => error!(server, error = %e, "Server failed"),
        Err(e) => error!(server, error = %e, "Server task panicked"),
    }
}

async fn run_health_server(port: u16) -> std::io::Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Health server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}
