//! Prometheus metrics for the snapsched operator

use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

use snapsched::reconciler::CycleReport;

lazy_static::lazy_static! {
    /// Total reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "snapsched_reconciliations_total",
        "Total number of reconciliations",
        &["namespace", "result"]
    ).expect("reconciliations metric registers once");

    /// Reconciliation duration
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "snapsched_reconciliation_duration_seconds",
        "Duration of reconciliations",
        &["namespace"]
    ).expect("duration metric registers once");

    /// Snapshots created
    pub static ref SNAPSHOTS_CREATED: CounterVec = register_counter_vec!(
        "snapsched_snapshots_created_total",
        "Total number of snapshots created",
        &["namespace"]
    ).expect("created metric registers once");

    /// Snapshots deleted by retention
    pub static ref SNAPSHOTS_DELETED: CounterVec = register_counter_vec!(
        "snapsched_snapshots_deleted_total",
        "Total number of snapshots deleted by retention",
        &["namespace"]
    ).expect("deleted metric registers once");

    /// Per-item failures
    pub static ref FAILURES: CounterVec = register_counter_vec!(
        "snapsched_failures_total",
        "Total number of per-item failures",
        &["reason"]
    ).expect("failures metric registers once");
}

/// Run the metrics server
pub async fn run_metrics_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Metrics server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                // Encode metrics
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let metrics = encoder.encode_to_string(&metric_families).unwrap_or_default();

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics.len(),
                    metrics
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}

/// Record a finished reconciliation and what it did
pub fn record_reconciliation(namespace: &str, success: bool, duration_secs: f64, report: &CycleReport) {
    let result = if success { "success" } else { "failure" };
    RECONCILIATIONS.with_label_values(&[namespace, result]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[namespace])
        .observe(duration_secs);

    SNAPSHOTS_CREATED
        .with_label_values(&[namespace])
        .inc_by(report.created.len() as f64);
    SNAPSHOTS_DELETED
        .with_label_values(&[namespace])
        .inc_by(report.deleted.len() as f64);
    for failure in &report.failures {
        FAILURES.with_label_values(&[failure.kind.reason()]).inc();
    }
}
