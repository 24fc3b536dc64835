//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(2048);

    write_metric(
        &mut output,
        "crowdgate_frames_total",
        "Frame events consumed from the frames channel",
        MetricType::Counter,
        site,
        summary.frames_total,
    );
    let _ = writeln!(output, "# HELP crowdgate_frames_per_sec Frames processed per second");
    let _ = writeln!(output, "# TYPE crowdgate_frames_per_sec gauge");
    let _ =
        writeln!(output, "crowdgate_frames_per_sec{{site=\"{site}\"}} {:.2}", summary.frames_per_sec);

    write_metric(
        &mut output,
        "crowdgate_detect_failures_total",
        "Detector invocations that failed (frame skipped)",
        MetricType::Counter,
        site,
        summary.detect_failures,
    );
    write_metric(
        &mut output,
        "crowdgate_live_published_total",
        "Live density samples published",
        MetricType::Counter,
        site,
        summary.live_published,
    );
    write_metric(
        &mut output,
        "crowdgate_forecast_published_total",
        "Forecast samples published",
        MetricType::Counter,
        site,
        summary.forecast_published,
    );
    write_metric(
        &mut output,
        "crowdgate_forecast_discarded_total",
        "Live samples discarded by the latest-wins window",
        MetricType::Counter,
        site,
        summary.forecast_discarded,
    );
    write_metric(
        &mut output,
        "crowdgate_forecast_failures_total",
        "Forecaster invocations that failed (sample skipped)",
        MetricType::Counter,
        site,
        summary.forecast_failures,
    );
    write_metric(
        &mut output,
        "crowdgate_forecast_filtered_total",
        "Non-live payloads filtered by the forecast stage",
        MetricType::Counter,
        site,
        summary.forecast_filtered,
    );
    write_metric(
        &mut output,
        "crowdgate_sessions_opened_total",
        "Client sessions accepted",
        MetricType::Counter,
        site,
        summary.sessions_opened,
    );
    write_metric(
        &mut output,
        "crowdgate_sessions_closed_total",
        "Client sessions torn down",
        MetricType::Counter,
        site,
        summary.sessions_closed,
    );
    write_metric(
        &mut output,
        "crowdgate_active_sessions",
        "Currently connected client sessions",
        MetricType::Gauge,
        site,
        summary.active_sessions,
    );
    write_metric(
        &mut output,
        "crowdgate_relayed_live_total",
        "Live-channel messages relayed to clients",
        MetricType::Counter,
        site,
        summary.relayed_live,
    );
    write_metric(
        &mut output,
        "crowdgate_relayed_forecast_total",
        "Predicted-channel messages relayed to clients",
        MetricType::Counter,
        site,
        summary.relayed_forecast,
    );

    output
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let summary = metrics.report();
            let body = format_prometheus_metrics(&summary, &site_id);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail"))
        }
        (&Method::GET, "/health") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail")),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
