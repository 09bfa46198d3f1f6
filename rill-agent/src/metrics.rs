//! Prometheus metrics for the supervisor, the parser and the delivery path.
//!
//! All metrics use the default Prometheus registry and follow naming conventions:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ==================== PARSING ====================
    pub static ref RECORDS_PARSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_records_parsed_total",
        "Records produced by the format parser",
        &["format"]
    )
    .unwrap();
    pub static ref LINES_INVALID_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_lines_invalid_total",
        "Lines or blocks discarded by the format parser",
        &["format"]
    )
    .unwrap();

    // ==================== DELIVERY ====================
    pub static ref ENVELOPES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_envelopes_dropped_total",
        "Envelopes dropped before reaching the accumulator",
        &["reason"]
    )
    .unwrap();
    pub static ref FLUSHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_flushes_total",
        "Accumulator flushes by trigger and outcome",
        &["trigger", "status"]
    )
    .unwrap();
    pub static ref FLUSH_DURATION: Histogram = register_histogram!(
        "rill_agent_flush_duration_seconds",
        "Time spent inserting one batch including retries",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    )
    .unwrap();
    pub static ref RECORDS_STORED_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_records_stored_total",
        "Documents newly written to the store"
    )
    .unwrap();
    pub static ref DUPLICATES_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_duplicates_total",
        "Documents skipped because their fingerprint was already stored"
    )
    .unwrap();
    pub static ref STORE_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_store_retries_total",
        "Store calls retried after a transient failure"
    )
    .unwrap();
    pub static ref ACCUMULATOR_DEPTH: IntGauge = register_int_gauge!(
        "rill_agent_accumulator_depth",
        "Records waiting in the accumulator"
    )
    .unwrap();

    // ==================== SUPERVISION ====================
    pub static ref CHILD_STARTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_child_starts_total",
        "Child processes started by role",
        &["role"]
    )
    .unwrap();
    pub static ref CHILD_EXITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_child_exits_total",
        "Child processes reaped by role",
        &["role"]
    )
    .unwrap();
    pub static ref CHILD_KILLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rill_agent_child_kills_total",
        "Children force-killed after ignoring the graceful signal",
        &["role"]
    )
    .unwrap();
    pub static ref ROTATIONS_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_rotations_total",
        "Log rotations detected by the inode watchdog"
    )
    .unwrap();
    pub static ref HOST_ALIVE: IntGauge = register_int_gauge!(
        "rill_agent_host_alive",
        "1 when the supervised host is considered reachable"
    )
    .unwrap();

    // ==================== BUS ====================
    pub static ref BUS_SPILLED_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_bus_spilled_total",
        "Messages written to the on-disk overflow queue"
    )
    .unwrap();
    pub static ref BUS_DROPPED_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_bus_dropped_total",
        "Messages lost because their subscriber connection ended before delivery"
    )
    .unwrap();
    pub static ref BUS_BACKPRESSURE_TOTAL: IntCounter = register_int_counter!(
        "rill_agent_bus_backpressure_total",
        "Publishes that waited because memory and disk queues were full"
    )
    .unwrap();
}

/// Serves the default registry at `GET /metrics` until `cancel_token` fires.
pub async fn serve(addr: SocketAddr, cancel_token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;

    info!(addr = %addr, "prometheus metrics server listening on /metrics");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, hyper::Error>(render(req.uri().path()))
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }

    Ok(())
}

fn render(path: &str) -> Response<Full<Bytes>> {
    if path != "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from("Not Found")));
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        let mut response = Response::new(Full::new(Bytes::from(err.to_string())));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        return response;
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}
