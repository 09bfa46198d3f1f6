//! Entry points for the `rill-agent` subcommands.
//!
//! `supervise` and `reconcile` drive child processes through the same loop in
//! [`supervise`]; `tap`, `parse` and `deliver` are the children themselves.

pub mod deliver;
pub mod parse;
pub mod supervise;
pub mod tap;

use crate::accumulator::Accumulator;
use crate::bus::BusSettings;
use crate::config::Config;
use crate::delivery::Delivery;
use crate::envelope::StreamChunk;
use crate::parsers::{indexed_fields_for, line_preview, LINE_PREVIEW_LIMIT};
use crate::reassembler::Reassembler;
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, SqliteStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable to force immediate flushing (testing mode).
pub const FORCE_FLUSH_ENV: &str = "RILL_AGENT_FORCE_FLUSH";

/// Exit code of a hard stop.
pub const HARD_STOP_EXIT_CODE: i32 = 2;

fn force_flush() -> bool {
    match std::env::var(FORCE_FLUSH_ENV) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.eq_ignore_ascii_case("true") || trimmed == "1" {
                true
            } else if trimmed.eq_ignore_ascii_case("false") || trimmed == "0" {
                false
            } else {
                warn!(
                    env = FORCE_FLUSH_ENV,
                    value = trimmed,
                    "unrecognized value for {}; using configured batching",
                    FORCE_FLUSH_ENV
                );
                false
            }
        }
        Err(_) => false,
    }
}

/// Resolve the effective chunk size based on config and environment overrides.
pub fn resolve_chunk_size(configured: usize) -> usize {
    if force_flush() {
        warn!(
            env = FORCE_FLUSH_ENV,
            configured, "forcing chunk size to 1 for immediate flush (testing mode)"
        );
        1
    } else {
        configured.max(1)
    }
}

pub fn resolve_insert_interval(configured: Duration) -> Duration {
    if force_flush() {
        Duration::ZERO
    } else {
        configured
    }
}

pub fn bus_settings(config: &Config) -> BusSettings {
    BusSettings {
        high_water_mark: config.bus.high_water_mark,
        spill_dir: config.spill_dir(),
        max_spill_bytes: config.bus.max_spill_bytes,
    }
}

pub fn build_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    let db_path = config.store_db_path();
    let store = SqliteStore::new(&db_path)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    info!(db_path = %db_path.display(), "configured sqlite document store");
    Ok(Arc::new(store))
}

/// Accumulator plus store for the configured collection.
pub async fn open_delivery(config: &Config, cancel_token: CancellationToken) -> Result<Delivery> {
    let store = build_store(config)?;
    let accumulator = Accumulator::from_config(
        &config.accumulator,
        resolve_chunk_size(config.accumulator.chunk_size),
        resolve_insert_interval(Duration::from_millis(config.accumulator.insert_interval_ms)),
    );
    Delivery::open(
        store,
        config.collection(),
        &indexed_fields_for(config.format()),
        accumulator,
        RetryPolicy::from_config(&config.store),
        cancel_token,
    )
    .await
}

/// Line reassembly of one tap feed across restarts of the tap.
#[derive(Debug, Default)]
pub(crate) struct TapStream {
    reassembler: Reassembler,
    session: Option<String>,
}

impl TapStream {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `true` when `chunk` belongs to a newer tap run than the previous chunk. The
    /// fragment the old run left behind is dropped; it can never be completed.
    pub(crate) fn switch_session(&mut self, chunk: &StreamChunk) -> bool {
        let Some(session) = chunk.session.as_deref() else {
            return false;
        };
        let switched = self
            .session
            .as_deref()
            .map_or(false, |current| current != session);
        if switched {
            if let Some(fragment) = self.reassembler.finish() {
                debug!(
                    fragment = %line_preview(&fragment, LINE_PREVIEW_LIMIT),
                    "discarding partial line of an interrupted tap session"
                );
            }
        }
        self.session = Some(session.to_string());
        switched
    }

    /// Complete lines carried by `chunk`. End of stream also releases the excess.
    pub(crate) fn lines(&mut self, chunk: &StreamChunk) -> Vec<String> {
        let mut lines = self.reassembler.push(chunk.contents());
        if chunk.end_of_stream {
            lines.extend(self.reassembler.finish());
            self.session = None;
        }
        lines
    }
}

/// SIGINT cancels `cancel_token` so the current iteration can finish and shut down
/// in order; SIGTERM exits at once without cleanup.
pub fn install_signal_handlers(cancel_token: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            received = interrupt.recv() => {
                if received.is_none() {
                    error!("SIGINT stream closed");
                }
                info!("soft stop requested");
                cancel_token.cancel();
            }
            _ = terminate.recv() => {
                info!("hard stop requested");
                std::process::exit(HARD_STOP_EXIT_CODE);
            }
        }
        // After a soft stop, a second signal of either kind is a hard stop.
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        std::process::exit(HARD_STOP_EXIT_CODE);
    });
    Ok(())
}
