//! Delivery helper: envelopes in, batched idempotent inserts out.

use super::open_delivery;
use crate::bus::Subscriber;
use crate::config::Config;
use crate::delivery::Delivery;
use anyhow::Result;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) const INPUT_CHANNEL_CAPACITY: usize = 4_096;
const PRUNE_BLOCK_SIZE: usize = 150;

pub async fn run(config: &Config, input: Option<&str>, cancel_token: CancellationToken) -> Result<()> {
    let delivery = open_delivery(config, cancel_token.clone()).await?;
    let input = input.unwrap_or(&config.bus.parser_addr);
    let subscriber = Subscriber::connect(input, Vec::new(), INPUT_CHANNEL_CAPACITY, &cancel_token)?;
    info!(collection = %delivery.collection(), input, "delivery started");

    pump(delivery, subscriber, config.poll_interval(), cancel_token).await;
    Ok(())
}

/// Feed envelopes from `subscriber` into `delivery` and flush due batches until
/// cancelled or the feed closes. Whatever is still queued is then abandoned.
pub async fn pump(
    mut delivery: Delivery,
    mut subscriber: Subscriber,
    poll_interval: Duration,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!(collection = %delivery.collection(), "delivery shutting down");
                break;
            }
            _ = delivery.flush_due(Instant::now()) => {}
        }
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            message = subscriber.recv() => match message {
                Some(message) => {
                    delivery.ingest_payload(message.payload(), Instant::now());
                }
                None => break,
            },
            _ = sleep(poll_interval) => {}
        }
    }

    delivery.abandon();
}

/// Remove stored documents that fell out of the acceptance window.
pub async fn prune(config: &Config, cancel_token: CancellationToken) -> Result<usize> {
    let delivery = open_delivery(config, cancel_token).await?;
    let removed = delivery.prune(PRUNE_BLOCK_SIZE).await?;
    info!(collection = %delivery.collection(), removed, "pruned documents outside the acceptance window");
    Ok(removed)
}
