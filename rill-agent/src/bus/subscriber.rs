use super::{codec, socket_addr, Message};
use crate::retry::sleep_or_cancel;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connecting endpoint. Reconnects in the background until dropped or cancelled, so a
/// subscriber may be created before its publisher is listening.
pub struct Subscriber {
    rx: mpsc::Receiver<Message>,
    cancel_token: CancellationToken,
}

impl Subscriber {
    pub fn connect(
        addr: &str,
        filters: Vec<String>,
        capacity: usize,
        cancel_token: &CancellationToken,
    ) -> Result<Self> {
        let socket = socket_addr(addr)?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel_token = cancel_token.child_token();
        tokio::spawn(run(socket, filters, tx, cancel_token.clone()));
        Ok(Self { rx, cancel_token })
    }

    /// `None` once the subscriber has been cancelled.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run(
    addr: String,
    filters: Vec<String>,
    tx: mpsc::Sender<Message>,
    cancel_token: CancellationToken,
) {
    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            connected = TcpStream::connect(&addr) => connected,
        };
        match connected {
            Ok(stream) => {
                delay = INITIAL_RECONNECT_DELAY;
                debug!(addr = %addr, "subscribed");
                if let Err(err) = pump(stream, &filters, &tx, &cancel_token).await {
                    debug!(addr = %addr, error = %err, "subscription dropped");
                }
                if tx.is_closed() || cancel_token.is_cancelled() {
                    return;
                }
            }
            Err(err) => debug!(addr = %addr, error = %err, "publisher not reachable yet"),
        }

        if !sleep_or_cancel(delay, &cancel_token).await {
            return;
        }
        delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY);
    }
}

async fn pump(
    stream: TcpStream,
    filters: &[String],
    tx: &mpsc::Sender<Message>,
    cancel_token: &CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, codec());
    let subscription = serde_json::to_vec(filters).context("failed to encode subscription")?;
    framed.send(Bytes::from(subscription)).await?;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Ok(()),
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };
        match Message::decode(&frame?) {
            Ok(message) if message.matches(filters) => {
                if tx.send(message).await.is_err() {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "skipping undecodable bus frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSettings, Publisher};

    #[tokio::test]
    async fn subscriber_reconnects_when_publisher_starts_late() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();

        // Reserve a port, release it, and start the publisher there afterwards.
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
        let addr = reserved.local_addr().expect("addr").to_string();
        drop(reserved);

        let mut subscriber = Subscriber::connect(&addr, Vec::new(), 4, &cancel).expect("connect");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let settings = BusSettings {
            high_water_mark: 8,
            spill_dir: dir.path().to_path_buf(),
            max_spill_bytes: 1 << 20,
        };
        let publisher = Publisher::bind(&addr, settings, &cancel).await.expect("bind");
        publisher
            .publish(&Message::single("hello"))
            .await
            .expect("publish");

        let message = tokio::time::timeout(Duration::from_secs(10), subscriber.recv())
            .await
            .expect("message in time")
            .expect("message");
        assert_eq!(message.payload(), "hello");
        cancel.cancel();
    }

    #[test]
    fn invalid_addresses_are_rejected_up_front() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let _guard = runtime.enter();
        let cancel = CancellationToken::new();
        assert!(Subscriber::connect("tcp://nowhere", Vec::new(), 1, &cancel).is_err());
    }
}
