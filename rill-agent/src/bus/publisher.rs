use super::{codec, socket_addr, BusSettings, Message, Push, SpillQueue};
use crate::metrics::{BUS_BACKPRESSURE_TOTAL, BUS_DROPPED_TOTAL, BUS_SPILLED_TOTAL};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Bound endpoint that fans messages out to every connected subscriber.
pub struct Publisher {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    cancel_token: CancellationToken,
}

struct Shared {
    settings: BusSettings,
    state: Mutex<PublisherState>,
    /// Signalled whenever a queue shrinks or a subscriber arrives.
    space: Notify,
    next_peer_id: AtomicU64,
}

struct PublisherState {
    peers: Vec<Arc<Peer>>,
    /// Messages published before anyone subscribed; handed to the first subscriber.
    backlog: SpillQueue,
}

struct Peer {
    id: u64,
    addr: SocketAddr,
    filters: Vec<String>,
    queue: Mutex<SpillQueue>,
    ready: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn state(&self) -> Result<MutexGuard<'_, PublisherState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("bus publisher state poisoned"))
    }

    fn new_queue(&self) -> SpillQueue {
        SpillQueue::new(
            self.settings.high_water_mark,
            self.settings.spill_dir.clone(),
            self.settings.max_spill_bytes,
        )
    }
}

impl Peer {
    fn offer(&self, frame: Bytes) -> Result<Push> {
        let push = {
            let mut queue = self
                .queue
                .lock()
                .map_err(|_| anyhow!("bus peer queue poisoned"))?;
            queue.push(frame)?
        };
        match push {
            Push::Memory => self.ready.notify_one(),
            Push::Spilled => {
                BUS_SPILLED_TOTAL.inc();
                self.ready.notify_one();
            }
            Push::Full(_) => {}
        }
        Ok(push)
    }

    fn pop(&self) -> Result<Option<Bytes>> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| anyhow!("bus peer queue poisoned"))?;
        Ok(queue.pop()?)
    }

    fn queued(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Publisher {
    pub async fn bind(
        addr: &str,
        settings: BusSettings,
        cancel_token: &CancellationToken,
    ) -> Result<Self> {
        let socket = socket_addr(addr)?;
        let listener = TcpListener::bind(&socket)
            .await
            .with_context(|| format!("failed to bind bus publisher on {addr}"))?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(PublisherState {
                peers: Vec::new(),
                backlog: SpillQueue::new(
                    settings.high_water_mark,
                    settings.spill_dir.clone(),
                    settings.max_spill_bytes,
                ),
            }),
            settings,
            space: Notify::new(),
            next_peer_id: AtomicU64::new(0),
        });

        let cancel_token = cancel_token.child_token();
        tokio::spawn(accept_loop(listener, shared.clone(), cancel_token.clone()));
        info!(addr = %local_addr, "bus publisher listening");

        Ok(Self {
            shared,
            local_addr,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .state()
            .map(|state| state.peers.iter().filter(|peer| !peer.is_closed()).count())
            .unwrap_or(0)
    }

    /// Queue `message` for every matching subscriber, waiting while any of their
    /// queues is completely full.
    pub async fn publish(&self, message: &Message) -> Result<()> {
        let frame = message.encode()?;
        let mut targets: Option<Vec<Arc<Peer>>> = None;
        let mut blocked = false;

        loop {
            let space = self.shared.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            if targets.is_none() {
                let mut state = self.shared.state()?;
                state.peers.retain(|peer| !peer.is_closed());
                if state.peers.is_empty() {
                    match state.backlog.push(frame.clone())? {
                        Push::Full(_) => {}
                        Push::Spilled => {
                            BUS_SPILLED_TOTAL.inc();
                            return Ok(());
                        }
                        Push::Memory => return Ok(()),
                    }
                } else {
                    targets = Some(
                        state
                            .peers
                            .iter()
                            .filter(|peer| message.matches(&peer.filters))
                            .cloned()
                            .collect(),
                    );
                }
            }

            if let Some(pending) = targets.as_mut() {
                let mut still_full = Vec::new();
                for peer in pending.drain(..) {
                    if peer.is_closed() {
                        continue;
                    }
                    match peer.offer(frame.clone()) {
                        Ok(Push::Full(_)) => still_full.push(peer),
                        Ok(_) => {}
                        Err(err) => {
                            warn!(peer = %peer.addr, error = %err, "dropping subscriber with broken queue");
                            peer.close();
                        }
                    }
                }
                if still_full.is_empty() {
                    return Ok(());
                }
                *pending = still_full;
            }

            if !blocked {
                blocked = true;
                BUS_BACKPRESSURE_TOTAL.inc();
                debug!(addr = %self.local_addr, "subscriber queues full; waiting for space");
            }
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    return Err(anyhow!("bus publisher shut down while waiting for space"));
                }
                _ = &mut space => {}
            }
        }
    }

    /// Wait until every queued message has been written out, or `limit` elapses.
    /// Returns `true` when nothing is left.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let queued = self
                .shared
                .state()
                .map(|state| {
                    state.backlog.len()
                        + state
                            .peers
                            .iter()
                            .filter(|peer| !peer.is_closed())
                            .map(|peer| peer.queued())
                            .sum::<usize>()
                })
                .unwrap_or(0);
            if queued == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(addr = %self.local_addr, queued, "bus drain timed out");
                return false;
            }
            sleep(DRAIN_POLL).await;
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel_token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                tokio::spawn(serve_peer(stream, addr, shared.clone(), cancel_token.clone()));
            }
            Err(err) => {
                warn!(error = %err, "bus accept failed");
                sleep(DRAIN_POLL).await;
            }
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec());

    let filters = match timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Ok(Some(Ok(frame))) => match serde_json::from_slice::<Vec<String>>(&frame) {
            Ok(filters) => filters,
            Err(err) => {
                warn!(peer = %addr, error = %err, "invalid subscription frame");
                return;
            }
        },
        _ => {
            debug!(peer = %addr, "subscriber went away before subscribing");
            return;
        }
    };

    let peer = match register(&shared, addr, filters) {
        Ok(peer) => peer,
        Err(err) => {
            warn!(peer = %addr, error = %err, "failed to register subscriber");
            return;
        }
    };
    debug!(peer = %addr, id = peer.id, filters = ?peer.filters, "subscriber connected");

    let mut writer = FramedWrite::new(write_half, codec());
    let result = write_loop(&peer, &mut writer, &mut reader, &shared, &cancel_token).await;
    peer.close();
    discard_queue(&peer, 0);
    shared.space.notify_waiters();
    match result {
        Ok(()) => debug!(peer = %addr, "subscriber disconnected"),
        Err(err) => debug!(peer = %addr, error = %err, "subscriber connection failed"),
    }
}

fn register(shared: &Shared, addr: SocketAddr, filters: Vec<String>) -> Result<Arc<Peer>> {
    let mut state = shared.state()?;
    state.peers.retain(|peer| !peer.is_closed());
    let queue = if state.peers.is_empty() {
        std::mem::replace(&mut state.backlog, shared.new_queue())
    } else {
        shared.new_queue()
    };
    let peer = Arc::new(Peer {
        id: shared.next_peer_id.fetch_add(1, Ordering::Relaxed),
        addr,
        filters,
        queue: Mutex::new(queue),
        ready: Notify::new(),
        closed: AtomicBool::new(false),
    });
    state.peers.push(peer.clone());
    drop(state);
    shared.space.notify_waiters();
    Ok(peer)
}

/// Empty the queue of a subscriber that went away, counting what it never received
/// plus `in_flight` frames whose write failed.
fn discard_queue(peer: &Peer, in_flight: usize) -> usize {
    let mut lost = in_flight;
    loop {
        match peer.pop() {
            Ok(Some(_)) => lost += 1,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer.addr, error = %err, "failed to read back queued frames");
                lost += peer.queued();
                break;
            }
        }
    }
    if lost > 0 {
        BUS_DROPPED_TOTAL.inc_by(lost as u64);
        warn!(peer = %peer.addr, lost, "subscriber disconnected with undelivered messages");
    }
    lost
}

async fn write_loop(
    peer: &Peer,
    writer: &mut FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    reader: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    shared: &Shared,
    cancel_token: &CancellationToken,
) -> Result<()> {
    loop {
        if let Some(frame) = peer.pop()? {
            if let Err(err) = writer.send(frame).await {
                peer.close();
                discard_queue(peer, 1);
                return Err(err.into());
            }
            shared.space.notify_waiters();
            continue;
        }
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Ok(()),
            _ = peer.ready.notified() => {}
            // Subscribers never send after the handshake; a read result means the
            // connection is gone.
            _ = reader.next() => return Ok(()),
        }
    }
}
