use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use helm_proto::codec::{CodecConfig, Decoder, encode};
use helm_proto::envelope::Envelope;

pub mod mock;
pub mod pool;
pub mod transport;

pub use pool::{PeerHandle, PeerPool};
pub use transport::{PeerDialer, PeerSocket, WebSocketDialer};

pub type PeerId = String;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_SEND_SETTLE: Duration = Duration::from_millis(500);

const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("failed to connect to peer: {0}")]
    Connect(String),
    #[error("peer channel closed")]
    Closed,
}

/// Lifecycle of one peer channel. `Reconnecting` is entered only after a
/// close the local side did not ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PeerChannelConfig {
    pub reconnect_backoff: Duration,
    pub send_settle: Duration,
    pub codec: CodecConfig,
}

impl Default for PeerChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            send_settle: DEFAULT_SEND_SETTLE,
            codec: CodecConfig::default(),
        }
    }
}

struct Inner {
    normal_close: bool,
    outbound: Option<mpsc::UnboundedSender<String>>,
    run_task: Option<JoinHandle<()>>,
}

/// Point-to-point connection to one robot.
///
/// Owns reconnect-on-drop: an unexpected close schedules a redial after a
/// fixed backoff, forever, until `disconnect()` sets the normal-close
/// flag. Inbound frames pass through the frame codec; continuation acks
/// for fragmented messages are written back without caller involvement.
pub struct PeerChannel {
    peer_id: PeerId,
    dialer: Arc<dyn PeerDialer>,
    config: PeerChannelConfig,
    state_tx: watch::Sender<PeerState>,
    messages_tx: broadcast::Sender<Envelope>,
    next_seq: AtomicU64,
    inner: Mutex<Inner>,
    // handle to self for spawning the owned run loop
    weak_self: Weak<PeerChannel>,
}

impl PeerChannel {
    pub fn new(
        peer_id: impl Into<PeerId>,
        dialer: Arc<dyn PeerDialer>,
        config: PeerChannelConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PeerState::Idle);
        let (messages_tx, _) = broadcast::channel(MESSAGE_BUFFER);
        let peer_id = peer_id.into();
        Arc::new_cyclic(|weak| Self {
            peer_id,
            dialer,
            config,
            state_tx,
            messages_tx,
            next_seq: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                normal_close: false,
                outbound: None,
                run_task: None,
            }),
            weak_self: weak.clone(),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> PeerState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state_tx.subscribe()
    }

    /// Decoded inbound messages, in arrival order.
    pub fn messages(&self) -> broadcast::Receiver<Envelope> {
        self.messages_tx.subscribe()
    }

    /// Next value of the channel's monotonic message counter.
    pub fn next_correlation(&self) -> String {
        self.next_seq.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Start the connection loop (idempotent) and wait for it to open.
    pub async fn connect(&self) -> Result<(), PeerError> {
        self.ensure_running();
        self.wait_open().await
    }

    fn ensure_running(&self) {
        let mut inner = self.inner.lock();
        if inner
            .run_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        let Some(channel) = self.weak_self.upgrade() else {
            return;
        };
        inner.normal_close = false;
        inner.run_task = Some(tokio::spawn(channel.run()));
    }

    async fn run(self: Arc<Self>) {
        loop {
            self.state_tx.send_replace(PeerState::Connecting);
            match self.dialer.dial(&self.peer_id).await {
                Ok(socket) => {
                    {
                        let mut inner = self.inner.lock();
                        if inner.normal_close {
                            self.state_tx.send_replace(PeerState::Closed);
                            return;
                        }
                        inner.outbound = Some(socket.outbound.clone());
                    }
                    self.state_tx.send_replace(PeerState::Open);
                    info!(peer = %self.peer_id, "peer channel open");
                    self.pump(socket).await;
                    self.inner.lock().outbound = None;
                    warn!(peer = %self.peer_id, "peer channel dropped");
                }
                Err(err) => {
                    warn!(peer = %self.peer_id, error = %err, "peer connect failed");
                }
            }
            if self.inner.lock().normal_close {
                self.state_tx.send_replace(PeerState::Closed);
                return;
            }
            self.state_tx.send_replace(PeerState::Reconnecting);
            tokio::time::sleep(self.config.reconnect_backoff).await;
        }
    }

    /// Drain the socket until the remote side goes away.
    async fn pump(&self, mut socket: PeerSocket) {
        let mut decoder = Decoder::new();
        while let Some(frame) = socket.inbound.recv().await {
            match decoder.decode(&frame) {
                Ok(outcome) => {
                    if let Some(ack) = outcome.ack {
                        self.write_frames(&socket.outbound, &ack);
                    }
                    if let Some(message) = outcome.message {
                        debug!(peer = %self.peer_id, command = %message.command, "peer message");
                        let _ = self.messages_tx.send(message);
                    }
                }
                Err(err) => {
                    warn!(peer = %self.peer_id, error = %err, "protocol violation on peer channel");
                }
            }
        }
    }

    fn write_frames(&self, outbound: &mpsc::UnboundedSender<String>, envelope: &Envelope) {
        match encode(envelope, &self.config.codec) {
            Ok(frames) => {
                for frame in frames {
                    if outbound.send(frame).is_err() {
                        warn!(peer = %self.peer_id, "peer socket went away mid-send");
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(peer = %self.peer_id, error = %err, "failed to encode outbound message");
            }
        }
    }

    /// Send a message. A warned no-op unless the channel is `Open`.
    ///
    /// Envelopes without a correlation id are stamped from the channel's
    /// monotonic counter.
    pub fn send(&self, mut envelope: Envelope) {
        if self.state() != PeerState::Open {
            warn!(
                peer = %self.peer_id,
                command = %envelope.command,
                state = ?self.state(),
                "dropping send on non-open peer channel"
            );
            return;
        }
        if envelope.correlation_id.is_none() {
            envelope.correlation_id = Some(self.next_correlation());
        }
        let outbound = self.inner.lock().outbound.clone();
        let Some(outbound) = outbound else {
            warn!(peer = %self.peer_id, "peer channel has no live socket");
            return;
        };
        self.write_frames(&outbound, &envelope);
    }

    /// Send, then pause for the settle window. Best-effort only; there is
    /// no delivery acknowledgment behind the pause.
    pub async fn send_settled(&self, envelope: Envelope) {
        self.send(envelope);
        tokio::time::sleep(self.config.send_settle).await;
    }

    /// Resolves once the channel is `Open`.
    pub async fn wait_open(&self) -> Result<(), PeerError> {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            match *state_rx.borrow_and_update() {
                PeerState::Open => return Ok(()),
                PeerState::Closed => return Err(PeerError::Closed),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(PeerError::Closed);
            }
        }
    }

    /// Explicit teardown. Marks the close as requested *before* the
    /// transport goes down so the reconnect path never fires.
    pub fn disconnect(&self) {
        let task = {
            let mut inner = self.inner.lock();
            inner.normal_close = true;
            inner.outbound = None;
            inner.run_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.state_tx.send_replace(PeerState::Closed);
        info!(peer = %self.peer_id, "peer channel closed");
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        if let Some(task) = self.inner.lock().run_task.take() {
            task.abort();
        }
    }
}
