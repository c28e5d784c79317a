use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::PeerError;
use super::transport::{PeerDialer, PeerSocket};

/// The far end of an in-memory peer socket, held by the test.
pub struct RemoteEnd {
    /// Frames the test injects as if the robot sent them.
    pub to_console: mpsc::UnboundedSender<String>,
    /// Frames the console wrote to the socket.
    pub from_console: mpsc::UnboundedReceiver<String>,
}

/// Build a connected in-memory socket pair.
pub fn socket_pair() -> (PeerSocket, RemoteEnd) {
    let (to_console, inbound) = mpsc::unbounded_channel();
    let (outbound, from_console) = mpsc::unbounded_channel();
    (
        PeerSocket { outbound, inbound },
        RemoteEnd {
            to_console,
            from_console,
        },
    )
}

/// Scriptable dialer for tests: each dial pops the next prepared socket
/// (or connect error), so reconnect sequences can be exercised without a
/// network.
#[derive(Default)]
pub struct MockDialer {
    scripts: Mutex<VecDeque<Result<PeerSocket, PeerError>>>,
    dials: AtomicUsize,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_socket(&self, socket: PeerSocket) {
        self.scripts.lock().push_back(Ok(socket));
    }

    pub fn push_error(&self, error: PeerError) {
        self.scripts.lock().push_back(Err(error));
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerDialer for MockDialer {
    async fn dial(&self, _peer_id: &str) -> Result<PeerSocket, PeerError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(PeerError::Connect("no scripted socket".to_string())))
    }
}
