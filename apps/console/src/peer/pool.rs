use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::transport::PeerDialer;
use super::{PeerChannel, PeerChannelConfig, PeerId, PeerState};

struct PoolEntry {
    channel: Arc<PeerChannel>,
    refs: usize,
}

/// Process-wide pool of peer channels keyed by peer identity.
///
/// UI surfaces may remount without a clean teardown; handing every
/// consumer a refcounted handle to one shared channel keeps a robot on a
/// single socket, and the last handle's drop is the one that closes it.
/// All pool access is synchronous.
pub struct PeerPool {
    dialer: Arc<dyn PeerDialer>,
    config: PeerChannelConfig,
    entries: Mutex<HashMap<PeerId, PoolEntry>>,
    // handed to handles so their drop can release through the pool
    weak_self: Weak<PeerPool>,
}

impl PeerPool {
    pub fn new(dialer: Arc<dyn PeerDialer>, config: PeerChannelConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            dialer,
            config,
            entries: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    /// Get a handle to the channel for `peer_id`, reusing a live one.
    pub fn acquire(&self, peer_id: &str) -> PeerHandle {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                info!(peer = peer_id, "opening pooled peer channel");
                PoolEntry {
                    channel: PeerChannel::new(peer_id, Arc::clone(&self.dialer), self.config.clone()),
                    refs: 0,
                }
            });
        // a previously closed channel cannot be revived; replace it
        if entry.channel.state() == PeerState::Closed {
            entry.channel =
                PeerChannel::new(peer_id, Arc::clone(&self.dialer), self.config.clone());
        }
        entry.refs += 1;
        debug!(peer = peer_id, refs = entry.refs, "peer channel acquired");
        PeerHandle {
            pool: self.weak_self.clone(),
            peer_id: peer_id.to_string(),
            channel: Arc::clone(&entry.channel),
        }
    }

    fn release(&self, peer_id: &str) {
        let closing = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(peer_id) else {
                return;
            };
            entry.refs -= 1;
            debug!(peer = peer_id, refs = entry.refs, "peer channel released");
            if entry.refs == 0 {
                entries.remove(peer_id)
            } else {
                None
            }
        };
        if let Some(entry) = closing {
            entry.channel.disconnect();
        }
    }

    pub fn live_channels(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Refcounted handle to a pooled peer channel. Dropping the last handle
/// for a peer closes the underlying socket.
pub struct PeerHandle {
    pool: Weak<PeerPool>,
    peer_id: PeerId,
    channel: Arc<PeerChannel>,
}

impl PeerHandle {
    pub fn channel(&self) -> &Arc<PeerChannel> {
        &self.channel
    }

    /// Start the connection loop and wait for it to open.
    pub async fn connect(&self) -> Result<(), super::PeerError> {
        self.channel.connect().await
    }
}

impl Deref for PeerHandle {
    type Target = PeerChannel;

    fn deref(&self) -> &Self::Target {
        &self.channel
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(&self.peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{MockDialer, socket_pair};
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn same_peer_shares_one_channel() {
        let dialer = Arc::new(MockDialer::new());
        let (socket, _remote) = socket_pair();
        dialer.push_socket(socket);

        let pool = PeerPool::new(
            Arc::clone(&dialer) as Arc<dyn PeerDialer>,
            PeerChannelConfig::default(),
        );
        let first = pool.acquire("r-1");
        first.connect().await.expect("connect");
        let second = pool.acquire("r-1");

        assert!(Arc::ptr_eq(first.channel(), second.channel()));
        assert_eq!(dialer.dial_count(), 1);
        assert_eq!(pool.live_channels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_handle_drop_closes_the_socket() {
        let dialer = Arc::new(MockDialer::new());
        let (socket, _remote) = socket_pair();
        dialer.push_socket(socket);

        let pool = PeerPool::new(
            Arc::clone(&dialer) as Arc<dyn PeerDialer>,
            PeerChannelConfig::default(),
        );
        let first = pool.acquire("r-1");
        first.connect().await.expect("connect");
        let channel = Arc::clone(first.channel());
        let second = pool.acquire("r-1");

        drop(first);
        assert_eq!(channel.state(), PeerState::Open);

        drop(second);
        assert_eq!(channel.state(), PeerState::Closed);
        assert_eq!(pool.live_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_peers_get_distinct_channels() {
        let dialer = Arc::new(MockDialer::new());
        let pool = PeerPool::new(dialer as Arc<dyn PeerDialer>, PeerChannelConfig::default());
        let a = pool.acquire("r-1");
        let b = pool.acquire("r-2");
        assert!(!Arc::ptr_eq(a.channel(), b.channel()));
        assert_eq!(pool.live_channels(), 2);
    }
}
