use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use helm_proto::{FLOW_STATE_KEY, commands, subject};

use crate::peer::{PeerChannel, PeerState};

pub const DEFAULT_SETTLE: Duration = Duration::from_millis(500);
pub const DEFAULT_PACING: Duration = Duration::from_millis(200);
pub const DEFAULT_THROTTLE_MS: u64 = 500;

/// What to subscribe after each successful peer connect.
#[derive(Debug, Clone)]
pub struct SubscriptionPlan {
    /// Delivery throttle requested for data subjects.
    pub throttle_ms: u64,
    /// Whether the flow topics and state subscription are wanted.
    pub flow_tracking: bool,
    /// State-registry key for the remote flow controller.
    pub state_key: String,
    /// Topic the remote should route state-change events to.
    pub target_topic: String,
}

impl Default for SubscriptionPlan {
    fn default() -> Self {
        Self {
            throttle_ms: DEFAULT_THROTTLE_MS,
            flow_tracking: true,
            state_key: FLOW_STATE_KEY.to_string(),
            target_topic: subject::EVENTS.to_string(),
        }
    }
}

/// Sequences topic subscriptions after every peer connect.
///
/// The robot processes subscription requests synchronously and can drop
/// rapid-fire ones, so requests go out one at a time with a fixed pacing
/// delay, after a settle window mirroring the remote's own post-connect
/// readiness. Subscriptions do not survive a transport drop; the manager
/// re-runs the sequence on every transition back to `Open`.
pub struct SubscriptionManager {
    channel: Arc<PeerChannel>,
    plan: SubscriptionPlan,
    settle: Duration,
    pacing: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(channel: Arc<PeerChannel>, plan: SubscriptionPlan) -> Self {
        Self {
            channel,
            plan,
            settle: DEFAULT_SETTLE,
            pacing: DEFAULT_PACING,
            task: Mutex::new(None),
        }
    }

    pub fn with_delays(mut self, settle: Duration, pacing: Duration) -> Self {
        self.settle = settle;
        self.pacing = pacing;
        self
    }

    /// Start watching the channel. Idempotent.
    pub fn arm(&self) {
        let mut guard = self.task.lock();
        if guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let channel = Arc::clone(&self.channel);
        let plan = self.plan.clone();
        let settle = self.settle;
        let pacing = self.pacing;
        *guard = Some(tokio::spawn(async move {
            watch_loop(channel, plan, settle, pacing).await;
        }));
    }

    /// Stop watching and cancel any in-flight sequence.
    pub fn disarm(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.disarm();
    }
}

async fn watch_loop(
    channel: Arc<PeerChannel>,
    plan: SubscriptionPlan,
    settle: Duration,
    pacing: Duration,
) {
    let mut state_rx = channel.state_watch();
    loop {
        // wait for the channel to open
        loop {
            match *state_rx.borrow_and_update() {
                PeerState::Open => break,
                PeerState::Closed => return,
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }

        // a drop mid-sequence cancels it; the next Open starts over
        tokio::select! {
            _ = run_sequence(&channel, &plan, settle, pacing) => {
                if wait_while_open(&mut state_rx).await == PeerState::Closed {
                    return;
                }
            }
            state = wait_while_open(&mut state_rx) => {
                debug!(peer = channel.peer_id(), "subscription sequence interrupted");
                if state == PeerState::Closed {
                    return;
                }
            }
        }
    }
}

async fn wait_while_open(state_rx: &mut tokio::sync::watch::Receiver<PeerState>) -> PeerState {
    loop {
        let state = *state_rx.borrow_and_update();
        if state != PeerState::Open {
            return state;
        }
        if state_rx.changed().await.is_err() {
            return PeerState::Closed;
        }
    }
}

async fn run_sequence(
    channel: &PeerChannel,
    plan: &SubscriptionPlan,
    settle: Duration,
    pacing: Duration,
) {
    info!(peer = channel.peer_id(), "subscribing peer topics");
    tokio::time::sleep(settle).await;
    channel.send(commands::peer::subscribe(
        subject::DATA_MAIN,
        plan.throttle_ms,
    ));

    if !plan.flow_tracking {
        return;
    }
    tokio::time::sleep(pacing).await;
    channel.send(commands::peer::subscribe(
        subject::DATA_FLOW,
        plan.throttle_ms,
    ));
    tokio::time::sleep(pacing).await;
    channel.send(commands::peer::subscribe(subject::EVENTS, plan.throttle_ms));
    tokio::time::sleep(pacing).await;
    channel.send(commands::peer::state_subscribe(
        &plan.state_key,
        &plan.target_topic,
    ));
    tokio::time::sleep(pacing).await;
    // immediate snapshot so the UI is not blank until the next event
    channel.send(commands::peer::state_get(&plan.state_key));
    debug!(peer = channel.peer_id(), "subscription sequence complete");
}
