use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use helm_proto::envelope::Envelope;

use super::{FlowEvent, FlowSignal, FlowState};
use crate::peer::{PeerChannel, PeerState};

const NOTIFICATION_BUFFER: usize = 64;

/// A state change worth telling the operator about.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowNotification {
    pub flow_id: Option<String>,
    pub step_index: Option<u64>,
    pub event: FlowEvent,
    pub message: Option<String>,
}

/// Reducer over inbound flow signals.
///
/// Applies the two suppression rules: the first state-bearing message
/// after a (re)connect is stored with its event cleared, and repeats of
/// the same (flow, step, event) triple are dropped.
#[derive(Debug, Default)]
pub struct FlowTracker {
    state: FlowState,
    seen_first: bool,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Open a fresh suppression window; call on every reconnect.
    pub fn reset(&mut self) {
        self.seen_first = false;
    }

    /// Apply one signal. Returns a notification only when the state
    /// actually advanced and carries an event.
    pub fn observe(&mut self, signal: FlowSignal) -> Option<FlowNotification> {
        if !self.seen_first {
            // whatever happened before we were listening is history
            self.seen_first = true;
            self.state = FlowState {
                flow_id: signal.flow_id,
                step_index: signal.step_index,
                last_event: None,
                message: signal.message,
            };
            return None;
        }

        let duplicate = self.state.flow_id == signal.flow_id
            && self.state.step_index == signal.step_index
            && self.state.last_event == signal.event;
        if duplicate {
            debug!(
                flow = signal.flow_id.as_deref().unwrap_or("-"),
                "dropping duplicate flow event"
            );
            return None;
        }

        self.state = FlowState {
            flow_id: signal.flow_id.clone(),
            step_index: signal.step_index,
            last_event: signal.event.clone(),
            message: signal.message.clone(),
        };
        signal.event.map(|event| FlowNotification {
            flow_id: signal.flow_id,
            step_index: signal.step_index,
            event,
            message: signal.message,
        })
    }
}

/// Drives a [`FlowTracker`] from live channel traffic.
///
/// Consumes decoded messages from the peer channel (and optionally the
/// gateway), resets the suppression window on every reconnect, and fans
/// out state plus notifications to presentation layers.
pub struct FlowMonitor {
    state_rx: watch::Receiver<FlowState>,
    notifications_tx: broadcast::Sender<FlowNotification>,
    tasks: Vec<JoinHandle<()>>,
}

impl FlowMonitor {
    pub fn spawn(channel: &Arc<PeerChannel>) -> Self {
        Self::spawn_with_extra(channel, None)
    }

    /// Also feed messages arriving over the gateway (status topics).
    pub fn spawn_with_extra(
        channel: &Arc<PeerChannel>,
        extra: Option<broadcast::Receiver<Envelope>>,
    ) -> Self {
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<Envelope>();
        let mut tasks = Vec::new();

        tasks.push(spawn_forwarder(channel.messages(), feed_tx.clone()));
        if let Some(extra) = extra {
            tasks.push(spawn_forwarder(extra, feed_tx));
        }

        let (state_tx, state_rx) = watch::channel(FlowState::default());
        let (notifications_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let notifications = notifications_tx.clone();
        let mut conn_state = channel.state_watch();

        tasks.push(tokio::spawn(async move {
            let mut tracker = FlowTracker::new();
            loop {
                tokio::select! {
                    changed = conn_state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *conn_state.borrow_and_update() == PeerState::Open {
                            tracker.reset();
                        }
                    }
                    envelope = feed_rx.recv() => {
                        let Some(envelope) = envelope else { break };
                        let Some(signal) = FlowSignal::from_envelope(&envelope) else {
                            continue;
                        };
                        let notification = tracker.observe(signal);
                        state_tx.send_replace(tracker.state().clone());
                        if let Some(notification) = notification {
                            let _ = notifications.send(notification);
                        }
                    }
                }
            }
        }));

        Self {
            state_rx,
            notifications_tx,
            tasks,
        }
    }

    pub fn flow_state(&self) -> watch::Receiver<FlowState> {
        self.state_rx.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<FlowNotification> {
        self.notifications_tx.subscribe()
    }
}

impl Drop for FlowMonitor {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn spawn_forwarder(
    mut source: broadcast::Receiver<Envelope>,
    sink: mpsc::UnboundedSender<Envelope>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(envelope) => {
                    if sink.send(envelope).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "flow monitor lagged behind channel traffic");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(flow_id: &str, step: u64, event: FlowEvent) -> FlowSignal {
        FlowSignal {
            flow_id: Some(flow_id.to_string()),
            step_index: Some(step),
            event: Some(event),
            message: None,
        }
    }

    #[test]
    fn first_event_is_stored_with_event_cleared() {
        let mut tracker = FlowTracker::new();
        let notification = tracker.observe(signal("f1", 0, FlowEvent::FlowStart));
        assert!(notification.is_none());
        assert_eq!(tracker.state().flow_id.as_deref(), Some("f1"));
        assert_eq!(tracker.state().last_event, None);
    }

    #[test]
    fn identical_triples_dedup_after_the_first_notification() {
        let mut tracker = FlowTracker::new();
        tracker.observe(signal("f1", 1, FlowEvent::CmdRun));

        // same triple as stored state differs only by the cleared event
        let first = tracker.observe(signal("f1", 2, FlowEvent::CmdRun));
        assert_eq!(
            first.as_ref().map(|n| &n.event),
            Some(&FlowEvent::CmdRun)
        );

        let second = tracker.observe(signal("f1", 2, FlowEvent::CmdRun));
        assert!(second.is_none(), "duplicate must be dropped");

        let third = tracker.observe(signal("f1", 3, FlowEvent::CmdRun));
        assert!(third.is_some(), "differing step must pass");
    }

    #[test]
    fn reset_reopens_the_suppression_window() {
        let mut tracker = FlowTracker::new();
        tracker.observe(signal("f1", 0, FlowEvent::FlowStart));
        let notification = tracker.observe(signal("f1", 1, FlowEvent::CmdRun));
        assert!(notification.is_some());

        tracker.reset();
        let replay = tracker.observe(signal("f1", 1, FlowEvent::CmdRun));
        assert!(replay.is_none(), "replay after reconnect must be silent");
        assert_eq!(tracker.state().last_event, None);
    }

    #[test]
    fn unclassified_events_dedup_like_known_ones() {
        let mut tracker = FlowTracker::new();
        tracker.observe(signal("f1", 0, FlowEvent::FlowStart));
        let first = tracker.observe(signal("f1", 1, FlowEvent::Unclassified("charging".into())));
        assert!(first.is_some());
        let repeat = tracker.observe(signal("f1", 1, FlowEvent::Unclassified("charging".into())));
        assert!(repeat.is_none());
    }

    #[test]
    fn eventless_snapshot_updates_state_without_notifying() {
        let mut tracker = FlowTracker::new();
        tracker.observe(signal("f1", 0, FlowEvent::FlowStart));
        let notification = tracker.observe(FlowSignal {
            flow_id: Some("f1".to_string()),
            step_index: Some(4),
            event: None,
            message: Some("idle".to_string()),
        });
        assert!(notification.is_none());
        assert_eq!(tracker.state().step_index, Some(4));
    }
}
