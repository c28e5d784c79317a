use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use helm_proto::{FLOW_STATE_KEY, commands};

use super::tracker::FlowNotification;
use super::{FlowEvent, FlowState};
use crate::peer::{PeerChannel, PeerState};

pub const DEFAULT_CONFIRM_SETTLE: Duration = Duration::from_secs(1);
pub const DEFAULT_LOW_BATTERY_THRESHOLD: f32 = 20.0;

/// A flow definition as the catalog knows it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<String>,
}

/// Lookup into the flow catalog maintained elsewhere in the portal.
pub trait FlowCatalog: Send + Sync {
    fn flow(&self, flow_id: &str) -> Option<FlowDefinition>;
}

/// Simple map-backed catalog for tooling and tests.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    flows: HashMap<String, FlowDefinition>,
}

impl InMemoryCatalog {
    pub fn new(flows: impl IntoIterator<Item = FlowDefinition>) -> Self {
        Self {
            flows: flows
                .into_iter()
                .map(|flow| (flow.id.clone(), flow))
                .collect(),
        }
    }
}

impl FlowCatalog for InMemoryCatalog {
    fn flow(&self, flow_id: &str) -> Option<FlowDefinition> {
        self.flows.get(flow_id).cloned()
    }
}

/// Ids and readings needed to address commands at the robot's location.
pub trait RobotContext: Send + Sync {
    fn operator_id(&self) -> String;
    fn building_id(&self) -> String;
    fn floor_id(&self) -> String;
    fn battery_percent(&self) -> Option<f32>;
}

/// Fixed context values, for tooling and tests.
#[derive(Debug, Clone)]
pub struct StaticContext {
    pub operator_id: String,
    pub building_id: String,
    pub floor_id: String,
    pub battery_percent: Option<f32>,
}

impl RobotContext for StaticContext {
    fn operator_id(&self) -> String {
        self.operator_id.clone()
    }

    fn building_id(&self) -> String {
        self.building_id.clone()
    }

    fn floor_id(&self) -> String {
        self.floor_id.clone()
    }

    fn battery_percent(&self) -> Option<f32> {
        self.battery_percent
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("a flow is already running on this robot")]
    AlreadyRunning,
    #[error("flow {0} not found")]
    NotFound(String),
    #[error("no confirmation is pending")]
    NotAwaitingConfirmation,
    #[error("peer channel is not open")]
    ChannelNotOpen,
}

/// A proposed flow start awaiting human confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingConfirmation {
    pub flow_id: String,
    pub step_index: u64,
    pub flow_name: String,
    pub step_name: String,
    /// Set when the robot reported a battery level under the threshold.
    /// A warning, not a blocker.
    pub low_battery: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingConfirmation,
    Confirmed,
}

/// Issues flow-start/resume commands behind a confirm-then-execute
/// sequence.
///
/// `start_flow` runs the pre-flight checks and parks a confirmation;
/// `confirm` refreshes the remote state, waits a fixed settle delay so
/// the remote's cached state cannot race the command, then sends the
/// actual start.
pub struct FlowOrchestrator {
    channel: Arc<PeerChannel>,
    catalog: Arc<dyn FlowCatalog>,
    context: Arc<dyn RobotContext>,
    flow_state: watch::Receiver<FlowState>,
    state_key: String,
    confirm_settle: Duration,
    low_battery_threshold: f32,
    pending: Mutex<(Phase, Option<PendingConfirmation>)>,
}

impl FlowOrchestrator {
    pub fn new(
        channel: Arc<PeerChannel>,
        catalog: Arc<dyn FlowCatalog>,
        context: Arc<dyn RobotContext>,
        flow_state: watch::Receiver<FlowState>,
    ) -> Self {
        Self {
            channel,
            catalog,
            context,
            flow_state,
            state_key: FLOW_STATE_KEY.to_string(),
            confirm_settle: DEFAULT_CONFIRM_SETTLE,
            low_battery_threshold: DEFAULT_LOW_BATTERY_THRESHOLD,
            pending: Mutex::new((Phase::Idle, None)),
        }
    }

    pub fn with_confirm_settle(mut self, settle: Duration) -> Self {
        self.confirm_settle = settle;
        self
    }

    /// Pre-flight a flow start. Declined while another flow is running;
    /// returns the confirmation payload to put in front of the operator.
    pub fn start_flow(
        &self,
        flow_id: &str,
        step_index: u64,
    ) -> Result<PendingConfirmation, FlowError> {
        let busy = self
            .flow_state
            .borrow()
            .last_event
            .as_ref()
            .is_some_and(FlowEvent::is_busy);
        if busy {
            return Err(FlowError::AlreadyRunning);
        }

        let definition = self
            .catalog
            .flow(flow_id)
            .ok_or_else(|| FlowError::NotFound(flow_id.to_string()))?;
        let step_name = definition
            .steps
            .get(step_index as usize)
            .cloned()
            .unwrap_or_else(|| format!("step {step_index}"));

        let low_battery = self
            .context
            .battery_percent()
            .is_some_and(|percent| percent < self.low_battery_threshold);
        if low_battery {
            warn!(
                flow = flow_id,
                battery = ?self.context.battery_percent(),
                "starting a flow on low battery"
            );
        }

        let confirmation = PendingConfirmation {
            flow_id: flow_id.to_string(),
            step_index,
            flow_name: definition.name,
            step_name,
            low_battery,
        };
        *self.pending.lock() = (Phase::AwaitingConfirmation, Some(confirmation.clone()));
        Ok(confirmation)
    }

    /// Execute the parked confirmation: refresh remote state, settle,
    /// then send the start command with the resolved operator context.
    pub async fn confirm(&self) -> Result<(), FlowError> {
        let confirmation = {
            let mut guard = self.pending.lock();
            match (guard.0, guard.1.clone()) {
                (Phase::AwaitingConfirmation, Some(pending)) => {
                    guard.0 = Phase::Confirmed;
                    pending
                }
                _ => return Err(FlowError::NotAwaitingConfirmation),
            }
        };

        if self.channel.state() != PeerState::Open {
            *self.pending.lock() = (Phase::Idle, None);
            return Err(FlowError::ChannelNotOpen);
        }

        info!(
            flow = %confirmation.flow_id,
            step = confirmation.step_index,
            "confirmed; refreshing state before start"
        );
        self.channel.send(commands::peer::state_get(&self.state_key));
        tokio::time::sleep(self.confirm_settle).await;
        self.channel.send(commands::peer::flow_start(
            &confirmation.flow_id,
            confirmation.step_index,
            &self.context.operator_id(),
            &self.context.building_id(),
            &self.context.floor_id(),
        ));
        *self.pending.lock() = (Phase::Idle, None);
        Ok(())
    }

    /// Drop the parked confirmation without sending anything.
    pub fn dismiss(&self) {
        let mut guard = self.pending.lock();
        if guard.0 == Phase::AwaitingConfirmation {
            *guard = (Phase::Idle, None);
        }
    }

    /// Build a retry for the flow and step captured in a stop or error
    /// notification. Same confirm-then-delayed-start path as a fresh
    /// start.
    pub fn retry_from(
        &self,
        notification: &FlowNotification,
    ) -> Result<PendingConfirmation, FlowError> {
        let flow_id = notification
            .flow_id
            .clone()
            .ok_or_else(|| FlowError::NotFound("<unknown flow>".to_string()))?;
        self.start_flow(&flow_id, notification.step_index.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerChannelConfig;
    use crate::peer::mock::{MockDialer, RemoteEnd, socket_pair};
    use helm_proto::envelope::Envelope;
    use tokio::time::timeout;

    fn catalog() -> Arc<InMemoryCatalog> {
        Arc::new(InMemoryCatalog::new([FlowDefinition {
            id: "delivery-a".to_string(),
            name: "Deliver to ward A".to_string(),
            steps: vec![
                "Leave dock".to_string(),
                "Ride elevator".to_string(),
                "Drop payload".to_string(),
            ],
        }]))
    }

    fn context(battery: Option<f32>) -> Arc<StaticContext> {
        Arc::new(StaticContext {
            operator_id: "op-1".to_string(),
            building_id: "bld-2".to_string(),
            floor_id: "fl-3".to_string(),
            battery_percent: battery,
        })
    }

    async fn open_channel() -> (Arc<PeerChannel>, RemoteEnd) {
        let dialer = Arc::new(MockDialer::new());
        let (socket, remote) = socket_pair();
        dialer.push_socket(socket);
        let channel = PeerChannel::new("r-1", dialer, PeerChannelConfig::default());
        channel.connect().await.expect("connect");
        (channel, remote)
    }

    fn orchestrator(
        channel: Arc<PeerChannel>,
        battery: Option<f32>,
        state: FlowState,
    ) -> (FlowOrchestrator, watch::Sender<FlowState>) {
        let (state_tx, state_rx) = watch::channel(state);
        (
            FlowOrchestrator::new(channel, catalog(), context(battery), state_rx),
            state_tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn busy_flow_rejects_start() {
        let (channel, _remote) = open_channel().await;
        for event in [FlowEvent::FlowStart, FlowEvent::CmdRun] {
            let (orchestrator, _state_tx) = orchestrator(
                Arc::clone(&channel),
                None,
                FlowState {
                    last_event: Some(event),
                    ..Default::default()
                },
            );
            assert_eq!(
                orchestrator.start_flow("delivery-a", 0),
                Err(FlowError::AlreadyRunning)
            );
        }

        // a finished flow no longer blocks
        let (orchestrator, _state_tx) = orchestrator(
            channel,
            None,
            FlowState {
                last_event: Some(FlowEvent::FlowDone),
                ..Default::default()
            },
        );
        assert!(orchestrator.start_flow("delivery-a", 0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_flow_is_declined() {
        let (channel, _remote) = open_channel().await;
        let (orchestrator, _state_tx) = orchestrator(channel, None, FlowState::default());
        assert_eq!(
            orchestrator.start_flow("missing", 0),
            Err(FlowError::NotFound("missing".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn low_battery_warns_without_blocking() {
        let (channel, _remote) = open_channel().await;
        let (orchestrator, _state_tx) = orchestrator(channel, Some(12.0), FlowState::default());
        let confirmation = orchestrator.start_flow("delivery-a", 1).expect("start");
        assert!(confirmation.low_battery);
        assert_eq!(confirmation.flow_name, "Deliver to ward A");
        assert_eq!(confirmation.step_name, "Ride elevator");
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_refreshes_state_then_starts_after_settle() {
        let (channel, mut remote) = open_channel().await;
        let (orchestrator, _state_tx) =
            orchestrator(Arc::clone(&channel), Some(80.0), FlowState::default());
        orchestrator.start_flow("delivery-a", 2).expect("start");
        orchestrator.confirm().await.expect("confirm");

        let first: Envelope = serde_json::from_str(
            &timeout(Duration::from_secs(5), remote.from_console.recv())
                .await
                .expect("frame in time")
                .expect("frame"),
        )
        .expect("decode");
        assert_eq!(first.command, "stateGet");

        let second: Envelope = serde_json::from_str(
            &timeout(Duration::from_secs(5), remote.from_console.recv())
                .await
                .expect("frame in time")
                .expect("frame"),
        )
        .expect("decode");
        assert_eq!(second.command, "flowStart");
        assert_eq!(second.get_str("flowId"), Some("delivery-a"));
        assert_eq!(second.get_u64("index"), Some(2));
        assert_eq!(second.get_str("operatorId"), Some("op-1"));
        assert_eq!(second.get_str("buildingId"), Some("bld-2"));
        assert_eq!(second.get_str("floorId"), Some("fl-3"));
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_without_pending_is_declined() {
        let (channel, _remote) = open_channel().await;
        let (orchestrator, _state_tx) = orchestrator(channel, None, FlowState::default());
        assert_eq!(
            orchestrator.confirm().await,
            Err(FlowError::NotAwaitingConfirmation)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_clears_the_pending_confirmation() {
        let (channel, _remote) = open_channel().await;
        let (orchestrator, _state_tx) = orchestrator(channel, None, FlowState::default());
        orchestrator.start_flow("delivery-a", 0).expect("start");
        orchestrator.dismiss();
        assert_eq!(
            orchestrator.confirm().await,
            Err(FlowError::NotAwaitingConfirmation)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_reuses_the_captured_flow_and_step() {
        let (channel, _remote) = open_channel().await;
        let (orchestrator, _state_tx) = orchestrator(channel, None, FlowState::default());
        let notification = FlowNotification {
            flow_id: Some("delivery-a".to_string()),
            step_index: Some(2),
            event: FlowEvent::CmdErr,
            message: Some("command timed out".to_string()),
        };
        let confirmation = orchestrator.retry_from(&notification).expect("retry");
        assert_eq!(confirmation.step_index, 2);
        assert_eq!(confirmation.step_name, "Drop payload");
    }
}
