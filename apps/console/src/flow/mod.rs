use serde_json::Value;

use helm_proto::envelope::Envelope;

pub mod orchestrator;
pub mod tracker;

pub use orchestrator::{
    FlowCatalog, FlowDefinition, FlowError, FlowOrchestrator, PendingConfirmation, RobotContext,
};
pub use tracker::{FlowMonitor, FlowNotification, FlowTracker};

/// Execution events reported by the remote flow controller.
///
/// The wire carries free-form tags; unknown ones are preserved as
/// `Unclassified` so they still participate in dedup and display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    FlowStart,
    FlowPause,
    FlowStop,
    FlowDone,
    CmdRun,
    CmdDone,
    CmdErr,
    Unclassified(String),
}

impl FlowEvent {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "flow_start" => FlowEvent::FlowStart,
            "flow_pause" => FlowEvent::FlowPause,
            "flow_stop" => FlowEvent::FlowStop,
            "flow_done" => FlowEvent::FlowDone,
            "c_run" => FlowEvent::CmdRun,
            "c_done" => FlowEvent::CmdDone,
            "c_err" => FlowEvent::CmdErr,
            other => FlowEvent::Unclassified(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FlowEvent::FlowStart => "flow_start",
            FlowEvent::FlowPause => "flow_pause",
            FlowEvent::FlowStop => "flow_stop",
            FlowEvent::FlowDone => "flow_done",
            FlowEvent::CmdRun => "c_run",
            FlowEvent::CmdDone => "c_done",
            FlowEvent::CmdErr => "c_err",
            FlowEvent::Unclassified(tag) => tag,
        }
    }

    /// Whether this event means a flow is currently executing.
    pub fn is_busy(&self) -> bool {
        matches!(self, FlowEvent::FlowStart | FlowEvent::CmdRun)
    }
}

/// Last observed execution status of a robot flow. One mutable slot per
/// robot; only the tracker writes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowState {
    pub flow_id: Option<String>,
    pub step_index: Option<u64>,
    pub last_event: Option<FlowEvent>,
    pub message: Option<String>,
}

/// A state-bearing inbound message, normalized from either wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSignal {
    pub flow_id: Option<String>,
    pub step_index: Option<u64>,
    pub event: Option<FlowEvent>,
    pub message: Option<String>,
}

impl FlowSignal {
    /// Extract a flow signal from a decoded message: either a state
    /// snapshot (body key `flow`) or a streaming flow event.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        if let Some(flow) = envelope.get_object("flow") {
            return Some(Self {
                flow_id: flow
                    .get("flowId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                step_index: flow.get("index").and_then(Value::as_u64),
                event: flow
                    .get("event")
                    .and_then(Value::as_str)
                    .map(FlowEvent::parse),
                message: flow
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        // streaming shape: explicit flow id and event tag at the top level
        let event = envelope.get_str("event")?;
        envelope.get_str("flowId")?;
        Some(Self {
            flow_id: envelope.get_str("flowId").map(str::to_string),
            step_index: envelope.get_u64("index"),
            event: Some(FlowEvent::parse(event)),
            message: envelope.get_str("message").map(str::to_string),
        })
    }
}

/// Recovery guidance categories for remote-reported command errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The robot hit its emergency stop; needs on-site clearance.
    EmergencyStop,
    /// Lost contact or timed out; usually transient.
    TimeoutNetwork,
    /// Anything else; offer a plain retry.
    Generic,
}

/// Classify a `c_err` message text into a recovery category.
///
/// Case-insensitive substring matching; presentation-layer concern on top
/// of the tracker's output.
pub fn classify_error(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if ["emergency", "e-stop", "estop"]
        .iter()
        .any(|pattern| lower.contains(pattern))
    {
        ErrorCategory::EmergencyStop
    } else if ["timeout", "timed out", "network"]
        .iter()
        .any(|pattern| lower.contains(pattern))
    {
        ErrorCategory::TimeoutNetwork
    } else {
        ErrorCategory::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_proto::module;

    #[test]
    fn unknown_tags_stay_unclassified() {
        assert_eq!(FlowEvent::parse("c_run"), FlowEvent::CmdRun);
        assert_eq!(
            FlowEvent::parse("charging"),
            FlowEvent::Unclassified("charging".to_string())
        );
        assert_eq!(FlowEvent::parse("charging").as_str(), "charging");
    }

    #[test]
    fn snapshot_and_streaming_shapes_both_normalize() {
        let snapshot = Envelope::new(module::CONTROL, "data").field(
            "flow",
            serde_json::json!({
                "flowId": "delivery-a",
                "index": 2,
                "event": "c_run",
                "message": "moving to waypoint",
            }),
        );
        let signal = FlowSignal::from_envelope(&snapshot).expect("snapshot signal");
        assert_eq!(signal.flow_id.as_deref(), Some("delivery-a"));
        assert_eq!(signal.step_index, Some(2));
        assert_eq!(signal.event, Some(FlowEvent::CmdRun));

        let streaming = Envelope::new(module::CONTROL, "evt")
            .field("flowId", "delivery-a")
            .field("index", 3)
            .field("event", "c_done")
            .field("message", "arrived");
        let signal = FlowSignal::from_envelope(&streaming).expect("streaming signal");
        assert_eq!(signal.step_index, Some(3));
        assert_eq!(signal.event, Some(FlowEvent::CmdDone));

        let unrelated = Envelope::new(module::CONTROL, "data").field("battery", 80);
        assert!(FlowSignal::from_envelope(&unrelated).is_none());
    }

    #[test]
    fn error_messages_classify_by_substring() {
        assert_eq!(
            classify_error("Emergency stop engaged"),
            ErrorCategory::EmergencyStop
        );
        assert_eq!(classify_error("E-Stop pressed"), ErrorCategory::EmergencyStop);
        assert_eq!(
            classify_error("command timed out after 30s"),
            ErrorCategory::TimeoutNetwork
        );
        assert_eq!(
            classify_error("Network unreachable"),
            ErrorCategory::TimeoutNetwork
        );
        assert_eq!(classify_error("unknown failure"), ErrorCategory::Generic);
    }
}
