//! Builders for the wire commands each channel speaks.

use serde_json::Value;

use crate::envelope::Envelope;
use crate::{command, module};

/// Commands dispatched over the relay-mediated gateway connection.
pub mod gateway {
    use super::*;

    pub fn authorize(realm: &str, token: &str, role: &str) -> Envelope {
        Envelope::new(module::GATEWAY, command::AUTHORIZE)
            .field("realm", realm)
            .field("token", token)
            .field("role", role)
    }

    pub fn subscribe(topics: &[String], robot_id: &str) -> Envelope {
        Envelope::new(module::GATEWAY, command::SUBSCRIBE)
            .field("topics", topics.to_vec())
            .field("robotId", robot_id)
    }

    pub fn unsubscribe(topics: &[String], robot_id: &str) -> Envelope {
        Envelope::new(module::GATEWAY, command::UNSUBSCRIBE)
            .field("topics", topics.to_vec())
            .field("robotId", robot_id)
    }

    /// Ask the relay to replay its last cached value for a topic.
    pub fn republish(topic: &str, robot_id: &str) -> Envelope {
        Envelope::new(module::GATEWAY, command::REPUBLISH)
            .field("topic", topic)
            .field("robotId", robot_id)
    }

    /// Delivery tuning for one subscribed topic.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct TopicConfig {
        pub latency_ms: Option<u64>,
        pub count: Option<u64>,
        pub heartbeat_ms: Option<u64>,
    }

    pub fn set_topic_config(topic: &str, robot_id: &str, config: &TopicConfig) -> Envelope {
        let mut envelope = Envelope::new(module::GATEWAY, command::SET_TOPIC_CONFIG)
            .field("topic", topic)
            .field("robotId", robot_id);
        if let Some(latency) = config.latency_ms {
            envelope = envelope.field("latency", latency);
        }
        if let Some(count) = config.count {
            envelope = envelope.field("count", count);
        }
        if let Some(heartbeat) = config.heartbeat_ms {
            envelope = envelope.field("heartbeat", heartbeat);
        }
        envelope
    }

    /// Command dispatch to a named robot. Fire-and-forget; correlation is
    /// the caller's concern via the generic message listener.
    pub fn action_command(robot_id: &str, payload: Value) -> Envelope {
        Envelope::new(module::GATEWAY, command::COMMAND)
            .with_timestamp_now()
            .field("robotId", robot_id)
            .field("payload", payload)
    }

    /// Robot-role publication of one topic value.
    pub fn publish(topic: &str, robot_id: &str, data: Value) -> Envelope {
        Envelope::new(module::GATEWAY, command::PUBLISH)
            .field("topic", topic)
            .field("robotId", robot_id)
            .field("data", data)
    }
}

/// Flow-domain commands spoken directly to a robot over the peer channel.
pub mod peer {
    use super::*;

    pub fn subscribe(subject: &str, throttle_ms: u64) -> Envelope {
        Envelope::new(module::CONTROL, command::SUBSCRIBE)
            .field("subject", subject)
            .field("throttleMs", throttle_ms)
    }

    pub fn state_subscribe(key: &str, target_topic: &str) -> Envelope {
        Envelope::new(module::CONTROL, command::STATE_SUBSCRIBE)
            .field("key", key)
            .field("targetTopic", target_topic)
    }

    pub fn state_get(key: &str) -> Envelope {
        Envelope::new(module::CONTROL, command::STATE_GET).field("key", key)
    }

    pub fn flow_start(
        flow_id: &str,
        index: u64,
        operator_id: &str,
        building_id: &str,
        floor_id: &str,
    ) -> Envelope {
        Envelope::new(module::CONTROL, command::FLOW_START)
            .field("flowId", flow_id)
            .field("index", index)
            .field("operatorId", operator_id)
            .field("buildingId", building_id)
            .field("floorId", floor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_config_omits_unset_fields() {
        let envelope = gateway::set_topic_config(
            "camera/front",
            "r-7",
            &gateway::TopicConfig {
                latency_ms: Some(40),
                ..Default::default()
            },
        );
        assert_eq!(envelope.get_u64("latency"), Some(40));
        assert!(envelope.get("count").is_none());
        assert!(envelope.get("heartbeat").is_none());
    }

    #[test]
    fn flow_start_addresses_the_full_context() {
        let envelope = peer::flow_start("delivery-a", 3, "op-1", "bld-2", "fl-3");
        assert_eq!(envelope.command, "flowStart");
        assert_eq!(envelope.get_str("flowId"), Some("delivery-a"));
        assert_eq!(envelope.get_u64("index"), Some(3));
        assert_eq!(envelope.get_str("floorId"), Some("fl-3"));
    }
}
