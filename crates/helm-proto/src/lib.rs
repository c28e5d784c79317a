pub mod codec;
pub mod commands;
pub mod envelope;

pub use codec::{CodecConfig, DecodeOutcome, Decoder, ProtocolError, encode};
pub use envelope::{ChunkEnvelope, Envelope, continuation_ack, new_correlation_id};

/// Module tags carried in the `moduleTag` envelope field.
pub mod module {
    /// Relay-mediated gateway traffic.
    pub const GATEWAY: &str = "gateway";
    /// Direct robot control traffic over the peer channel.
    pub const CONTROL: &str = "control";
}

/// Logical command names used on the wire.
pub mod command {
    pub const AUTHORIZE: &str = "authorize";
    pub const RESULT: &str = "res";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const REPUBLISH: &str = "republish";
    pub const SET_TOPIC_CONFIG: &str = "setTopicConfig";
    pub const COMMAND: &str = "command";
    pub const PUBLISH: &str = "publish";
    pub const STATE_SUBSCRIBE: &str = "stateSubscribe";
    pub const STATE_GET: &str = "stateGet";
    pub const FLOW_START: &str = "flowStart";
    pub const CHUNK: &str = "chunk";
    pub const CHUNK_CONTINUE: &str = "chunk_continue";
}

/// Peer-channel subjects the console subscribes to after connect.
pub mod subject {
    pub const DATA_MAIN: &str = "system.data.main";
    pub const DATA_FLOW: &str = "system.data.flow";
    pub const EVENTS: &str = "system.evt";
}

/// State-registry key for the remote flow controller.
pub const FLOW_STATE_KEY: &str = "ugo.control.flow";
