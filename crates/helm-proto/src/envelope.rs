use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::command;

/// Logical wire envelope shared by the gateway and peer transports.
///
/// Command-specific fields live in the flattened `body` map; `timestamp`
/// and `correlationId` are hoisted because every command may carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "moduleTag")]
    pub module_tag: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    pub fn new(module_tag: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            module_tag: module_tag.into(),
            command: command.into(),
            timestamp: None,
            correlation_id: None,
            body: Map::new(),
        }
    }

    /// Add a command-specific field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Stamp the envelope with the current wall-clock time in milliseconds.
    pub fn with_timestamp_now(mut self) -> Self {
        self.timestamp = Some(chrono::Utc::now().timestamp_millis());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.body.get(key).and_then(Value::as_u64)
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.body.get(key).and_then(Value::as_object)
    }
}

/// Envelope wrapping one fragment of an oversized message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    #[serde(rename = "moduleTag")]
    pub module_tag: String,
    pub command: String,
    #[serde(rename = "chunkIndex")]
    pub chunk_index: u32,
    #[serde(rename = "chunkCount")]
    pub chunk_count: u32,
    pub fragment: String,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ChunkEnvelope {
    pub fn new(
        module_tag: impl Into<String>,
        chunk_index: u32,
        chunk_count: u32,
        fragment: impl Into<String>,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            module_tag: module_tag.into(),
            command: command::CHUNK.to_string(),
            chunk_index,
            chunk_count,
            fragment: fragment.into(),
            correlation_id,
        }
    }
}

/// Acknowledgment sent back to the peer after a non-final fragment.
pub fn continuation_ack(module_tag: &str, correlation_id: &str, chunk_index: u32) -> Envelope {
    Envelope::new(module_tag, command::CHUNK_CONTINUE)
        .with_correlation_id(correlation_id)
        .field("chunkIndex", chunk_index)
}

/// Generate a fresh random correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
