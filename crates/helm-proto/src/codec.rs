use thiserror::Error;
use tracing::warn;

use crate::envelope::{ChunkEnvelope, Envelope, continuation_ack, new_correlation_id};
use crate::command;

pub const DEFAULT_CHUNK_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Serialized messages longer than this are split into chunk envelopes.
    pub chunk_threshold: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("failed to serialize envelope: {0}")]
    Serialize(String),
    #[error("new fragmented message started while another was incomplete")]
    InterleavedAssembly,
    #[error("chunk {index} arrived without an active assembly")]
    OrphanChunk { index: u32 },
    #[error("chunk out of order: expected {expected}, got {got}")]
    OutOfOrderChunk { expected: u32, got: u32 },
    #[error("chunk count changed mid-assembly: {expected} != {got}")]
    CountMismatch { expected: u32, got: u32 },
    #[error("chunk envelope malformed: {0}")]
    MalformedChunk(&'static str),
}

/// Encode an envelope into one or more wire text frames.
///
/// Messages at or under the threshold become a single frame; larger ones
/// are split into ordered chunk envelopes sharing a generated correlation
/// id, with 1-based indices.
pub fn encode(envelope: &Envelope, config: &CodecConfig) -> Result<Vec<String>, ProtocolError> {
    let text = serde_json::to_string(envelope)
        .map_err(|err| ProtocolError::Serialize(err.to_string()))?;
    if text.len() <= config.chunk_threshold {
        return Ok(vec![text]);
    }

    let correlation_id = new_correlation_id();
    let fragments = split_utf8(&text, config.chunk_threshold.max(1));
    let chunk_count = fragments.len() as u32;
    let mut frames = Vec::with_capacity(fragments.len());
    for (offset, fragment) in fragments.into_iter().enumerate() {
        let chunk = ChunkEnvelope::new(
            envelope.module_tag.clone(),
            offset as u32 + 1,
            chunk_count,
            fragment,
            Some(correlation_id.clone()),
        );
        frames.push(
            serde_json::to_string(&chunk)
                .map_err(|err| ProtocolError::Serialize(err.to_string()))?,
        );
    }
    Ok(frames)
}

/// Split on char boundaries so every fragment stays valid UTF-8.
fn split_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    let mut fragments = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // threshold smaller than one char; take the first char whole
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(cut);
        fragments.push(head);
        rest = tail;
    }
    fragments.push(rest);
    fragments
}

/// Result of feeding one inbound frame to the decoder.
#[derive(Debug, Default, PartialEq)]
pub struct DecodeOutcome {
    /// A fully decoded message, present once reassembly (if any) completes.
    pub message: Option<Envelope>,
    /// Continuation ack the channel must send back to the peer.
    pub ack: Option<Envelope>,
}

#[derive(Debug)]
struct ChunkAssembly {
    module_tag: String,
    correlation_id: Option<String>,
    chunk_count: u32,
    last_index: u32,
    buffer: String,
}

/// Stateful frame decoder. At most one fragmented message may be in
/// flight at a time; interleaving is a protocol violation.
#[derive(Debug)]
pub struct Decoder {
    assembly: Option<ChunkAssembly>,
}

impl Decoder {
    pub fn new() -> Self {
        Self { assembly: None }
    }

    /// Decode one inbound text frame.
    ///
    /// Malformed JSON is logged and yields an empty outcome; chunk
    /// sequencing violations drop the assembly and surface an error, but
    /// the decoder stays usable for subsequent frames.
    pub fn decode(&mut self, text: &str) -> Result<DecodeOutcome, ProtocolError> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return Ok(DecodeOutcome::default());
            }
        };

        if value.get("command").and_then(serde_json::Value::as_str) == Some(command::CHUNK) {
            let chunk: ChunkEnvelope = serde_json::from_value(value)
                .map_err(|_| ProtocolError::MalformedChunk("missing chunk fields"))?;
            return self.ingest_chunk(chunk);
        }

        match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => Ok(DecodeOutcome {
                message: Some(envelope),
                ack: None,
            }),
            Err(err) => {
                warn!(error = %err, "dropping frame with unexpected shape");
                Ok(DecodeOutcome::default())
            }
        }
    }

    fn ingest_chunk(&mut self, chunk: ChunkEnvelope) -> Result<DecodeOutcome, ProtocolError> {
        if chunk.chunk_count == 0 {
            return Err(ProtocolError::MalformedChunk("chunk count cannot be zero"));
        }
        if chunk.chunk_index == 0 || chunk.chunk_index > chunk.chunk_count {
            return Err(ProtocolError::MalformedChunk("chunk index out of range"));
        }

        if chunk.chunk_index == 1 {
            if self.assembly.take().is_some() {
                // The peer must retransmit from its first fragment.
                return Err(ProtocolError::InterleavedAssembly);
            }
            self.assembly = Some(ChunkAssembly {
                module_tag: chunk.module_tag,
                correlation_id: chunk.correlation_id,
                chunk_count: chunk.chunk_count,
                last_index: 1,
                buffer: chunk.fragment,
            });
        } else {
            let Some(assembly) = self.assembly.as_mut() else {
                return Err(ProtocolError::OrphanChunk {
                    index: chunk.chunk_index,
                });
            };
            if assembly.chunk_count != chunk.chunk_count {
                let expected = assembly.chunk_count;
                self.assembly = None;
                return Err(ProtocolError::CountMismatch {
                    expected,
                    got: chunk.chunk_count,
                });
            }
            let expected = assembly.last_index + 1;
            if chunk.chunk_index != expected {
                self.assembly = None;
                return Err(ProtocolError::OutOfOrderChunk {
                    expected,
                    got: chunk.chunk_index,
                });
            }
            assembly.buffer.push_str(&chunk.fragment);
            assembly.last_index = chunk.chunk_index;
        }

        let assembly = self.assembly.as_ref().expect("assembly present");
        if assembly.last_index == assembly.chunk_count {
            let assembly = self.assembly.take().expect("assembly present");
            return Ok(match serde_json::from_str::<Envelope>(&assembly.buffer) {
                Ok(envelope) => DecodeOutcome {
                    message: Some(envelope),
                    ack: None,
                },
                Err(err) => {
                    warn!(error = %err, "reassembled message is undecodable; dropping");
                    DecodeOutcome::default()
                }
            });
        }

        let ack = assembly.correlation_id.as_deref().map(|correlation_id| {
            continuation_ack(&assembly.module_tag, correlation_id, assembly.last_index)
        });
        Ok(DecodeOutcome { message: None, ack })
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module;

    fn sample(payload: &str) -> Envelope {
        Envelope::new(module::CONTROL, "data").field("payload", payload)
    }

    #[test]
    fn small_message_is_a_single_frame() {
        let config = CodecConfig::default();
        let envelope = sample("hello");
        let frames = encode(&envelope, &config).expect("encode");
        assert_eq!(frames.len(), 1);

        let mut decoder = Decoder::new();
        let outcome = decoder.decode(&frames[0]).expect("decode");
        assert_eq!(outcome.message, Some(envelope));
        assert!(outcome.ack.is_none());
    }

    #[test]
    fn oversized_message_round_trips_across_chunks() {
        let config = CodecConfig {
            chunk_threshold: 64,
        };
        let envelope = sample(&"x".repeat(500));
        let frames = encode(&envelope, &config).expect("encode");
        assert!(frames.len() > 2);

        let mut decoder = Decoder::new();
        let mut recovered = None;
        for (offset, frame) in frames.iter().enumerate() {
            let outcome = decoder.decode(frame).expect("decode");
            if offset + 1 < frames.len() {
                assert!(outcome.message.is_none());
                let ack = outcome.ack.expect("continuation ack");
                assert_eq!(ack.command, "chunk_continue");
                assert_eq!(ack.get_u64("chunkIndex"), Some(offset as u64 + 1));
            } else {
                recovered = outcome.message;
            }
        }
        assert_eq!(recovered, Some(envelope));
    }

    #[test]
    fn multibyte_payload_splits_on_char_boundaries() {
        let config = CodecConfig {
            chunk_threshold: 48,
        };
        let envelope = sample(&"ロボット遠隔操作".repeat(20));
        let frames = encode(&envelope, &config).expect("encode");
        assert!(frames.len() > 1);

        let mut decoder = Decoder::new();
        let mut recovered = None;
        for frame in &frames {
            recovered = decoder.decode(frame).expect("decode").message;
        }
        assert_eq!(recovered, Some(envelope));
    }

    #[test]
    fn message_arrives_only_on_final_fragment() {
        let inner = r#"{"moduleTag":"control","command":"data","a":1,"b":[2,3]}"#;
        let thirds = [&inner[..18], &inner[18..36], &inner[36..]];
        let mut decoder = Decoder::new();
        for (offset, fragment) in thirds.iter().enumerate() {
            let chunk = ChunkEnvelope::new(
                module::CONTROL,
                offset as u32 + 1,
                3,
                *fragment,
                Some("c-1".to_string()),
            );
            let frame = serde_json::to_string(&chunk).expect("serialize chunk");
            let outcome = decoder.decode(&frame).expect("decode");
            if offset < 2 {
                assert!(outcome.message.is_none());
                assert!(outcome.ack.is_some());
            } else {
                let message = outcome.message.expect("reassembled message");
                assert_eq!(message.command, "data");
                assert_eq!(message.get_u64("a"), Some(1));
            }
        }
    }

    #[test]
    fn chunk_without_correlation_id_yields_no_ack() {
        let chunk = ChunkEnvelope::new(module::CONTROL, 1, 2, "{\"mod", None);
        let frame = serde_json::to_string(&chunk).expect("serialize chunk");
        let outcome = Decoder::new().decode(&frame).expect("decode");
        assert!(outcome.message.is_none());
        assert!(outcome.ack.is_none());
    }

    #[test]
    fn interleaved_assembly_is_rejected() {
        let mut decoder = Decoder::new();
        let first = ChunkEnvelope::new(module::CONTROL, 1, 3, "aaa", None);
        decoder
            .decode(&serde_json::to_string(&first).expect("serialize"))
            .expect("decode first");

        let intruder = ChunkEnvelope::new(module::CONTROL, 1, 2, "bbb", None);
        let err = decoder
            .decode(&serde_json::to_string(&intruder).expect("serialize"))
            .expect_err("interleaving must be rejected");
        assert_eq!(err, ProtocolError::InterleavedAssembly);

        // both assemblies are gone; a follow-up middle chunk is an orphan
        let late = ChunkEnvelope::new(module::CONTROL, 2, 3, "ccc", None);
        let err = decoder
            .decode(&serde_json::to_string(&late).expect("serialize"))
            .expect_err("orphan chunk");
        assert_eq!(err, ProtocolError::OrphanChunk { index: 2 });
    }

    #[test]
    fn out_of_order_chunk_drops_the_assembly() {
        let mut decoder = Decoder::new();
        let first = ChunkEnvelope::new(module::CONTROL, 1, 4, "aaa", None);
        decoder
            .decode(&serde_json::to_string(&first).expect("serialize"))
            .expect("decode first");

        let skipped = ChunkEnvelope::new(module::CONTROL, 3, 4, "ccc", None);
        let err = decoder
            .decode(&serde_json::to_string(&skipped).expect("serialize"))
            .expect_err("gap must be rejected");
        assert_eq!(err, ProtocolError::OutOfOrderChunk { expected: 2, got: 3 });
    }

    #[test]
    fn malformed_json_is_dropped_quietly() {
        let mut decoder = Decoder::new();
        let outcome = decoder.decode("{not json").expect("decode");
        assert_eq!(outcome, DecodeOutcome::default());
    }
}
