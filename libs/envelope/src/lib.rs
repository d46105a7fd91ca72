//! Envelope codec: broker record bytes ↔ [`Batch`].
//!
//! Wire shape (JSON, message `content` base64):
//!
//! ```json
//! {"aggregationID": "conv1", "lastSeq": 6, "triggerID": "t1", "operationID": "op-1",
//!  "messages": [{"seq": 5, "contentType": 101, "sendID": "u1", "content": "aGk="}]}
//! ```

use serde::{Deserialize, Serialize};

use msg_api::{Batch, MessageRecord};

/// Default upper bound on an encoded envelope (4 MiB).
pub const DEFAULT_MAX_BYTES: usize = 4 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════

/// A malformed envelope. Never becomes valid by retrying.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty envelope")]
    Empty,

    #[error("envelope too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope has no conversation key")]
    MissingConversation,
}

// ═══════════════════════════════════════════════════════════════
//  Codec trait
// ═══════════════════════════════════════════════════════════════

/// Envelope codec. Stateless, shared by every partition worker.
pub trait EnvelopeCodec: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<Batch, DecodeError>;

    /// Producer side (ingress tooling, tests).
    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, DecodeError>;
}

// ═══════════════════════════════════════════════════════════════
//  JSON envelope
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize)]
struct WireBatch {
    #[serde(rename = "aggregationID", default)]
    aggregation_id: String,
    #[serde(default)]
    messages: Vec<MessageRecord>,
    #[serde(rename = "lastSeq", default)]
    last_seq: u64,
    #[serde(rename = "triggerID", default, skip_serializing_if = "Option::is_none")]
    trigger_id: Option<String>,
    #[serde(rename = "operationID", default, skip_serializing_if = "String::is_empty")]
    operation_id: String,
}

pub struct JsonEnvelopeCodec {
    max_bytes: usize,
}

impl Default for JsonEnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

impl JsonEnvelopeCodec {
    /// `max_bytes == 0` disables the size check.
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl EnvelopeCodec for JsonEnvelopeCodec {
    fn decode(&self, raw: &[u8]) -> Result<Batch, DecodeError> {
        if raw.is_empty() {
            return Err(DecodeError::Empty);
        }
        if self.max_bytes > 0 && raw.len() > self.max_bytes {
            return Err(DecodeError::TooLarge { size: raw.len(), max: self.max_bytes });
        }

        let wire: WireBatch = serde_json::from_slice(raw)?;
        if wire.aggregation_id.is_empty() {
            return Err(DecodeError::MissingConversation);
        }

        Ok(Batch {
            conversation_key: wire.aggregation_id,
            messages: wire.messages,
            last_seq: wire.last_seq,
            trace_id: wire.operation_id,
            trigger_id: wire.trigger_id,
        })
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, DecodeError> {
        if batch.conversation_key.is_empty() {
            return Err(DecodeError::MissingConversation);
        }
        let wire = WireBatch {
            aggregation_id: batch.conversation_key.clone(),
            messages: batch.messages.clone(),
            last_seq: batch.last_seq,
            trigger_id: batch.trigger_id.clone(),
            operation_id: batch.trace_id.clone(),
        };
        Ok(serde_json::to_vec(&wire)?)
    }
}
