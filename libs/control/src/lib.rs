//! Control-message interpreter.
//!
//! Control messages are ordinary [`MessageRecord`]s whose content type marks
//! them as system directives. Their content is a two-layer envelope: a generic
//! notification wrapper carrying an opaque `detail`, and a kind-specific detail
//! payload inside it. Decoding happens in two explicit steps:
//!
//! 1. content type → [`ControlKind`], content → [`NotificationEnvelope`];
//! 2. `match kind` → typed detail decoder → [`ControlDirective`].

mod envelope;

use msg_api::{Batch, ContentType, DeletionDirective, MessageRecord};

pub use envelope::{DeleteMessageTips, NotificationEnvelope};

// ═══════════════════════════════════════════════════════════════
//  Kinds and directives
// ═══════════════════════════════════════════════════════════════

/// Recognized control message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    DeleteMessages,
}

impl ControlKind {
    pub fn from_content_type(ct: ContentType) -> Option<Self> {
        match ct {
            ContentType::DeleteMessageNotification => Some(ControlKind::DeleteMessages),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::DeleteMessages => f.write_str("delete_messages"),
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDirective {
    Delete(DeletionDirective),
}

// ═══════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════

/// A control message that could not be unwrapped. Only that one message
/// is skipped.
#[derive(Debug, thiserror::Error)]
pub enum ControlUnwrapError {
    #[error("seq {seq}: malformed notification envelope: {source}")]
    Envelope { seq: u64, source: serde_json::Error },

    #[error("seq {seq}: malformed {kind} detail: {reason}")]
    Detail { seq: u64, kind: ControlKind, reason: String },
}

impl ControlUnwrapError {
    pub fn seq(&self) -> u64 {
        match self {
            ControlUnwrapError::Envelope { seq, .. } | ControlUnwrapError::Detail { seq, .. } => *seq,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Interpreter
// ═══════════════════════════════════════════════════════════════

/// Directives recovered from one batch plus the control messages that were skipped.
#[derive(Debug, Default)]
pub struct Interpretation {
    pub directives: Vec<ControlDirective>,
    pub skipped: Vec<ControlUnwrapError>,
}

impl Interpretation {
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty() && self.skipped.is_empty()
    }

    pub fn deletions(&self) -> impl Iterator<Item = &DeletionDirective> {
        self.directives.iter().map(|d| match d {
            ControlDirective::Delete(del) => del,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ControlInterpreter;

impl ControlInterpreter {
    pub fn new() -> Self {
        Self
    }

    /// Scan `batch` for control messages. Never fails as a whole: each
    /// malformed control message is logged and recorded in `skipped`.
    pub fn interpret(&self, batch: &Batch) -> Interpretation {
        let mut out = Interpretation::default();
        for msg in &batch.messages {
            let Some(kind) = ControlKind::from_content_type(msg.content_type) else {
                continue;
            };
            match self.unwrap_message(kind, msg) {
                Ok(directive) => out.directives.push(directive),
                Err(e) => {
                    tracing::error!(
                        conversation = %batch.conversation_key,
                        trace_id = %batch.trace_id,
                        seq = msg.seq,
                        send_id = %msg.send_id,
                        %kind,
                        error = %e,
                        "control message skipped"
                    );
                    out.skipped.push(e);
                }
            }
        }
        out
    }

    /// Two-step unwrap of a single control message.
    pub fn unwrap_message(
        &self,
        kind: ControlKind,
        msg: &MessageRecord,
    ) -> Result<ControlDirective, ControlUnwrapError> {
        let envelope = NotificationEnvelope::decode(&msg.content)
            .map_err(|source| ControlUnwrapError::Envelope { seq: msg.seq, source })?;

        let detail = |reason: String| ControlUnwrapError::Detail { seq: msg.seq, kind, reason };

        match kind {
            ControlKind::DeleteMessages => {
                let tips = DeleteMessageTips::decode(&envelope.detail)
                    .map_err(|e| detail(e.to_string()))?;
                if tips.user_id.is_empty() {
                    return Err(detail("empty userID".into()));
                }
                if tips.seqs.is_empty() {
                    return Err(detail("no seqs".into()));
                }
                Ok(ControlDirective::Delete(DeletionDirective::new(tips.user_id, tips.seqs)))
            }
        }
    }
}
