use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Conversation Key
// ════════════════════════════════════════════════════════════════

/// Opaque identity of a conversation: a user's inbox, a group's timeline, etc.
///
/// Messages for one key are appended and read in strictly increasing
/// sequence order.
pub type ConversationKey = String;

// ════════════════════════════════════════════════════════════════
//  Content Type
// ════════════════════════════════════════════════════════════════

/// Content type of a message, carried on the wire as an integer code.
///
/// Unknown codes survive a decode/encode cycle as `Other(code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum ContentType {
    Text,
    Picture,
    Voice,
    Video,
    File,
    AtText,
    Merger,
    Card,
    Location,
    Custom,
    Revoke,
    Typing,
    Quote,
    /// System notification asking for already-persisted messages to be deleted.
    DeleteMessageNotification,
    Other(i32),
}

impl ContentType {
    pub fn code(self) -> i32 {
        match self {
            ContentType::Text => 101,
            ContentType::Picture => 102,
            ContentType::Voice => 103,
            ContentType::Video => 104,
            ContentType::File => 105,
            ContentType::AtText => 106,
            ContentType::Merger => 107,
            ContentType::Card => 108,
            ContentType::Location => 109,
            ContentType::Custom => 110,
            ContentType::Revoke => 111,
            ContentType::Typing => 113,
            ContentType::Quote => 114,
            ContentType::DeleteMessageNotification => 2101,
            ContentType::Other(code) => code,
        }
    }
}

impl From<i32> for ContentType {
    fn from(code: i32) -> Self {
        match code {
            101 => ContentType::Text,
            102 => ContentType::Picture,
            103 => ContentType::Voice,
            104 => ContentType::Video,
            105 => ContentType::File,
            106 => ContentType::AtText,
            107 => ContentType::Merger,
            108 => ContentType::Card,
            109 => ContentType::Location,
            110 => ContentType::Custom,
            111 => ContentType::Revoke,
            113 => ContentType::Typing,
            114 => ContentType::Quote,
            2101 => ContentType::DeleteMessageNotification,
            other => ContentType::Other(other),
        }
    }
}

impl From<ContentType> for i32 {
    fn from(ct: ContentType) -> Self {
        ct.code()
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ════════════════════════════════════════════════════════════════
//  MessageRecord
// ════════════════════════════════════════════════════════════════

/// One chat message as persisted in the durable log.
///
/// Immutable once appended; the only mutation is removal through a
/// deletion directive or a conversation purge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub seq: u64,
    pub content_type: ContentType,
    #[serde(rename = "sendID", default)]
    pub send_id: String,
    #[serde(rename = "recvID", default)]
    pub recv_id: String,
    #[serde(rename = "groupID", default)]
    pub group_id: String,
    #[serde(rename = "clientMsgID", default)]
    pub client_msg_id: String,
    #[serde(rename = "serverMsgID", default)]
    pub server_msg_id: String,
    #[serde(default)]
    pub session_type: i32,
    /// Unix ms.
    #[serde(default)]
    pub send_time: i64,
    #[serde(with = "crate::util::base64_bytes", default)]
    pub content: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ex: String,
}

impl MessageRecord {
    /// Minimal record with the given sequence, type and payload.
    pub fn new(seq: u64, content_type: ContentType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            seq,
            content_type,
            send_id: String::new(),
            recv_id: String::new(),
            group_id: String::new(),
            client_msg_id: String::new(),
            server_msg_id: String::new(),
            session_type: 0,
            send_time: 0,
            content: content.into(),
            ex: String::new(),
        }
    }

    pub fn with_sender(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = send_id.into();
        self
    }
}

// ════════════════════════════════════════════════════════════════
//  Batch
// ════════════════════════════════════════════════════════════════

/// One broker record's worth of messages for a single conversation.
///
/// Never persisted itself. `last_seq` is the producer's claim about the
/// final message and is only checked for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub conversation_key: ConversationKey,
    pub messages: Vec<MessageRecord>,
    pub last_seq: u64,
    /// Correlation id carried inside the envelope (may be empty).
    pub trace_id: String,
    pub trigger_id: Option<String>,
}

impl Batch {
    pub fn new(conversation_key: impl Into<ConversationKey>, messages: Vec<MessageRecord>) -> Self {
        let last_seq = messages.last().map(|m| m.seq).unwrap_or(0);
        Self {
            conversation_key: conversation_key.into(),
            messages,
            last_seq,
            trace_id: String::new(),
            trigger_id: None,
        }
    }

    /// Sequence of the final message, if any.
    pub fn tail_seq(&self) -> Option<u64> {
        self.messages.last().map(|m| m.seq)
    }

    /// `true` when `last_seq` agrees with the final message (or the batch is empty).
    pub fn last_seq_matches(&self) -> bool {
        match self.tail_seq() {
            Some(seq) => seq == self.last_seq,
            None => true,
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  DeletionDirective
// ════════════════════════════════════════════════════════════════

/// Instruction recovered from a deletion notification: remove `seqs`
/// from the log of `user_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionDirective {
    pub user_id: String,
    pub seqs: BTreeSet<u64>,
}

impl DeletionDirective {
    pub fn new(user_id: impl Into<String>, seqs: impl IntoIterator<Item = u64>) -> Self {
        Self {
            user_id: user_id.into(),
            seqs: seqs.into_iter().collect(),
        }
    }

    pub fn seq_list(&self) -> Vec<u64> {
        self.seqs.iter().copied().collect()
    }
}

// ════════════════════════════════════════════════════════════════
//  SeqRange
// ════════════════════════════════════════════════════════════════

/// Read-path selector for the durable log. Bounds are inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqRange {
    pub from: Option<u64>,
    pub to: Option<u64>,
    /// Keep the first N matching records.
    pub limit: Option<usize>,
}

impl SeqRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: u64, to: u64) -> Self {
        Self { from: Some(from), to: Some(to), limit: None }
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.from.is_none_or(|from| seq >= from) && self.to.is_none_or(|to| seq <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_codes_round_trip() {
        assert_eq!(ContentType::from(2101), ContentType::DeleteMessageNotification);
        assert_eq!(ContentType::from(101), ContentType::Text);
        assert_eq!(ContentType::from(4242), ContentType::Other(4242));
        assert_eq!(i32::from(ContentType::Other(4242)), 4242);
    }

    #[test]
    fn message_record_json_shape() {
        let msg = MessageRecord::new(5, ContentType::Text, b"hi".to_vec()).with_sender("u1");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["seq"], 5);
        assert_eq!(json["contentType"], 101);
        assert_eq!(json["sendID"], "u1");
        assert_eq!(json["content"], "aGk=");
        assert!(json.get("ex").is_none());

        let back: MessageRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn batch_last_seq_check() {
        let mut batch = Batch::new(
            "conv1",
            vec![
                MessageRecord::new(5, ContentType::Text, b"a".to_vec()),
                MessageRecord::new(6, ContentType::Text, b"b".to_vec()),
            ],
        );
        assert_eq!(batch.last_seq, 6);
        assert!(batch.last_seq_matches());
        batch.last_seq = 9;
        assert!(!batch.last_seq_matches());
        assert!(Batch::new("empty", Vec::new()).last_seq_matches());
    }

    #[test]
    fn seq_range_bounds_are_inclusive() {
        let range = SeqRange::between(3, 7);
        assert!(range.contains(3));
        assert!(range.contains(7));
        assert!(!range.contains(8));
        assert!(SeqRange::all().contains(u64::MAX));
    }
}
