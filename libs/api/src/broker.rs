use std::future::Future;
use std::pin::Pin;

use crate::BackendError;

/// Header names a producer may use to carry the trace identifier.
pub const TRACE_HEADERS: [&str; 2] = ["operationID", "trace_id"];

// ════════════════════════════════════════════════════════════════
//  BrokerRecord
// ════════════════════════════════════════════════════════════════

/// One record as delivered by the broker for a partition claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl BrokerRecord {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Trace id from the producer headers, if any.
    pub fn trace_header(&self) -> Option<&str> {
        TRACE_HEADERS
            .iter()
            .filter_map(|name| self.header(name))
            .find(|v| !v.is_empty())
    }

    /// Fallback identifier derived from the broker position.
    pub fn position_id(&self) -> String {
        format!("{}-{}-{}", self.topic, self.partition, self.offset)
    }

    /// Trace id for log correlation: producer header, then `envelope_id`
    /// (when non-empty), then the broker position.
    pub fn resolve_trace_id(&self, envelope_id: &str) -> String {
        match self.trace_header() {
            Some(t) => t.to_string(),
            None if !envelope_id.is_empty() => envelope_id.to_string(),
            None => self.position_id(),
        }
    }

    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

// ════════════════════════════════════════════════════════════════
//  PartitionClaim
// ════════════════════════════════════════════════════════════════

/// Exclusive claim on one partition for one consumer-group member.
///
/// Records arrive in partition order. `mark` advances the group's offset
/// past `record`; the next claim on this partition starts after the last
/// marked record. `rewind` moves delivery back to that offset without giving
/// the claim up.
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> u32;

    /// Next record. `None` = claim revoked or broker closed.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerRecord>> + Send + '_>>;

    /// Acknowledge `record`.
    fn mark<'a>(
        &'a mut self,
        record: &'a BrokerRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;

    /// Redeliver everything after the last marked record. Returns the offset
    /// `recv` continues from.
    fn rewind(&mut self) -> Pin<Box<dyn Future<Output = Result<u64, BackendError>> + Send + '_>>;
}
