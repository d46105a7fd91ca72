use std::future::Future;
use std::pin::Pin;

use crate::{BackendError, MessageRecord, SeqRange};

// ════════════════════════════════════════════════════════════════
//  Durable Log Store
// ════════════════════════════════════════════════════════════════

/// Authoritative, sequence-ordered message log keyed by conversation.
///
/// Implementations: in-memory (`storage-memory`), JSONL files (`storage-file`).
/// Handles are shared across partition workers, so every method takes `&self`.
pub trait MessageStore: Send + Sync {
    /// Prepare backing resources (directories, tables).
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>>;

    /// Append a batch for `key`. A record whose seq is already present is
    /// replaced, never duplicated, so broker redelivery is harmless.
    fn append_batch<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
        last_seq: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;

    /// Remove `seqs` from the log of `user_id`. Returns how many of them
    /// were not present; absent seqs are not an error.
    fn delete_by_sequences<'a>(
        &'a self,
        user_id: &'a str,
        seqs: &'a [u64],
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>>;

    /// Records of `key` inside `range`, ascending by seq.
    fn read<'a>(
        &'a self,
        key: &'a str,
        range: SeqRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageRecord>, BackendError>> + Send + 'a>>;

    /// Drop the whole conversation. Returns the number of removed records.
    fn purge<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>>;

    /// Flush buffers (graceful shutdown).
    fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>>;
}

// ════════════════════════════════════════════════════════════════
//  Hot Cache
// ════════════════════════════════════════════════════════════════

/// Non-authoritative mirror of recent messages. A miss or a stale entry is
/// always repaired by reading through to the [`MessageStore`].
pub trait MessageCache: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
        seq: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MessageRecord>, BackendError>> + Send + 'a>>;

    /// Populate entries (send path).
    fn set<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;

    /// Drop the entries for `messages` once the durable log owns them.
    fn invalidate<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>>;
}
