use std::future::Future;
use std::sync::Arc;

use msg_api::{BackendError, Batch, BrokerRecord, ConversationKey, MessageCache, MessageStore};
use msg_control::ControlInterpreter;
use msg_envelope::EnvelopeCodec;

use crate::config::{AckPolicy, IngestConfig, RetryPolicy};
use crate::error::IngestError;

// ═══════════════════════════════════════════════════════════════
//  Outcome
// ═══════════════════════════════════════════════════════════════

/// What the Persisting stage did with the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    /// The record never decoded.
    NotAttempted,
    /// Upserted this many messages (0 for an empty batch).
    Appended(usize),
    Failed,
}

/// Result of one deletion directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub user_id: String,
    pub requested: usize,
    /// `None` when the delete itself failed.
    pub unmatched: Option<usize>,
}

/// Everything that happened to one broker record.
#[derive(Debug)]
pub struct RecordOutcome {
    pub trace_id: String,
    pub conversation: Option<ConversationKey>,
    pub append: AppendStatus,
    pub invalidated: bool,
    pub deletions: Vec<DeletionReport>,
    pub skipped_controls: usize,
    /// Logged stage failures, in stage order.
    pub errors: Vec<IngestError>,
    /// Whether the worker may acknowledge the record under the configured policy.
    pub ack: bool,
}

impl RecordOutcome {
    fn new(trace_id: String) -> Self {
        Self {
            trace_id,
            conversation: None,
            append: AppendStatus::NotAttempted,
            invalidated: false,
            deletions: Vec::new(),
            skipped_controls: 0,
            errors: Vec::new(),
            ack: true,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Coordinator
// ═══════════════════════════════════════════════════════════════

/// Runs one broker record through
/// Decoding → Persisting → Invalidating → Interpreting → Deleting.
///
/// Shared by every partition worker; holds no per-record state.
pub struct IngestCoordinator {
    codec: Arc<dyn EnvelopeCodec>,
    store: Arc<dyn MessageStore>,
    cache: Arc<dyn MessageCache>,
    interpreter: ControlInterpreter,
    config: IngestConfig,
}

impl IngestCoordinator {
    pub fn new(
        codec: Arc<dyn EnvelopeCodec>,
        store: Arc<dyn MessageStore>,
        cache: Arc<dyn MessageCache>,
        config: IngestConfig,
    ) -> Self {
        Self {
            codec,
            store,
            cache,
            interpreter: ControlInterpreter::new(),
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Process one record. Never fails: stage errors are logged and
    /// collected in the returned [`RecordOutcome`].
    pub async fn process_record(&self, record: &BrokerRecord) -> RecordOutcome {
        // ── Decoding ──
        let mut batch = match self.codec.decode(&record.value) {
            Ok(batch) => batch,
            Err(e) => {
                let trace_id = record.resolve_trace_id("");
                tracing::error!(
                    trace_id = %trace_id,
                    partition = record.partition,
                    offset = record.offset,
                    key = %record.key_lossy(),
                    error = %e,
                    "undecodable record, skipping"
                );
                let mut outcome = RecordOutcome::new(trace_id);
                outcome.errors.push(IngestError::Decode(e));
                return outcome;
            }
        };

        let trace_id = record.resolve_trace_id(&batch.trace_id);
        batch.trace_id = trace_id.clone();

        let mut outcome = RecordOutcome::new(trace_id);
        outcome.conversation = Some(batch.conversation_key.clone());

        if !batch.last_seq_matches() {
            tracing::warn!(
                trace_id = %batch.trace_id,
                conversation = %batch.conversation_key,
                last_seq = batch.last_seq,
                tail_seq = ?batch.tail_seq(),
                "last_seq does not match final message"
            );
        }

        tracing::debug!(
            trace_id = %batch.trace_id,
            conversation = %batch.conversation_key,
            partition = record.partition,
            offset = record.offset,
            messages = batch.messages.len(),
            "batch decoded"
        );

        // ── Persisting + Invalidating ──
        self.persist(&batch, &mut outcome).await;

        // ── Interpreting + Deleting ──
        // Runs whatever the append outcome was.
        self.apply_controls(&batch, &mut outcome).await;

        outcome.ack = match self.config.ack {
            AckPolicy::AfterAttempt => true,
            AckPolicy::AfterPersist => outcome.append != AppendStatus::Failed,
        };
        outcome
    }

    async fn persist(&self, batch: &Batch, outcome: &mut RecordOutcome) {
        if batch.messages.is_empty() {
            outcome.append = AppendStatus::Appended(0);
            return;
        }

        let key = batch.conversation_key.as_str();
        let appended = with_retry(&self.config.append_retry, "append_batch", &batch.trace_id, || {
            self.store.append_batch(key, &batch.messages, batch.last_seq)
        })
        .await;

        if let Err(e) = appended {
            tracing::error!(
                trace_id = %batch.trace_id,
                conversation = %key,
                messages = batch.messages.len(),
                last_seq = batch.last_seq,
                error = %e,
                "batch append failed"
            );
            outcome.append = AppendStatus::Failed;
            outcome.errors.push(IngestError::Store { op: "append_batch", source: e });
            return;
        }
        outcome.append = AppendStatus::Appended(batch.messages.len());

        match self.cache.invalidate(key, &batch.messages).await {
            Ok(()) => outcome.invalidated = true,
            Err(e) => {
                tracing::error!(
                    trace_id = %batch.trace_id,
                    conversation = %key,
                    error = %e,
                    "cache invalidation failed"
                );
                outcome.errors.push(IngestError::Cache(e));
            }
        }
    }

    async fn apply_controls(&self, batch: &Batch, outcome: &mut RecordOutcome) {
        let interpretation = self.interpreter.interpret(batch);
        outcome.skipped_controls = interpretation.skipped.len();

        for directive in interpretation.deletions() {
            let seqs = directive.seq_list();
            let user_id = directive.user_id.as_str();
            let result = with_retry(&self.config.delete_retry, "delete_by_sequences", &batch.trace_id, || {
                self.store.delete_by_sequences(user_id, &seqs)
            })
            .await;

            match result {
                Ok(unmatched) => {
                    tracing::info!(
                        trace_id = %batch.trace_id,
                        conversation = %batch.conversation_key,
                        user_id,
                        requested = seqs.len(),
                        unmatched,
                        "messages deleted"
                    );
                    outcome.deletions.push(DeletionReport {
                        user_id: user_id.to_string(),
                        requested: seqs.len(),
                        unmatched: Some(unmatched),
                    });
                }
                Err(e) => {
                    tracing::error!(
                        trace_id = %batch.trace_id,
                        conversation = %batch.conversation_key,
                        user_id,
                        seqs = ?seqs,
                        error = %e,
                        "delete by sequences failed"
                    );
                    outcome.deletions.push(DeletionReport {
                        user_id: user_id.to_string(),
                        requested: seqs.len(),
                        unmatched: None,
                    });
                    outcome.errors.push(IngestError::Store { op: "delete_by_sequences", source: e });
                }
            }
        }

        outcome
            .errors
            .extend(interpretation.skipped.into_iter().map(IngestError::ControlUnwrap));
    }
}

/// Run `op` under `policy`. Only transient errors are retried.
async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    trace_id: &str,
    mut f: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    trace_id,
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use msg_api::{ContentType, MessageRecord, SeqRange};
    use msg_control::{DeleteMessageTips, NotificationEnvelope};
    use msg_envelope::JsonEnvelopeCodec;
    use std::pin::Pin;

    /// Store that fails the first `failures` appends and the first
    /// `delete_failures` deletes with an I/O error. `reject_deletes` makes
    /// every delete fail with a non-transient error.
    #[derive(Default)]
    struct FlakyStore {
        failures: AtomicU32,
        appends: AtomicU32,
        appended: Mutex<Vec<u64>>,
        delete_failures: AtomicU32,
        reject_deletes: AtomicBool,
        deletes: AtomicU32,
    }

    impl MessageStore for FlakyStore {
        fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }

        fn append_batch<'a>(
            &'a self,
            _key: &'a str,
            messages: &'a [MessageRecord],
            _last_seq: u64,
        ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
            Box::pin(async move {
                self.appends.fetch_add(1, Ordering::SeqCst);
                if self.failures.load(Ordering::SeqCst) > 0 {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(BackendError::io("disk unavailable"));
                }
                self.appended.lock().unwrap().extend(messages.iter().map(|m| m.seq));
                Ok(())
            })
        }

        fn delete_by_sequences<'a>(
            &'a self,
            _user_id: &'a str,
            seqs: &'a [u64],
        ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
            Box::pin(async move {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                if self.reject_deletes.load(Ordering::SeqCst) {
                    return Err(BackendError::new("user log is read-only"));
                }
                if self.delete_failures.load(Ordering::SeqCst) > 0 {
                    self.delete_failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(BackendError::io("connection reset"));
                }
                // Nothing is stored here, so every seq is unmatched.
                Ok(seqs.len())
            })
        }

        fn read<'a>(
            &'a self,
            _key: &'a str,
            _range: SeqRange,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageRecord>, BackendError>> + Send + 'a>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn purge<'a>(
            &'a self,
            _key: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
            Box::pin(async { Ok(0) })
        }

        fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Default)]
    struct NullCache {
        invalidations: AtomicU32,
        failing: AtomicBool,
    }

    impl MessageCache for NullCache {
        fn get<'a>(
            &'a self,
            _key: &'a str,
            _seq: u64,
        ) -> Pin<Box<dyn Future<Output = Result<Option<MessageRecord>, BackendError>> + Send + 'a>> {
            Box::pin(async { Ok(None) })
        }

        fn set<'a>(
            &'a self,
            _key: &'a str,
            _messages: &'a [MessageRecord],
        ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }

        fn invalidate<'a>(
            &'a self,
            _key: &'a str,
            _messages: &'a [MessageRecord],
        ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
            Box::pin(async move {
                self.invalidations.fetch_add(1, Ordering::SeqCst);
                if self.failing.load(Ordering::SeqCst) {
                    return Err(BackendError::io("cache unreachable"));
                }
                Ok(())
            })
        }
    }

    fn record(value: Vec<u8>, headers: Vec<(String, String)>) -> BrokerRecord {
        BrokerRecord {
            topic: "ws2ms_chat".into(),
            partition: 0,
            offset: 9,
            key: b"conv1".to_vec(),
            value,
            headers,
        }
    }

    fn encoded(batch: &Batch) -> Vec<u8> {
        JsonEnvelopeCodec::default().encode(batch).unwrap()
    }

    fn delete_notification(seq: u64, user_id: &str, seqs: &[u64]) -> MessageRecord {
        let content = NotificationEnvelope::wrap(&DeleteMessageTips {
            user_id: user_id.into(),
            seqs: seqs.to_vec(),
        })
        .unwrap();
        MessageRecord::new(seq, ContentType::DeleteMessageNotification, content)
    }

    fn coordinator(
        store: Arc<FlakyStore>,
        cache: Arc<NullCache>,
        config: IngestConfig,
    ) -> IngestCoordinator {
        IngestCoordinator::new(Arc::new(JsonEnvelopeCodec::default()), store, cache, config)
    }

    #[tokio::test]
    async fn trace_id_resolution_order() {
        let store = Arc::new(FlakyStore::default());
        let cache = Arc::new(NullCache::default());
        let coord = coordinator(store, cache, IngestConfig::default());

        let mut batch = Batch::new("conv1", vec![MessageRecord::new(1, ContentType::Text, "a")]);
        batch.trace_id = "from-envelope".into();
        let value = encoded(&batch);

        let with_header = record(value.clone(), vec![("operationID".into(), "from-header".into())]);
        assert_eq!(coord.process_record(&with_header).await.trace_id, "from-header");

        let without = record(value, Vec::new());
        assert_eq!(coord.process_record(&without).await.trace_id, "from-envelope");

        let garbage = record(b"nope".to_vec(), Vec::new());
        assert_eq!(coord.process_record(&garbage).await.trace_id, "ws2ms_chat-0-9");
    }

    #[tokio::test]
    async fn transient_append_failure_is_retried() {
        let store = Arc::new(FlakyStore::default());
        store.failures.store(2, Ordering::SeqCst);
        let cache = Arc::new(NullCache::default());
        let config = IngestConfig {
            append_retry: RetryPolicy::attempts(3, 1),
            ..IngestConfig::default()
        };
        let coord = coordinator(store.clone(), cache.clone(), config);

        let batch = Batch::new("conv1", vec![MessageRecord::new(5, ContentType::Text, "a")]);
        let outcome = coord.process_record(&record(encoded(&batch), Vec::new())).await;

        assert_eq!(outcome.append, AppendStatus::Appended(1));
        assert!(outcome.is_clean());
        assert_eq!(store.appends.load(Ordering::SeqCst), 3);
        assert_eq!(cache.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn after_persist_refuses_ack_on_append_failure() {
        let store = Arc::new(FlakyStore::default());
        store.failures.store(1, Ordering::SeqCst);
        let cache = Arc::new(NullCache::default());
        let config = IngestConfig { ack: AckPolicy::AfterPersist, ..IngestConfig::default() };
        let coord = coordinator(store, cache.clone(), config);

        let batch = Batch::new("conv1", vec![MessageRecord::new(5, ContentType::Text, "a")]);
        let outcome = coord.process_record(&record(encoded(&batch), Vec::new())).await;

        assert_eq!(outcome.append, AppendStatus::Failed);
        assert!(!outcome.ack);
        assert_eq!(cache.invalidations.load(Ordering::SeqCst), 0);

        // Undecodable input is still acked under the same policy.
        let garbage = coord.process_record(&record(b"{".to_vec(), Vec::new())).await;
        assert!(garbage.ack);
        assert!(garbage.errors[0].is_decode());
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop_append() {
        let store = Arc::new(FlakyStore::default());
        let cache = Arc::new(NullCache::default());
        let coord = coordinator(store.clone(), cache.clone(), IngestConfig::default());

        let outcome = coord
            .process_record(&record(encoded(&Batch::new("conv1", Vec::new())), Vec::new()))
            .await;
        assert_eq!(outcome.append, AppendStatus::Appended(0));
        assert_eq!(store.appends.load(Ordering::SeqCst), 0);
        assert_eq!(cache.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_failure_is_logged_and_record_completes() {
        let store = Arc::new(FlakyStore::default());
        let cache = Arc::new(NullCache::default());
        cache.failing.store(true, Ordering::SeqCst);
        let coord = coordinator(store.clone(), cache.clone(), IngestConfig::default());

        let batch = Batch::new(
            "u1",
            vec![MessageRecord::new(5, ContentType::Text, "a"), delete_notification(6, "u1", &[3])],
        );
        let outcome = coord.process_record(&record(encoded(&batch), Vec::new())).await;

        assert_eq!(outcome.append, AppendStatus::Appended(2));
        assert!(!outcome.invalidated);
        assert_eq!(cache.invalidations.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.errors.as_slice(), [IngestError::Cache(_)]));
        // Deletion still ran and the record may be acked.
        assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.deletions[0].unmatched, Some(1));
        assert!(outcome.ack);
    }

    #[tokio::test]
    async fn transient_delete_failure_is_retried() {
        let store = Arc::new(FlakyStore::default());
        store.delete_failures.store(2, Ordering::SeqCst);
        let config = IngestConfig {
            delete_retry: RetryPolicy::attempts(3, 1),
            ..IngestConfig::default()
        };
        let coord = coordinator(store.clone(), Arc::new(NullCache::default()), config);

        let batch = Batch::new("u1", vec![delete_notification(9, "u1", &[3, 7])]);
        let outcome = coord.process_record(&record(encoded(&batch), Vec::new())).await;

        assert_eq!(store.deletes.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.deletions[0].unmatched, Some(2));
        assert!(outcome.is_clean());
    }

    #[tokio::test]
    async fn permanent_delete_failure_is_not_retried() {
        let store = Arc::new(FlakyStore::default());
        store.reject_deletes.store(true, Ordering::SeqCst);
        let config = IngestConfig {
            delete_retry: RetryPolicy::attempts(3, 1),
            ..IngestConfig::default()
        };
        let coord = coordinator(store.clone(), Arc::new(NullCache::default()), config);

        let batch = Batch::new("u1", vec![delete_notification(9, "u1", &[3])]);
        let outcome = coord.process_record(&record(encoded(&batch), Vec::new())).await;

        assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.deletions[0].unmatched, None);
        assert!(matches!(
            outcome.errors.as_slice(),
            [IngestError::Store { op: "delete_by_sequences", .. }]
        ));
        assert!(outcome.ack);
    }

    #[tokio::test]
    async fn default_delete_policy_makes_one_attempt() {
        let store = Arc::new(FlakyStore::default());
        store.delete_failures.store(1, Ordering::SeqCst);
        let coord = coordinator(store.clone(), Arc::new(NullCache::default()), IngestConfig::default());

        let batch = Batch::new("u1", vec![delete_notification(9, "u1", &[3])]);
        let outcome = coord.process_record(&record(encoded(&batch), Vec::new())).await;

        assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.deletions[0].unmatched, None);
        assert!(outcome.ack);
    }
}
