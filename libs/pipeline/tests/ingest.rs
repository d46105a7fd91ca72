//! End-to-end ingestion: in-process broker → partition worker → stores.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use cache_memory::MemoryMessageCache;
use msg_api::{
    BackendError, Batch, ContentType, MessageCache, MessageRecord, MessageStore, SeqRange,
};
use msg_broker::MemoryBroker;
use msg_control::{DeleteMessageTips, NotificationEnvelope};
use msg_envelope::{EnvelopeCodec, JsonEnvelopeCodec};
use pipeline::{
    AckPolicy, AppendStatus, IngestConfig, IngestCoordinator, WorkerExit, shutdown,
    spawn_consumer_group, spawn_partition_worker,
};
use storage_memory::MemoryMessageStore;

// ═══════════════════════════════════════════════════════════════
//  Test doubles
// ═══════════════════════════════════════════════════════════════

/// Memory store with failure switches and an optional gate on append.
/// `failing` rejects every append; `fail_next` rejects that many.
#[derive(Default)]
struct ControlledStore {
    inner: MemoryMessageStore,
    failing: AtomicBool,
    fail_next: AtomicU32,
    appends: AtomicU32,
    gate: Option<(Notify, Notify)>,
}

impl ControlledStore {
    fn gated() -> Self {
        Self { gate: Some((Notify::new(), Notify::new())), ..Self::default() }
    }

    /// Wait until an append is blocked on the gate.
    async fn entered(&self) {
        if let Some((entered, _)) = &self.gate {
            entered.notified().await;
        }
    }

    fn release(&self) {
        if let Some((_, release)) = &self.gate {
            release.notify_one();
        }
    }
}

impl MessageStore for ControlledStore {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        self.inner.init()
    }

    fn append_batch<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
        last_seq: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            self.appends.fetch_add(1, Ordering::SeqCst);
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(BackendError::new("store rejected batch"));
            }
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(BackendError::new("store rejected batch"));
            }
            self.inner.append_batch(key, messages, last_seq).await
        })
    }

    fn delete_by_sequences<'a>(
        &'a self,
        user_id: &'a str,
        seqs: &'a [u64],
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
        self.inner.delete_by_sequences(user_id, seqs)
    }

    fn read<'a>(
        &'a self,
        key: &'a str,
        range: SeqRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageRecord>, BackendError>> + Send + 'a>> {
        self.inner.read(key, range)
    }

    fn purge<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
        self.inner.purge(key)
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        self.inner.flush()
    }
}

/// Cache that counts invalidated messages and delegates to the memory cache.
#[derive(Default)]
struct CountingCache {
    inner: MemoryMessageCache,
    invalidated: AtomicU32,
    calls: AtomicU32,
}

impl MessageCache for CountingCache {
    fn get<'a>(
        &'a self,
        key: &'a str,
        seq: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MessageRecord>, BackendError>> + Send + 'a>> {
        self.inner.get(key, seq)
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        self.inner.set(key, messages)
    }

    fn invalidate<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invalidated.fetch_add(messages.len() as u32, Ordering::SeqCst);
        self.inner.invalidate(key, messages)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════

struct Harness {
    broker: Arc<MemoryBroker>,
    store: Arc<ControlledStore>,
    cache: Arc<CountingCache>,
    coordinator: Arc<IngestCoordinator>,
}

fn harness(store: ControlledStore, config: IngestConfig) -> Harness {
    harness_with(store, config, 1)
}

fn harness_with(store: ControlledStore, config: IngestConfig, partitions: u32) -> Harness {
    let store = Arc::new(store);
    let cache = Arc::new(CountingCache::default());
    let coordinator = Arc::new(IngestCoordinator::new(
        Arc::new(JsonEnvelopeCodec::default()),
        store.clone(),
        cache.clone(),
        config,
    ));
    Harness {
        broker: Arc::new(MemoryBroker::new("ws2ms_chat", partitions).unwrap()),
        store,
        cache,
        coordinator,
    }
}

fn text(seq: u64) -> MessageRecord {
    MessageRecord::new(seq, ContentType::Text, format!("message {seq}")).with_sender("u1")
}

fn delete_notification(seq: u64, user_id: &str, seqs: &[u64]) -> MessageRecord {
    let content = NotificationEnvelope::wrap(&DeleteMessageTips {
        user_id: user_id.into(),
        seqs: seqs.to_vec(),
    })
    .unwrap();
    MessageRecord::new(seq, ContentType::DeleteMessageNotification, content)
}

async fn produce(broker: &MemoryBroker, batch: &Batch) {
    let value = JsonEnvelopeCodec::default().encode(batch).unwrap();
    broker
        .produce(batch.conversation_key.as_bytes(), value, Vec::new())
        .await
        .unwrap();
}

async fn seqs(store: &dyn MessageStore, key: &str) -> Vec<u64> {
    store
        .read(key, SeqRange::all())
        .await
        .unwrap()
        .iter()
        .map(|m| m.seq)
        .collect()
}

// ═══════════════════════════════════════════════════════════════
//  Scenarios
// ═══════════════════════════════════════════════════════════════

#[tokio::test]
async fn batch_is_persisted_cache_invalidated_and_acked() {
    let h = harness(ControlledStore::default(), IngestConfig::default());
    let batch = Batch::new("conv1", vec![text(5), text(6)]);
    h.cache.set("conv1", &batch.messages).await.unwrap();
    produce(&h.broker, &batch).await;
    h.broker.close();

    let mut claims = h.broker.join("transfer");
    let report = spawn_partition_worker(claims.remove(0), h.coordinator.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.exit, WorkerExit::Drained);
    assert_eq!(report.acked, 1);
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![5, 6]);
    assert!(h.cache.get("conv1", 5).await.unwrap().is_none());
    assert!(h.cache.get("conv1", 6).await.unwrap().is_none());
    assert_eq!(h.cache.invalidated.load(Ordering::SeqCst), 2);
    assert_eq!(h.broker.committed("transfer", 0), Some(1));
}

#[tokio::test]
async fn redelivered_batch_is_not_duplicated() {
    let h = harness(ControlledStore::default(), IngestConfig::default());
    let batch = Batch::new("conv1", vec![text(5), text(6)]);
    produce(&h.broker, &batch).await;
    produce(&h.broker, &batch).await;
    h.broker.close();

    let handles = spawn_consumer_group(h.broker.join("transfer"), h.coordinator.clone(), &CancellationToken::new());
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![5, 6]);
    assert_eq!(h.store.appends.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn delete_notification_removes_seqs_and_counts_unmatched() {
    let h = harness(ControlledStore::default(), IngestConfig::default());
    h.store.append_batch("u1", &[text(3)], 3).await.unwrap();

    let batch = Batch::new("u1", vec![delete_notification(8, "u1", &[3, 7])]);
    let value = JsonEnvelopeCodec::default().encode(&batch).unwrap();
    let (partition, offset) = h.broker.produce(b"u1", value, Vec::new()).await.unwrap();

    let mut claim = h.broker.claim("transfer", partition).unwrap();
    let record = msg_api::PartitionClaim::recv(&mut claim).await.unwrap();
    assert_eq!(record.offset, offset);

    let outcome = h.coordinator.process_record(&record).await;
    assert_eq!(outcome.deletions.len(), 1);
    assert_eq!(outcome.deletions[0].user_id, "u1");
    assert_eq!(outcome.deletions[0].unmatched, Some(1));
    assert!(outcome.is_clean());
    // The notification itself is appended; seq 3 is gone.
    assert_eq!(seqs(h.store.as_ref(), "u1").await, vec![8]);
}

#[tokio::test]
async fn malformed_control_message_is_skipped_rest_processed() {
    let h = harness(ControlledStore::default(), IngestConfig::default());
    h.store.append_batch("u2", &[text(1), text(2)], 2).await.unwrap();

    let broken = MessageRecord::new(11, ContentType::DeleteMessageNotification, b"{oops".to_vec());
    let batch = Batch::new("conv9", vec![text(10), broken, delete_notification(12, "u2", &[1])]);
    produce(&h.broker, &batch).await;

    let mut claim = h.broker.claim("transfer", 0).unwrap();
    let record = msg_api::PartitionClaim::recv(&mut claim).await.unwrap();
    let outcome = h.coordinator.process_record(&record).await;

    assert_eq!(outcome.append, AppendStatus::Appended(3));
    assert_eq!(outcome.skipped_controls, 1);
    assert_eq!(outcome.deletions[0].unmatched, Some(0));
    assert_eq!(seqs(h.store.as_ref(), "conv9").await, vec![10, 11, 12]);
    assert_eq!(seqs(h.store.as_ref(), "u2").await, vec![2]);
    assert!(outcome.ack);
}

#[tokio::test]
async fn failed_append_skips_invalidation_but_still_deletes() {
    let store = ControlledStore::default();
    store.inner.append_batch("u1", &[text(4)], 4).await.unwrap();
    store.failing.store(true, Ordering::SeqCst);
    let h = harness(store, IngestConfig::default());

    let batch = Batch::new("u1", vec![text(20), delete_notification(21, "u1", &[4])]);
    produce(&h.broker, &batch).await;
    h.broker.close();

    let claim = h.broker.claim("transfer", 0).unwrap();
    let report = spawn_partition_worker(claim, h.coordinator.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(h.cache.calls.load(Ordering::SeqCst), 0);
    assert!(seqs(h.store.as_ref(), "u1").await.is_empty());
    // Default policy acks regardless.
    assert_eq!(report.acked, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.broker.committed("transfer", 0), Some(1));
}

#[tokio::test]
async fn undecodable_record_is_acked_and_next_processed() {
    let h = harness(ControlledStore::default(), IngestConfig::default());
    h.broker.produce(b"conv1", b"\x00garbage".to_vec(), Vec::new()).await.unwrap();
    h.broker.produce(b"conv1", Vec::new(), Vec::new()).await.unwrap();
    produce(&h.broker, &Batch::new("conv1", vec![text(1)])).await;
    h.broker.close();

    let claim = h.broker.claim("transfer", 0).unwrap();
    let report = spawn_partition_worker(claim, h.coordinator.clone(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.acked, 3);
    assert_eq!(report.failed, 2);
    assert_eq!(h.broker.committed("transfer", 0), Some(3));
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![1]);
}

fn after_persist(backoff_ms: u64) -> IngestConfig {
    IngestConfig {
        ack: AckPolicy::AfterPersist,
        redelivery_backoff_ms: backoff_ms,
        redelivery_max_backoff_ms: backoff_ms,
        ..IngestConfig::default()
    }
}

#[tokio::test]
async fn after_persist_redelivers_until_store_recovers() {
    let store = ControlledStore::default();
    store.fail_next.store(2, Ordering::SeqCst);
    let h = harness(store, after_persist(10));

    for seq in 1..=5 {
        produce(&h.broker, &Batch::new("conv1", vec![text(seq)])).await;
    }
    h.broker.close();

    let claim = h.broker.claim("transfer", 0).unwrap();
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        spawn_partition_worker(claim, h.coordinator.clone(), CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.exit, WorkerExit::Drained);
    assert_eq!(report.redeliveries, 2);
    assert_eq!(report.processed, 7);
    assert_eq!(report.acked, 5);
    assert_eq!(report.halted_at, None);
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.broker.committed("transfer", 0), Some(5));
    assert_eq!(h.broker.lag("transfer"), 0);
}

#[tokio::test]
async fn after_persist_failure_mid_stream_keeps_order() {
    let h = harness(ControlledStore::default(), after_persist(10));
    produce(&h.broker, &Batch::new("conv1", vec![text(1)])).await;

    let token = CancellationToken::new();
    let handles = spawn_consumer_group(h.broker.join("transfer"), h.coordinator.clone(), &token);

    // Let the first batch land, then fail the second one once.
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.broker.committed("transfer", 0) != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.store.fail_next.store(1, Ordering::SeqCst);
    produce(&h.broker, &Batch::new("conv1", vec![text(2)])).await;
    produce(&h.broker, &Batch::new("conv1", vec![text(3)])).await;
    h.broker.close();

    let summary = shutdown(&token, handles, Duration::from_secs(5)).await;
    assert_eq!(summary.drained, 1);
    assert_eq!(summary.reports[0].redeliveries, 1);
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![1, 2, 3]);
    assert_eq!(h.broker.lag("transfer"), 0);
}

#[tokio::test]
async fn cancel_during_redelivery_backoff_halts_uncommitted() {
    let store = ControlledStore::gated();
    store.failing.store(true, Ordering::SeqCst);
    let h = harness(store, after_persist(60_000));
    produce(&h.broker, &Batch::new("conv1", vec![text(5)])).await;

    let token = CancellationToken::new();
    let claim = h.broker.claim("transfer", 0).unwrap();
    let handle = spawn_partition_worker(claim, h.coordinator.clone(), token.clone());

    h.store.entered().await;
    token.cancel();
    h.store.release();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.exit, WorkerExit::Halted);
    assert_eq!(report.halted_at, Some(0));
    assert_eq!(report.acked, 0);
    assert_eq!(report.redeliveries, 0);
    assert_eq!(h.broker.committed("transfer", 0), Some(0));

    // A later claim picks the record up again from the committed offset.
    h.store.failing.store(false, Ordering::SeqCst);
    h.broker.close();
    let claim = h.broker.claim("transfer", 0).unwrap();
    let resumed = spawn_partition_worker(claim, h.coordinator.clone(), CancellationToken::new());
    h.store.entered().await;
    h.store.release();
    let resumed = resumed.await.unwrap();
    assert_eq!(resumed.exit, WorkerExit::Drained);
    assert_eq!(resumed.acked, 1);
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![5]);
}

#[tokio::test]
async fn shutdown_after_close_drains_every_partition() {
    let h = harness_with(ControlledStore::default(), IngestConfig::default(), 4);
    for i in 0..100u64 {
        let key = format!("conv{}", i % 10);
        produce(&h.broker, &Batch::new(key, vec![text(i / 10 + 1)])).await;
    }

    let token = CancellationToken::new();
    let handles = spawn_consumer_group(h.broker.join("transfer"), h.coordinator.clone(), &token);
    h.broker.close();
    let summary = shutdown(&token, handles, Duration::from_secs(5)).await;

    assert_eq!(summary.drained, 4);
    assert_eq!(summary.aborted, 0);
    assert!(summary.reports.iter().all(|r| r.exit == WorkerExit::Drained));
    assert_eq!(summary.reports.iter().map(|r| r.acked).sum::<u64>(), 100);
    assert_eq!(h.broker.lag("transfer"), 0);
    for c in 0..10 {
        let key = format!("conv{c}");
        assert_eq!(seqs(h.store.as_ref(), &key).await, (1..=10).collect::<Vec<u64>>());
    }
}

#[tokio::test]
async fn cancellation_waits_for_in_flight_record() {
    let h = harness(ControlledStore::gated(), IngestConfig::default());
    produce(&h.broker, &Batch::new("conv1", vec![text(1)])).await;
    produce(&h.broker, &Batch::new("conv1", vec![text(2)])).await;

    let token = CancellationToken::new();
    let claim = h.broker.claim("transfer", 0).unwrap();
    let handle = spawn_partition_worker(claim, h.coordinator.clone(), token.clone());

    h.store.entered().await;
    token.cancel();
    h.store.release();

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.exit, WorkerExit::Cancelled);
    assert_eq!(report.processed, 1);
    assert_eq!(report.last_acked, Some(0));
    assert_eq!(h.broker.committed("transfer", 0), Some(1));
    assert_eq!(seqs(h.store.as_ref(), "conv1").await, vec![1]);
}

#[tokio::test]
async fn shutdown_aborts_stuck_workers_after_grace() {
    let h = harness(ControlledStore::gated(), IngestConfig::default());
    produce(&h.broker, &Batch::new("conv1", vec![text(1)])).await;

    let token = CancellationToken::new();
    let handles = spawn_consumer_group(h.broker.join("transfer"), h.coordinator.clone(), &token);
    h.store.entered().await;

    // The gate is never released, so the worker cannot finish its record.
    let summary = shutdown(&token, handles, Duration::from_millis(50)).await;
    assert_eq!(summary.aborted, 1);
    assert!(summary.reports.is_empty());
    assert_eq!(h.broker.committed("transfer", 0), Some(0));
}

#[tokio::test]
async fn shutdown_collects_idle_workers() {
    let broker = MemoryBroker::new("ws2ms_chat", 4).unwrap();
    let h = harness(ControlledStore::default(), IngestConfig::default());

    let token = CancellationToken::new();
    let handles = spawn_consumer_group(broker.join("transfer"), h.coordinator.clone(), &token);
    // Nothing closes the broker, so the drain window runs out first.
    let summary = shutdown(&token, handles, Duration::from_millis(100)).await;

    assert_eq!(summary.drained, 0);
    assert_eq!(summary.aborted, 0);
    assert_eq!(summary.reports.len(), 4);
    assert!(summary.reports.iter().all(|r| r.exit == WorkerExit::Cancelled));
}
