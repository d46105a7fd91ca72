//! In-process partitioned broker.
//!
//! A single topic split into N partitions. Producers route by key hash, so
//! every record of one conversation lands on one partition. Consumer groups
//! track a committed offset per partition; `join` hands out one
//! [`MemoryClaim`] per partition starting at the first uncommitted record.
//!
//! There is no replication and no rebalancing protocol: a group member that
//! wants a partition back after its claim ended simply joins again.
//! Records are kept only until every group that ever claimed the partition
//! has committed past them.

pub mod error;
pub mod frame;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use msg_api::{BackendError, BrokerRecord, PartitionClaim};

pub use error::BrokerError;
pub use frame::{FrameCodec, FrameError, ProducerFrame};

// ═══════════════════════════════════════════════════════════════
//  Partition
// ═══════════════════════════════════════════════════════════════

struct StoredRecord {
    key: Vec<u8>,
    value: Vec<u8>,
    headers: Vec<(String, String)>,
}

/// Published state of a partition: log length and closed flag.
#[derive(Clone, Copy)]
struct Watermark {
    len: u64,
    closed: bool,
}

/// Retained suffix of the log plus group offsets.
///
/// `records[0]` has offset `base`. Everything below the smallest committed
/// offset of the registered groups is dropped.
struct PartitionState {
    base: u64,
    records: VecDeque<StoredRecord>,
    /// group → next offset to deliver.
    committed: HashMap<String, u64>,
}

impl PartitionState {
    fn committed(&self, group: &str) -> u64 {
        self.committed.get(group).copied().unwrap_or(self.base)
    }

    fn get(&self, offset: u64) -> Option<&StoredRecord> {
        let idx = offset.checked_sub(self.base)?;
        self.records.get(usize::try_from(idx).ok()?)
    }

    /// Drop records every registered group has committed past.
    fn trim(&mut self) -> u64 {
        let Some(low) = self.committed.values().copied().min() else {
            return 0;
        };
        let n = low.saturating_sub(self.base).min(self.records.len() as u64);
        if n > 0 {
            self.records.drain(..n as usize);
            self.base += n;
        }
        n
    }
}

struct Partition {
    id: u32,
    state: Mutex<PartitionState>,
    watermark: watch::Sender<Watermark>,
}

impl Partition {
    fn new(id: u32) -> Self {
        let (watermark, _) = watch::channel(Watermark { len: 0, closed: false });
        Self {
            id,
            state: Mutex::new(PartitionState {
                base: 0,
                records: VecDeque::new(),
                committed: HashMap::new(),
            }),
            watermark,
        }
    }

    // The lock is never held across an await or a panicking call.
    fn state(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBroker
// ═══════════════════════════════════════════════════════════════

pub struct MemoryBroker {
    topic: String,
    partitions: Vec<Arc<Partition>>,
}

impl MemoryBroker {
    pub fn new(topic: impl Into<String>, partitions: u32) -> Result<Self, BrokerError> {
        if partitions == 0 {
            return Err(BrokerError::NoPartitions);
        }
        Ok(Self {
            topic: topic.into(),
            partitions: (0..partitions).map(|id| Arc::new(Partition::new(id))).collect(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Partition for `key` (FNV-1a, stable across runs).
    pub fn partition_for(&self, key: &[u8]) -> u32 {
        (fnv1a(key) % self.partitions.len() as u64) as u32
    }

    /// Append a record. Returns `(partition, offset)`.
    pub async fn produce(
        &self,
        key: &[u8],
        value: Vec<u8>,
        headers: Vec<(String, String)>,
    ) -> Result<(u32, u64), BrokerError> {
        let partition = &self.partitions[self.partition_for(key) as usize];
        if partition.watermark.borrow().closed {
            return Err(BrokerError::Closed);
        }

        let offset = {
            let mut state = partition.state();
            state.records.push_back(StoredRecord { key: key.to_vec(), value, headers });
            state.base + state.records.len() as u64 - 1
        };
        partition.watermark.send_modify(|w| w.len = offset + 1);

        tracing::trace!(topic = %self.topic, partition = partition.id, offset, "produced");
        Ok((partition.id, offset))
    }

    /// Claim every partition for `group`.
    pub fn join(&self, group: &str) -> Vec<MemoryClaim> {
        (0..self.partition_count())
            .filter_map(|p| self.claim(group, p).ok())
            .collect()
    }

    /// Claim a single partition for `group`, starting at its committed offset.
    ///
    /// Claiming registers the group: from then on the partition retains
    /// every record the group has not committed. A group that first joins
    /// after records were trimmed starts at the oldest retained record.
    pub fn claim(&self, group: &str, partition: u32) -> Result<MemoryClaim, BrokerError> {
        let part = self
            .partitions
            .get(partition as usize)
            .ok_or(BrokerError::PartitionOutOfRange { partition, count: self.partition_count() })?;
        let cursor = {
            let mut state = part.state();
            let base = state.base;
            *state.committed.entry(group.to_string()).or_insert(base)
        };
        tracing::debug!(topic = %self.topic, group, partition, cursor, "partition claimed");
        Ok(MemoryClaim {
            topic: self.topic.clone(),
            group: group.to_string(),
            partition: part.clone(),
            watermark: part.watermark.subscribe(),
            cursor,
        })
    }

    /// Committed offset (next record to deliver) of `group` on `partition`.
    pub fn committed(&self, group: &str, partition: u32) -> Option<u64> {
        self.partitions.get(partition as usize).map(|p| p.state().committed(group))
    }

    /// Number of records ever produced to `partition`.
    pub fn high_watermark(&self, partition: u32) -> Option<u64> {
        self.partitions.get(partition as usize).map(|p| p.watermark.borrow().len)
    }

    /// Records of `partition` still held in memory.
    pub fn retained(&self, partition: u32) -> Option<usize> {
        self.partitions.get(partition as usize).map(|p| p.state().records.len())
    }

    /// Records produced but not yet committed by `group`, summed over partitions.
    pub fn lag(&self, group: &str) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.watermark.borrow().len.saturating_sub(p.state().committed(group)))
            .sum()
    }

    /// Stop accepting records. Claims drain what is already in the log,
    /// then `recv` returns `None`.
    pub fn close(&self) {
        for p in &self.partitions {
            p.watermark.send_modify(|w| w.closed = true);
        }
        tracing::info!(topic = %self.topic, "broker closed");
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ═══════════════════════════════════════════════════════════════
//  MemoryClaim
// ═══════════════════════════════════════════════════════════════

/// One group member's claim on one partition.
pub struct MemoryClaim {
    topic: String,
    group: String,
    partition: Arc<Partition>,
    watermark: watch::Receiver<Watermark>,
    cursor: u64,
}

impl MemoryClaim {
    /// Offset of the next record `recv` will return.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    async fn next_record(&mut self) -> Option<BrokerRecord> {
        loop {
            let cursor = self.cursor;
            let state = self
                .watermark
                .wait_for(|w| w.len > cursor || w.closed)
                .await
                .map(|w| *w)
                .ok()?;
            if state.len <= cursor {
                return None;
            }

            let record = {
                let log = self.partition.state();
                if cursor < log.base {
                    // Trimmed under a claim that never committed; skip ahead.
                    self.cursor = log.base;
                    continue;
                }
                let stored = log.get(cursor)?;
                BrokerRecord {
                    topic: self.topic.clone(),
                    partition: self.partition.id,
                    offset: cursor,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    headers: stored.headers.clone(),
                }
            };

            self.cursor += 1;
            return Some(record);
        }
    }

    fn commit(&self, record: &BrokerRecord) -> Result<(), BackendError> {
        if record.partition != self.partition.id || record.topic != self.topic {
            return Err(BackendError::new(format!(
                "record {} does not belong to claim {}-{}",
                record.position_id(),
                self.topic,
                self.partition.id
            )));
        }
        let mut state = self.partition.state();
        let base = state.base;
        let next = state.committed.entry(self.group.clone()).or_insert(base);
        *next = (*next).max(record.offset + 1);
        let trimmed = state.trim();
        if trimmed > 0 {
            tracing::trace!(topic = %self.topic, partition = self.partition.id, trimmed, base = state.base, "log trimmed");
        }
        Ok(())
    }

    fn reset(&mut self) -> u64 {
        self.cursor = self.partition.state().committed(&self.group);
        self.cursor
    }
}

impl PartitionClaim for MemoryClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> u32 {
        self.partition.id
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = Option<BrokerRecord>> + Send + '_>> {
        Box::pin(self.next_record())
    }

    fn mark<'a>(
        &'a mut self,
        record: &'a BrokerRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move { self.commit(record) })
    }

    fn rewind(&mut self) -> Pin<Box<dyn Future<Output = Result<u64, BackendError>> + Send + '_>> {
        Box::pin(async move { Ok(self.reset()) })
    }
}
