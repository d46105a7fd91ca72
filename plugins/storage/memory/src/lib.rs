use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use msg_api::{BackendError, MessageRecord, MessageStore, SeqRange};

// ═══════════════════════════════════════════════════════════════
//  MemoryStoreConfig
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct MemoryStoreConfig {
    /// Сколько последних сообщений держать на разговор (0 = без ограничения).
    #[serde(default)]
    pub max_per_conversation: usize,
}

// ═══════════════════════════════════════════════════════════════
//  MemoryMessageStore
// ═══════════════════════════════════════════════════════════════

/// Журнал в памяти. Для тестов и одиночных инстансов без диска:
/// содержимое теряется при рестарте.
pub struct MemoryMessageStore {
    logs: RwLock<HashMap<String, BTreeMap<u64, MessageRecord>>>,
    max_per_conversation: usize,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

impl MemoryMessageStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            max_per_conversation: config.max_per_conversation,
        }
    }

    /// Сколько записей хранится для `key`.
    pub async fn message_count(&self, key: &str) -> usize {
        self.logs.read().await.get(key).map(BTreeMap::len).unwrap_or(0)
    }

    pub async fn conversations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.logs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl MessageStore for MemoryMessageStore {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn append_batch<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
        _last_seq: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            if messages.is_empty() {
                return Ok(());
            }
            let mut logs = self.logs.write().await;
            let log = logs.entry(key.to_string()).or_default();
            for msg in messages {
                log.insert(msg.seq, msg.clone());
            }
            if self.max_per_conversation > 0 {
                while log.len() > self.max_per_conversation {
                    log.pop_first();
                }
            }
            Ok(())
        })
    }

    fn delete_by_sequences<'a>(
        &'a self,
        user_id: &'a str,
        seqs: &'a [u64],
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let mut logs = self.logs.write().await;
            let Some(log) = logs.get_mut(user_id) else {
                return Ok(seqs.len());
            };
            let removed = seqs.iter().filter(|seq| log.remove(*seq).is_some()).count();
            Ok(seqs.len() - removed)
        })
    }

    fn read<'a>(
        &'a self,
        key: &'a str,
        range: SeqRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageRecord>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let logs = self.logs.read().await;
            let Some(log) = logs.get(key) else {
                return Ok(Vec::new());
            };
            let lower = range.from.unwrap_or(0);
            let upper = range.to.unwrap_or(u64::MAX);
            if lower > upper {
                return Ok(Vec::new());
            }
            let matching = log.range(lower..=upper).map(|(_, m)| m.clone());
            Ok(match range.limit {
                Some(limit) => matching.take(limit).collect(),
                None => matching.collect(),
            })
        })
    }

    fn purge<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.logs.write().await.remove(key).map(|l| l.len()).unwrap_or(0)) })
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}
