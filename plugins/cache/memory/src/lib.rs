use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use msg_api::{BackendError, MessageCache, MessageRecord};

// ═══════════════════════════════════════════════════════════════
//  MemoryCacheConfig
// ═══════════════════════════════════════════════════════════════

fn default_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_entries() -> usize {
    100_000
}

/// Секция `[cache]`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MemoryCacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// 0 = без ограничения.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryMessageCache
// ═══════════════════════════════════════════════════════════════

struct Entry {
    record: MessageRecord,
    expires_at: Instant,
}

/// Горячий кеш по (разговор, seq). Записи живут TTL; при превышении
/// `max_entries` первыми вытесняются те, что истекут раньше всех.
pub struct MemoryMessageCache {
    entries: RwLock<HashMap<(String, u64), Entry>>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for MemoryMessageCache {
    fn default() -> Self {
        Self::new(&MemoryCacheConfig::default())
    }
}

impl MemoryMessageCache {
    pub fn new(config: &MemoryCacheConfig) -> Self {
        Self::with_ttl(Duration::from_secs(config.ttl_secs), config.max_entries)
    }

    pub fn with_ttl(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    /// Живые (не истёкшие) записи.
    pub async fn live_entries(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub async fn contains(&self, key: &str, seq: u64) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(&(key.to_string(), seq))
            .is_some_and(|e| e.expires_at > now)
    }
}

fn evict(entries: &mut HashMap<(String, u64), Entry>, max_entries: usize) {
    let now = Instant::now();
    entries.retain(|_, e| e.expires_at > now);
    if entries.len() <= max_entries {
        return;
    }

    let mut by_expiry: Vec<((String, u64), Instant)> =
        entries.iter().map(|(k, e)| (k.clone(), e.expires_at)).collect();
    by_expiry.sort_by_key(|(_, at)| *at);
    let excess = entries.len() - max_entries;
    for (key, _) in by_expiry.into_iter().take(excess) {
        entries.remove(&key);
    }
    tracing::debug!(evicted = excess, max_entries, "cache over capacity");
}

impl MessageCache for MemoryMessageCache {
    fn get<'a>(
        &'a self,
        key: &'a str,
        seq: u64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<MessageRecord>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let now = Instant::now();
            let entries = self.entries.read().await;
            Ok(entries
                .get(&(key.to_string(), seq))
                .filter(|e| e.expires_at > now)
                .map(|e| e.record.clone()))
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let expires_at = Instant::now() + self.ttl;
            let mut entries = self.entries.write().await;
            for msg in messages {
                entries.insert((key.to_string(), msg.seq), Entry { record: msg.clone(), expires_at });
            }
            if self.max_entries > 0 && entries.len() > self.max_entries {
                evict(&mut entries, self.max_entries);
            }
            Ok(())
        })
    }

    fn invalidate<'a>(
        &'a self,
        key: &'a str,
        messages: &'a [MessageRecord],
    ) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            for msg in messages {
                entries.remove(&(key.to_string(), msg.seq));
            }
            Ok(())
        })
    }
}
