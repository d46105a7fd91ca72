use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;

use msg_api::{BackendError, MessageRecord, MessageStore, SeqRange};

use crate::config::{FileStoreConfig, decode_key, file_stem, is_hashed};

type Log = BTreeMap<u64, MessageRecord>;

/// Число блокировок записи; ключ попадает в одну из них по хешу.
const LOCK_STRIPES: usize = 64;

// ════════════════════════════════════════════════════════════════
//  FileMessageStore
// ════════════════════════════════════════════════════════════════

/// Один JSONL-файл на разговор, одна [`MessageRecord`] на строку.
///
/// Вставка только дописывает строки в конец файла. При чтении побеждает
/// последняя строка с данным seq, так что повторная доставка пачки
/// ничего не дублирует. Удаление и очистка переписывают файл целиком
/// (через временный файл и rename) и заодно сжимают его.
///
/// Записи в один ключ идут под одной блокировкой; разные ключи обычно
/// не мешают друг другу.
pub struct FileMessageStore {
    data_dir: PathBuf,
    sync: bool,
    locks: Vec<Mutex<()>>,
}

impl FileMessageStore {
    pub fn new(config: &FileStoreConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            sync: config.sync,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock_for(&self, key: &str) -> &Mutex<()> {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        &self.locks[(h.finish() as usize) % self.locks.len()]
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{}.jsonl", file_stem(key)))
    }

    /// Рядом с хешированным файлом лежит исходный ключ.
    fn key_path(path: &Path) -> PathBuf {
        path.with_extension("key")
    }

    /// Ключи разговоров, у которых есть файл на диске, по возрастанию.
    pub fn conversations(&self) -> Result<Vec<String>, BackendError> {
        let dir = match std::fs::read_dir(&self.data_dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackendError::io(format!("read_dir {}: {e}", self.data_dir.display()))),
        };

        let mut keys = Vec::new();
        for entry in dir.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(stem) = name.strip_suffix(".jsonl") else {
                continue;
            };
            if is_hashed(stem) {
                let path = Self::key_path(&entry.path());
                match std::fs::read_to_string(&path) {
                    Ok(key) => keys.push(key),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(BackendError::io(format!("read {}: {e}", path.display()))),
                }
            } else if let Some(key) = decode_key(stem) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    // ── Чтение ──

    fn load(&self, path: &Path) -> Result<Log, BackendError> {
        let f = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Log::new()),
            Err(e) => return Err(BackendError::io(format!("open {}: {e}", path.display()))),
        };

        let mut log = Log::new();
        for (n, line) in std::io::BufReader::new(f).lines().enumerate() {
            let line = line.map_err(|e| BackendError::io(format!("read line: {e}")))?;
            if line.is_empty() {
                continue;
            }
            let record: MessageRecord = serde_json::from_str(&line).map_err(|e| {
                BackendError::format_err(format!("{}:{}: parse json: {e}", path.display(), n + 1))
            })?;
            // Последняя запись побеждает.
            log.insert(record.seq, record);
        }
        Ok(log)
    }

    // ── Запись ──

    fn serialize(messages: &[MessageRecord]) -> Result<Vec<u8>, BackendError> {
        let mut buf = Vec::new();
        for record in messages {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| BackendError::format_err(format!("json serialize: {e}")))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }

    /// Дописать пачку одним `write_all`.
    fn append_lines(&self, key: &str, path: &Path, messages: &[MessageRecord]) -> Result<(), BackendError> {
        let buf = Self::serialize(messages)?;
        std::fs::create_dir_all(&self.data_dir).map_err(|e| BackendError::io(format!("mkdir: {e}")))?;
        self.write_key_file(key, path)?;

        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| BackendError::io(format!("open {}: {e}", path.display())))?;
        f.write_all(&buf).map_err(|e| BackendError::io(format!("write: {e}")))?;
        if self.sync {
            f.sync_data().map_err(|e| BackendError::io(format!("fsync: {e}")))?;
        }
        Ok(())
    }

    fn write_key_file(&self, key: &str, path: &Path) -> Result<(), BackendError> {
        let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        if !is_hashed(&stem) {
            return Ok(());
        }
        let key_path = Self::key_path(path);
        if key_path.exists() {
            return Ok(());
        }
        std::fs::write(&key_path, key).map_err(|e| BackendError::io(format!("write {}: {e}", key_path.display())))
    }

    /// Переписать файл по `log`; пустой лог удаляет файл.
    fn compact(&self, path: &Path, log: &Log) -> Result<(), BackendError> {
        if log.is_empty() {
            remove_if_exists(path)?;
            return remove_if_exists(&Self::key_path(path));
        }

        let tmp = path.with_extension("jsonl.tmp");
        let records: Vec<MessageRecord> = log.values().cloned().collect();
        let buf = Self::serialize(&records)?;
        let mut f = std::fs::File::create(&tmp)
            .map_err(|e| BackendError::io(format!("create {}: {e}", tmp.display())))?;
        f.write_all(&buf).map_err(|e| BackendError::io(format!("write: {e}")))?;
        if self.sync {
            f.sync_all().map_err(|e| BackendError::io(format!("fsync: {e}")))?;
        }
        drop(f);

        std::fs::rename(&tmp, path)
            .map_err(|e| BackendError::io(format!("rename {}: {e}", path.display())))
    }
}

fn remove_if_exists(path: &Path) -> Result<(), BackendError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::io(format!("remove {}: {e}", path.display()))),
    }
}

// ════════════════════════════════════════════════════════════════
//  MessageStore impl
// ════════════════════════════════════════════════════════════════

impl MessageStore for FileMessageStore {
    fn init(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        Box::pin(async move {
            std::fs::create_dir_all(&self.data_dir).map_err(|e| {
                BackendError::io(format!("mkdir {}: {e}", self.data_dir.display()))
            })
        })
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
            let _guard = self.lock_for(key).lock().await;
            self.append_lines(key, &self.path_for(key), messages)
                .map_err(|e| e.with_context(format!("append {key}")))
        })
    }

    fn delete_by_sequences<'a>(
        &'a self,
        user_id: &'a str,
        seqs: &'a [u64],
    ) -> Pin<Box<dyn Future<Output = Result<usize, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let _guard = self.lock_for(user_id).lock().await;
            let path = self.path_for(user_id);
            let mut log = self.load(&path)?;
            let removed = seqs.iter().filter(|seq| log.remove(*seq).is_some()).count();
            if removed > 0 {
                self.compact(&path, &log)
                    .map_err(|e| e.with_context(format!("delete {user_id}")))?;
            }
            Ok(seqs.len() - removed)
        })
    }

    fn read<'a>(
        &'a self,
        key: &'a str,
        range: SeqRange,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageRecord>, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let log = self.load(&self.path_for(key))?;
            let matching = log.into_values().filter(|m| range.contains(m.seq));
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
        Box::pin(async move {
            let _guard = self.lock_for(key).lock().await;
            let path = self.path_for(key);
            let removed = self.load(&path)?.len();
            self.compact(&path, &Log::new())?;
            Ok(removed)
        })
    }

    fn flush(&self) -> Pin<Box<dyn Future<Output = Result<(), BackendError>> + Send + '_>> {
        // Каждая запись уже на диске.
        Box::pin(async { Ok(()) })
    }
}
