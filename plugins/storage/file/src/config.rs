use std::path::PathBuf;

use sha2::{Digest, Sha256};

// ════════════════════════════════════════════════════════════════
//  Конфигурация
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FileStoreConfig {
    /// Каталог с файлами разговоров: `{data_dir}/{KEY}.jsonl`.
    pub data_dir: PathBuf,
    /// fsync после каждой записи в файл.
    #[serde(default)]
    pub sync: bool,
}

impl FileStoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), sync: false }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("store.data_dir must not be empty".into());
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════
//  Имена файлов
// ════════════════════════════════════════════════════════════════

/// Самое длинное закодированное имя, которое идёт в файл как есть.
/// С запасом под `.jsonl.tmp` укладывается в NAME_MAX = 255.
pub(crate) const MAX_PLAIN_STEM: usize = 200;

/// Длина читаемого префикса в хешированном имени.
const HASHED_PREFIX: usize = 48;

/// Разделитель префикса и хеша. `encode_key` его всегда экранирует,
/// поэтому обычное имя с хешированным не совпадёт.
pub(crate) const HASH_MARK: char = '~';

/// Ключ разговора → имя файла без расширения.
///
/// Короткие ключи кодируются обратимо ([`encode_key`]). Длинные получают
/// `{префикс}~{sha256}`; исходный ключ тогда лежит рядом в `{stem}.key`.
pub(crate) fn file_stem(key: &str) -> String {
    let encoded = encode_key(key);
    if encoded.len() <= MAX_PLAIN_STEM {
        return encoded;
    }

    let mut cut = HASHED_PREFIX;
    // Не разрываем %XX.
    if let Some(pos) = encoded[cut - 2..cut].find('%') {
        cut = cut - 2 + pos;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut stem = String::with_capacity(cut + 1 + digest.len() * 2);
    stem.push_str(&encoded[..cut]);
    stem.push(HASH_MARK);
    for b in digest {
        stem.push_str(&format!("{b:02x}"));
    }
    stem
}

pub(crate) fn is_hashed(stem: &str) -> bool {
    stem.contains(HASH_MARK)
}

/// Байты вне `[A-Za-z0-9._-]` превращаются в `%XX`, так что любой ключ
/// становится одним плоским именем.
pub(crate) fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    // "." и ".." сами по себе не годятся как имя файла.
    if out.chars().all(|c| c == '.') {
        out = out.replace('.', "%2E");
    }
    out
}

/// Обратное к [`encode_key`]. `None` для имён, которые хранилище не создавало.
pub(crate) fn decode_key(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
