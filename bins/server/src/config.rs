use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use cache_memory::MemoryCacheConfig;
use pipeline::IngestConfig;
use push_callback::CallbackConfig;
use storage_file::FileStoreConfig;
use storage_memory::MemoryStoreConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "msg-transfer", about = "Приём сообщений из брокера в долговременное хранилище")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить сервер
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,
}

// ═══════════════════════════════════════════════════════════════
//  TOML конфиг
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: MemoryCacheConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
}

/// Секция `[broker]`.
#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Группа консьюмеров ингестии.
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Группа консьюмеров push-хуков.
    #[serde(default = "default_push_group_id")]
    pub push_group_id: String,
    /// Адрес приёма producer-фреймов; пусто = без TCP ingress.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Максимальный размер producer-фрейма (0 = без ограничения).
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            partitions: default_partitions(),
            group_id: default_group_id(),
            push_group_id: default_push_group_id(),
            listen: default_listen(),
            max_frame: default_max_frame(),
        }
    }
}

fn default_topic() -> String {
    "msg_to_mongo".into()
}
fn default_partitions() -> u32 {
    8
}
fn default_group_id() -> String {
    "mongo".into()
}
fn default_push_group_id() -> String {
    "push".into()
}
fn default_listen() -> String {
    "127.0.0.1:10180".into()
}
fn default_max_frame() -> usize {
    msg_envelope::DEFAULT_MAX_BYTES + 64 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

/// Секция `[store]`.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    /// Обязателен для `kind = "file"`.
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub max_per_conversation: usize,
}

impl StoreConfig {
    pub fn memory(&self) -> MemoryStoreConfig {
        MemoryStoreConfig { max_per_conversation: self.max_per_conversation }
    }

    pub fn file(&self) -> Result<FileStoreConfig, ServerError> {
        let data_dir = self
            .data_dir
            .clone()
            .ok_or_else(|| ServerError::invalid("store.data_dir is required for kind = \"file\""))?;
        let cfg = FileStoreConfig { data_dir, sync: self.sync };
        cfg.validate().map_err(ServerError::invalid)?;
        Ok(cfg)
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        Self::parse(&content)
            .map_err(|e| ServerError::Config { context: "parse", detail: format!("'{path}': {e}") })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.broker.partitions == 0 {
            return Err(ServerError::invalid("broker.partitions must be at least 1"));
        }
        if self.broker.group_id == self.broker.push_group_id {
            return Err(ServerError::invalid("broker.group_id and broker.push_group_id must differ"));
        }
        if self.store.kind == StoreKind::File {
            self.store.file()?;
        }
        self.ingest.validate().map_err(ServerError::invalid)?;
        self.callback.validate().map_err(ServerError::invalid)?;
        Ok(())
    }
}
