mod config;
mod storage;

pub use config::FileStoreConfig;
pub use storage::FileMessageStore;
