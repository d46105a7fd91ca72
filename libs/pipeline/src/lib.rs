//! Message ingestion: one worker per partition claim feeding records
//! through the [`IngestCoordinator`].

pub mod config;
pub mod error;
mod coordinator;
mod worker;

pub use config::{AckPolicy, IngestConfig, RetryPolicy};
pub use coordinator::{AppendStatus, DeletionReport, IngestCoordinator, RecordOutcome};
pub use error::IngestError;
pub use worker::{
    ShutdownReport, WorkerExit, WorkerReport, shutdown, spawn_consumer_group,
    spawn_partition_worker,
};
