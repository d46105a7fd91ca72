use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker needs at least one partition")]
    NoPartitions,

    #[error("partition {partition} out of range (topic has {count})")]
    PartitionOutOfRange { partition: u32, count: u32 },

    #[error("broker is closed")]
    Closed,
}
