//! Shared data model and collaborator traits of the message transfer pipeline.

mod broker;
mod error;
mod store;
mod types;
pub mod util;

pub use broker::{BrokerRecord, PartitionClaim, TRACE_HEADERS};
pub use error::{BackendError, ErrorKind};
pub use store::{MessageCache, MessageStore};
pub use types::{Batch, ContentType, ConversationKey, DeletionDirective, MessageRecord, SeqRange};
