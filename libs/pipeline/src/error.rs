use msg_api::BackendError;
use msg_control::ControlUnwrapError;
use msg_envelope::DecodeError;

/// Failure of one stage of one record. Every variant is logged and
/// terminal for its own unit of work; none of them stops the consumer.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("store {op}: {source}")]
    Store { op: &'static str, source: BackendError },

    #[error("cache invalidate: {0}")]
    Cache(BackendError),

    #[error("control message: {0}")]
    ControlUnwrap(#[from] ControlUnwrapError),
}

impl IngestError {
    pub fn is_decode(&self) -> bool {
        matches!(self, IngestError::Decode(_))
    }
}
