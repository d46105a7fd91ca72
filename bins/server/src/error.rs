/// Ошибки запуска. После старта группы консьюмеров ошибки ингестии
/// сюда не доходят.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("store: {0}")]
    Store(#[from] msg_api::BackendError),

    #[error("broker: {0}")]
    Broker(#[from] msg_broker::BrokerError),

    #[error("{0}")]
    Callback(#[from] push_callback::CallbackError),

    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}

impl ServerError {
    pub fn invalid(detail: impl Into<String>) -> Self {
        ServerError::Config { context: "validate", detail: detail.into() }
    }
}
