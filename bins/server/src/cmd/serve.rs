use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cache_memory::MemoryMessageCache;
use msg_api::{MessageCache, MessageStore};
use msg_broker::{FrameCodec, MemoryBroker};
use msg_envelope::{EnvelopeCodec, JsonEnvelopeCodec};
use pipeline::{IngestCoordinator, ShutdownReport, WorkerReport, shutdown, spawn_consumer_group};
use push_callback::CallbackClient;
use storage_file::FileMessageStore;
use storage_memory::MemoryMessageStore;

use crate::config::{ServeArgs, ServerConfig, StoreKind};
use crate::error::ServerError;
use crate::ingress::spawn_ingress;
use crate::push::{PushReport, spawn_push_hooks};

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("msg-transfer starting");

    // --- Загрузка конфига ---
    let config = ServerConfig::load(&args.config)?;
    config.validate()?;
    tracing::info!(config = %args.config, "loaded config");

    let running = start(config).await?;
    tracing::info!("server ready");

    // --- Ожидание Ctrl+C ---
    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down...");
    running.stop().await;
    signal?;
    Ok(())
}

/// Запущенный сервер: все задачи и то, что нужно для их остановки.
pub struct Running {
    pub broker: Arc<MemoryBroker>,
    pub store: Arc<dyn MessageStore>,
    group_id: String,
    grace: Duration,
    token: CancellationToken,
    workers: Vec<JoinHandle<WorkerReport>>,
    push_token: CancellationToken,
    push_handles: Vec<JoinHandle<PushReport>>,
    ingress_token: CancellationToken,
    ingress: Option<JoinHandle<()>>,
}

/// Поднять хранилище, кеш, брокер, воркеры, push-хуки и TCP ingress.
pub async fn start(config: ServerConfig) -> Result<Running, ServerError> {
    let token = CancellationToken::new();

    // --- Долговременное хранилище ---
    let store: Arc<dyn MessageStore> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryMessageStore::new(config.store.memory())),
        StoreKind::File => Arc::new(FileMessageStore::new(&config.store.file()?)),
    };
    store.init().await?;
    tracing::info!(kind = ?config.store.kind, "store ready");

    // --- Горячий кеш ---
    let cache: Arc<dyn MessageCache> = Arc::new(MemoryMessageCache::new(&config.cache));
    tracing::info!(ttl_secs = config.cache.ttl_secs, max_entries = config.cache.max_entries, "cache ready");

    // --- Брокер ---
    let broker = Arc::new(MemoryBroker::new(config.broker.topic.clone(), config.broker.partitions)?);
    tracing::info!(
        topic = %config.broker.topic,
        partitions = config.broker.partitions,
        "broker ready"
    );

    // --- Группа ингестии ---
    let codec: Arc<dyn EnvelopeCodec> = Arc::new(JsonEnvelopeCodec::new(config.ingest.max_envelope_bytes));
    let grace = config.ingest.shutdown_grace();
    let coordinator = Arc::new(IngestCoordinator::new(
        codec.clone(),
        store.clone(),
        cache,
        config.ingest,
    ));
    let claims = broker.join(&config.broker.group_id);
    let workers = spawn_consumer_group(claims, coordinator, &token);
    tracing::info!(group = %config.broker.group_id, workers = workers.len(), "ingestion workers started");

    // --- Push-хуки ---
    let push_token = CancellationToken::new();
    let push_handles = if config.callback.enable {
        let url = config.callback.url.clone();
        let callback = Arc::new(CallbackClient::new(config.callback)?);
        let claims = broker.join(&config.broker.push_group_id);
        tracing::info!(group = %config.broker.push_group_id, %url, "push hooks started");
        spawn_push_hooks(claims, callback, codec, &push_token)
    } else {
        Vec::new()
    };

    // --- TCP ingress ---
    let ingress_token = CancellationToken::new();
    let ingress = if config.broker.listen.is_empty() {
        None
    } else {
        let addr = config.broker.listen.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        tracing::info!(%addr, max_frame = config.broker.max_frame, "ingress listening");
        Some(spawn_ingress(listener, broker.clone(), FrameCodec::new(config.broker.max_frame), ingress_token.clone()))
    };

    Ok(Running {
        broker,
        store,
        group_id: config.broker.group_id,
        grace,
        token,
        workers,
        push_token,
        push_handles,
        ingress_token,
        ingress,
    })
}

impl Running {
    /// Остановка по порядку: ingress, закрытие брокера, дренаж воркеров,
    /// push-хуки, flush хранилища.
    pub async fn stop(self) -> ShutdownReport {
        // Сначала прекращаем приём, потом воркеры дочитывают остаток.
        self.ingress_token.cancel();
        if let Some(h) = self.ingress {
            let _ = h.await;
        }
        self.broker.close();

        let summary = shutdown(&self.token, self.workers, self.grace).await;
        for report in &summary.reports {
            tracing::info!(
                partition = report.partition,
                processed = report.processed,
                acked = report.acked,
                failed = report.failed,
                redeliveries = report.redeliveries,
                exit = ?report.exit,
                "worker report"
            );
        }

        // Закрытый брокер дочитывается и push-группой; отмена только добивает.
        for mut h in self.push_handles {
            if tokio::time::timeout(Duration::from_secs(1), &mut h).await.is_err() {
                self.push_token.cancel();
                if tokio::time::timeout(Duration::from_secs(1), h).await.is_err() {
                    tracing::warn!("push hook did not stop in time");
                }
            }
        }
        self.push_token.cancel();

        if let Err(e) = self.store.flush().await {
            tracing::error!(error = %e, "store flush error");
        }
        tracing::info!(
            lag = self.broker.lag(&self.group_id),
            drained = summary.drained,
            aborted = summary.aborted,
            panicked = summary.panicked,
            "shutdown complete"
        );
        summary
    }
}
