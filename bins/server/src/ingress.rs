use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use msg_broker::{FrameCodec, MemoryBroker};

// ═══════════════════════════════════════════════════════════════
//  TCP ingress — фреймы продюсеров → broker.produce()
// ═══════════════════════════════════════════════════════════════

/// Принимает соединения продюсеров, пока не отменён `token`.
/// У каждого соединения своя задача; битый фрейм закрывает только его.
pub fn spawn_ingress(
    listener: TcpListener,
    broker: Arc<MemoryBroker>,
    codec: FrameCodec,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!(%peer, "producer connected");
                            let broker = broker.clone();
                            let conn_token = token.clone();
                            tokio::spawn(async move {
                                let produced = handle_connection(stream, &broker, codec, conn_token).await;
                                tracing::info!(%peer, produced, "producer disconnected");
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept error");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = token.cancelled() => break,
            }
        }
        tracing::info!("ingress stopped");
    })
}

/// Читает фреймы до EOF, ошибки разбора или отмены. Возвращает число
/// отправленных в брокер записей.
async fn handle_connection(
    mut stream: TcpStream,
    broker: &MemoryBroker,
    codec: FrameCodec,
    token: CancellationToken,
) -> u64 {
    let mut buf = Vec::with_capacity(8192);
    let mut tmp = [0u8; 4096];
    let mut produced = 0;

    loop {
        loop {
            match codec.decode(&buf) {
                Ok(Some((frame, consumed))) => {
                    buf.drain(..consumed);
                    match broker.produce(&frame.key, frame.value, Vec::new()).await {
                        Ok((partition, offset)) => {
                            produced += 1;
                            tracing::trace!(partition, offset, "frame produced");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "produce failed, closing connection");
                            return produced;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "framing error, closing connection");
                    return produced;
                }
            }
        }

        let read = tokio::select! {
            read = stream.read(&mut tmp) => read,
            _ = token.cancelled() => return produced,
        };
        match read {
            Ok(0) => {
                if !buf.is_empty() {
                    tracing::warn!(pending = buf.len(), "connection closed mid-frame");
                }
                return produced;
            }
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
            Err(e) => {
                tracing::error!(error = %e, "read error");
                return produced;
            }
        }
    }
}
