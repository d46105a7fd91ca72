use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use msg_api::{Batch, MessageRecord, PartitionClaim};
use msg_control::ControlKind;
use msg_envelope::EnvelopeCodec;
use push_callback::{
    BeforePushRequest, CallbackClient, CallbackOutcome, ONLINE_PUSH_COMMAND,
};

// ═══════════════════════════════════════════════════════════════
//  Push hooks — вторая группа консьюмеров, callback перед пушем
// ═══════════════════════════════════════════════════════════════

/// Счётчики одной задачи push-хуков.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushReport {
    pub records: u64,
    pub accepted: u64,
    /// Ответ callback'а заменил список получателей.
    pub redirected: u64,
    /// Callback не ответил, но `fail_closed = false`.
    pub continued: u64,
    /// Пуш отменён (отказ или сбой при `fail_closed = true`).
    pub aborted: u64,
}

/// Читает те же записи, что и ингестия, своей группой и вызывает callback
/// перед пушем для каждого обычного сообщения. Пуш best-effort: запись
/// подтверждается при любом ответе callback'а.
pub fn spawn_push_hooks<C>(
    claims: Vec<C>,
    callback: Arc<CallbackClient>,
    codec: Arc<dyn EnvelopeCodec>,
    token: &CancellationToken,
) -> Vec<JoinHandle<PushReport>>
where
    C: PartitionClaim + 'static,
{
    claims
        .into_iter()
        .map(|mut claim| {
            let callback = callback.clone();
            let codec = codec.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut report = PushReport::default();
                let partition = claim.partition();
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        next = claim.recv() => next,
                    };
                    let Some(record) = next else { break };

                    match codec.decode(&record.value) {
                        Ok(batch) => {
                            let trace_id = record.resolve_trace_id(&batch.trace_id);
                            run_hooks(&callback, &batch, &trace_id, &mut report).await;
                        }
                        Err(e) => {
                            tracing::debug!(partition, offset = record.offset, error = %e, "push hook skipped undecodable record");
                        }
                    }
                    report.records += 1;

                    if let Err(e) = claim.mark(&record).await {
                        tracing::error!(partition, offset = record.offset, error = %e, "push hook ack failed");
                    }
                }
                tracing::info!(partition, ?report, "push hooks stopped");
                report
            })
        })
        .collect()
}

async fn run_hooks(callback: &CallbackClient, batch: &Batch, trace_id: &str, report: &mut PushReport) {
    for msg in &batch.messages {
        if ControlKind::from_content_type(msg.content_type).is_some() {
            continue;
        }
        let req = before_push_request(msg, trace_id);
        if let Some(targets) = before_push(callback, req, report).await {
            tracing::debug!(trace_id, conversation = %batch.conversation_key, seq = msg.seq, ?targets, "push targets");
        } else {
            tracing::warn!(trace_id, conversation = %batch.conversation_key, seq = msg.seq, "push aborted by callback");
        }
    }
}

/// Спросить callback про одно сообщение. Возвращает итоговых получателей
/// или `None`, если пуш отменён.
async fn before_push(
    callback: &CallbackClient,
    mut req: BeforePushRequest,
    report: &mut PushReport,
) -> Option<Vec<String>> {
    match callback.before_online_push(&req).await {
        Ok(CallbackOutcome::Accepted(resp)) => {
            report.accepted += 1;
            if req.apply(&resp) {
                report.redirected += 1;
            }
        }
        Ok(CallbackOutcome::Disabled) => report.accepted += 1,
        Ok(CallbackOutcome::Continue) => {
            tracing::warn!(operation_id = %req.operation_id, "push callback failed, pushing original message");
            report.continued += 1;
        }
        Err(e) => {
            tracing::debug!(operation_id = %req.operation_id, error = %e, "push callback refused");
            report.aborted += 1;
            return None;
        }
    }
    Some(req.user_id_list)
}

fn before_push_request(msg: &MessageRecord, trace_id: &str) -> BeforePushRequest {
    let user_id_list = if msg.recv_id.is_empty() {
        Vec::new()
    } else {
        vec![msg.recv_id.clone()]
    };
    BeforePushRequest {
        callback_command: ONLINE_PUSH_COMMAND.to_string(),
        operation_id: trace_id.to_string(),
        user_id_list,
        client_msg_id: msg.client_msg_id.clone(),
        send_id: msg.send_id.clone(),
        group_id: msg.group_id.clone(),
        content_type: msg.content_type.code(),
        session_type: msg.session_type,
        at_user_ids: Vec::new(),
        content: String::from_utf8_lossy(&msg.content).into_owned(),
    }
}
