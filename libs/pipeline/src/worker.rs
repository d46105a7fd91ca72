use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use msg_api::PartitionClaim;

use crate::coordinator::IngestCoordinator;

// ═══════════════════════════════════════════════════════════════
//  Reports
// ═══════════════════════════════════════════════════════════════

/// Why a partition worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The claim ended (revoked or broker closed) and every record was handled.
    Drained,
    /// Cancellation observed between records.
    Cancelled,
    /// Stopped while waiting to redeliver a record that could not be
    /// acknowledged, or because the claim could not be rewound. The record
    /// stays uncommitted.
    Halted,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub topic: String,
    pub partition: u32,
    /// Processing attempts, redeliveries included.
    pub processed: u64,
    pub acked: u64,
    /// Records with at least one logged stage failure.
    pub failed: u64,
    /// Times the claim was rewound to redeliver an unacknowledged record.
    pub redeliveries: u64,
    /// Offset of the last acknowledged record.
    pub last_acked: Option<u64>,
    /// Offset the worker stopped on without acking (`Halted` only).
    pub halted_at: Option<u64>,
    pub exit: WorkerExit,
}

impl WorkerReport {
    fn new(topic: &str, partition: u32) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            processed: 0,
            acked: 0,
            failed: 0,
            redeliveries: 0,
            last_acked: None,
            halted_at: None,
            exit: WorkerExit::Drained,
        }
    }
}

/// Result of [`shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub reports: Vec<WorkerReport>,
    /// Workers that finished their claim before cancellation.
    pub drained: usize,
    /// Workers still running when the grace period expired.
    pub aborted: usize,
    pub panicked: usize,
}

// ═══════════════════════════════════════════════════════════════
//  Partition worker — claim.recv() → process_record → claim.mark()
// ═══════════════════════════════════════════════════════════════

/// Run one partition claim: records are handled strictly in order and
/// acknowledged one at a time.
///
/// Cancellation is only observed while waiting for the next record or for a
/// redelivery; a record that has started processing always runs to
/// completion first. When the ack policy refuses a record, the claim is
/// rewound to the committed offset after a backoff and the record is
/// processed again.
pub fn spawn_partition_worker<C>(
    mut claim: C,
    coordinator: Arc<IngestCoordinator>,
    token: CancellationToken,
) -> JoinHandle<WorkerReport>
where
    C: PartitionClaim + 'static,
{
    tokio::spawn(async move {
        let mut report = WorkerReport::new(claim.topic(), claim.partition());
        let topic = report.topic.clone();
        let partition = report.partition;
        let mut consecutive_refusals = 0u32;
        tracing::info!(%topic, partition, ack = %coordinator.config().ack, "partition worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    report.exit = WorkerExit::Cancelled;
                    break;
                }
                next = claim.recv() => next,
            };
            let Some(record) = next else {
                report.exit = WorkerExit::Drained;
                break;
            };

            let outcome = coordinator.process_record(&record).await;
            report.processed += 1;
            if !outcome.is_clean() {
                report.failed += 1;
            }

            if !outcome.ack {
                consecutive_refusals += 1;
                let delay = coordinator.config().redelivery_backoff(consecutive_refusals);
                tracing::warn!(
                    %topic,
                    partition,
                    offset = record.offset,
                    trace_id = %outcome.trace_id,
                    attempt = consecutive_refusals,
                    delay_ms = delay.as_millis() as u64,
                    "record not persisted, redelivering"
                );

                let resume = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                };
                if !resume {
                    report.halted_at = Some(record.offset);
                    report.exit = WorkerExit::Halted;
                    break;
                }

                match claim.rewind().await {
                    Ok(position) => {
                        report.redeliveries += 1;
                        tracing::debug!(%topic, partition, position, "claim rewound");
                    }
                    Err(e) => {
                        tracing::error!(%topic, partition, offset = record.offset, error = %e, "rewind failed, halting claim");
                        report.halted_at = Some(record.offset);
                        report.exit = WorkerExit::Halted;
                        break;
                    }
                }
                continue;
            }
            consecutive_refusals = 0;

            match claim.mark(&record).await {
                Ok(()) => {
                    report.acked += 1;
                    report.last_acked = Some(record.offset);
                }
                Err(e) => {
                    // Redelivered on the next claim; the append is idempotent.
                    tracing::error!(
                        %topic,
                        partition,
                        offset = record.offset,
                        trace_id = %outcome.trace_id,
                        error = %e,
                        "ack failed"
                    );
                }
            }
        }

        tracing::info!(
            %topic,
            partition,
            processed = report.processed,
            acked = report.acked,
            failed = report.failed,
            redeliveries = report.redeliveries,
            exit = ?report.exit,
            "partition worker stopped"
        );
        report
    })
}

/// One worker per claim.
pub fn spawn_consumer_group<C>(
    claims: Vec<C>,
    coordinator: Arc<IngestCoordinator>,
    token: &CancellationToken,
) -> Vec<JoinHandle<WorkerReport>>
where
    C: PartitionClaim + 'static,
{
    claims
        .into_iter()
        .map(|claim| spawn_partition_worker(claim, coordinator.clone(), token.clone()))
        .collect()
}

/// Stop a consumer group in two phases.
///
/// 1. Drain: wait up to `grace` for workers to end on their own. Close the
///    broker first so claims run dry instead of waiting for new records.
/// 2. Cancel `token`, wait up to `grace` again for the records in hand,
///    then abort what is left.
pub async fn shutdown(
    token: &CancellationToken,
    handles: Vec<JoinHandle<WorkerReport>>,
    grace: Duration,
) -> ShutdownReport {
    let mut out = ShutdownReport::default();

    let deadline = tokio::time::Instant::now() + grace;
    let mut pending = Vec::new();
    for mut handle in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => {
                out.drained += 1;
                collect(&mut out, joined);
            }
            Err(_) => pending.push(handle),
        }
    }

    token.cancel();
    if pending.is_empty() {
        return out;
    }
    tracing::info!(remaining = pending.len(), "drain window over, cancelling workers");

    let deadline = tokio::time::Instant::now() + grace;
    for mut handle in pending {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(joined) => collect(&mut out, joined),
            Err(_) => {
                handle.abort();
                out.aborted += 1;
            }
        }
    }

    if out.aborted > 0 {
        tracing::warn!(
            aborted = out.aborted,
            grace_ms = grace.as_millis() as u64,
            "grace period expired, workers aborted"
        );
    }
    out
}

fn collect(out: &mut ShutdownReport, joined: Result<WorkerReport, tokio::task::JoinError>) {
    match joined {
        Ok(report) => out.reports.push(report),
        Err(e) => {
            tracing::error!(error = %e, "partition worker panicked");
            out.panicked += 1;
        }
    }
}
