use std::time::Duration;

use serde::Deserialize;

// ═══════════════════════════════════════════════════════════════
//  Ack Policy
// ═══════════════════════════════════════════════════════════════

/// When a partition worker acknowledges a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Ack after every processing attempt, whatever its outcome.
    ///
    /// A record whose append failed is still acked, so its batch is not in
    /// the durable log and will not be redelivered. Operators accept this
    /// window in exchange for a consumer that never stalls.
    #[default]
    AfterAttempt,

    /// Ack only once the append succeeded (or the record was undecodable).
    /// A persistent append failure pauses the claim without acking, then
    /// rewinds it to the last committed offset so the record is delivered
    /// again after `redelivery_backoff_ms`.
    AfterPersist,
}

impl std::fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckPolicy::AfterAttempt => f.write_str("after_attempt"),
            AckPolicy::AfterPersist => f.write_str("after_persist"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Retry Policy
// ═══════════════════════════════════════════════════════════════

/// Bounded retry with doubling backoff. `max_attempts = 1` means no retry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn once() -> Self {
        Self::default()
    }

    pub fn attempts(max_attempts: u32, initial_backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms: initial_backoff_ms.saturating_mul(16).max(initial_backoff_ms),
        }
    }

    /// Delay before attempt number `attempt + 1` (`attempt` is 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err(format!("{name}: max_attempts must be at least 1"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(format!(
                "{name}: max_backoff_ms ({}) is below initial_backoff_ms ({})",
                self.max_backoff_ms, self.initial_backoff_ms
            ));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    2000
}

// ═══════════════════════════════════════════════════════════════
//  Ingest Config
// ═══════════════════════════════════════════════════════════════

/// `[ingest]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub ack: AckPolicy,
    #[serde(default)]
    pub append_retry: RetryPolicy,
    #[serde(default)]
    pub delete_retry: RetryPolicy,
    /// Shutdown waits this long for workers to drain, and as long again for
    /// the record in hand once they are cancelled.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Pause before an unpersisted record is redelivered (`after_persist`),
    /// doubled per consecutive failure up to `redelivery_max_backoff_ms`.
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,
    #[serde(default = "default_redelivery_max_backoff_ms")]
    pub redelivery_max_backoff_ms: u64,
    /// Upper bound on an encoded envelope (0 = unlimited).
    #[serde(default = "default_max_envelope_bytes")]
    pub max_envelope_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ack: AckPolicy::default(),
            append_retry: RetryPolicy::default(),
            delete_retry: RetryPolicy::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            redelivery_max_backoff_ms: default_redelivery_max_backoff_ms(),
            max_envelope_bytes: default_max_envelope_bytes(),
        }
    }
}

impl IngestConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Pause before redelivery number `consecutive` (1-based) of the same record.
    pub fn redelivery_backoff(&self, consecutive: u32) -> Duration {
        let shift = consecutive.saturating_sub(1).min(20);
        let ms = self
            .redelivery_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.redelivery_max_backoff_ms);
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.append_retry.validate("ingest.append_retry")?;
        self.delete_retry.validate("ingest.delete_retry")?;
        if self.redelivery_max_backoff_ms < self.redelivery_backoff_ms {
            return Err(format!(
                "ingest: redelivery_max_backoff_ms ({}) is below redelivery_backoff_ms ({})",
                self.redelivery_max_backoff_ms, self.redelivery_backoff_ms
            ));
        }
        Ok(())
    }
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_redelivery_backoff_ms() -> u64 {
    1000
}
fn default_redelivery_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_envelope_bytes() -> usize {
    msg_envelope::DEFAULT_MAX_BYTES
}
