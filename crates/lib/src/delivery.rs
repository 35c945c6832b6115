//! Delivery worker: one send attempt of one message to one target, plus the retry policy the
//! forwarder uses to schedule further attempts. The worker itself never loops.

use crate::channels::InboundMessage;
use crate::routing::ForwardTarget;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Result of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Network error, timeout, rate limit, upstream 5xx. `retry_after` is a hint from the destination.
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Destination gone or payload rejected. Never retried.
    PermanentFailure { reason: String },
}

impl DeliveryOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }
}

/// Outbound side of a channel: sends messages to forward targets.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;
    /// Exactly one send of `message` to `target`.
    async fn send(&self, message: &InboundMessage, target: &ForwardTarget) -> DeliveryOutcome;
    /// Send a plain notice to a chat (operator alerts). Default returns error.
    async fn notify(&self, _chat_id: &str, _text: &str) -> Result<(), String> {
        Err("notify not implemented".to_string())
    }
}

/// Single-attempt delivery primitive.
#[derive(Clone)]
pub struct DeliveryWorker {
    outbound: Arc<dyn Outbound>,
    attempt_timeout: Duration,
}

impl DeliveryWorker {
    pub fn new(outbound: Arc<dyn Outbound>, attempt_timeout: Duration) -> Self {
        Self {
            outbound,
            attempt_timeout,
        }
    }

    /// Perform one send attempt. An attempt exceeding the timeout counts as a transient failure.
    pub async fn deliver(&self, message: &InboundMessage, target: &ForwardTarget) -> DeliveryOutcome {
        match tokio::time::timeout(self.attempt_timeout, self.outbound.send(message, target)).await {
            Ok(outcome) => outcome,
            Err(_) => DeliveryOutcome::transient(format!(
                "attempt timed out after {}ms",
                self.attempt_timeout.as_millis()
            )),
        }
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }
}

/// Bounded, jittered exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed per (message, target), including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// True when another attempt is allowed after `attempts` have been made.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Exponential part of the delay after `attempt` (1-based) failed: base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base.as_millis().max(1) as u64;
        let max = (self.max.as_millis() as u64).max(base);
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(pow).min(max))
    }

    /// Delay before the next attempt: backoff plus jitter, raised to the destination's hint.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.backoff(attempt) + jitter_delay(self.jitter);
        match retry_after {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

fn jitter_delay(jitter: Duration) -> Duration {
    let jitter_ms = jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
