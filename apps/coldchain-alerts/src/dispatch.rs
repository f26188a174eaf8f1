use crate::alert::{AlertEvent, AlertKind};
use crate::bus::{alert_topic, Publisher};
use crate::config::Config;
use crate::error::TransportError;
use crate::stats::AlertStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published,
    Suppressed,
    Dropped,
}

/// Bounded exponential backoff for bus publishes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.publish_max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.publish_backoff_ms),
            max_backoff: Duration::from_millis(
                config.publish_backoff_max_ms.max(config.publish_backoff_ms),
            ),
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Publishes with retries. Returns the number of attempts used on success.
pub async fn publish_with_retry<P: Publisher>(
    publisher: &P,
    topic: &str,
    payload: &[u8],
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u32, TransportError> {
    let mut attempt = 1;
    loop {
        match publisher.publish(topic.to_string(), payload.to_vec()).await {
            Ok(()) => return Ok(attempt),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                let delay = policy.backoff_for(attempt);
                tracing::debug!(%topic, attempt, ?delay, error = %err, "publish failed; backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn per_minute(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            rate_per_sec: capacity / 60.0,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn delay_for_one(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let deficit = 1.0 - self.tokens;
        Duration::from_secs_f64(deficit / self.rate_per_sec).max(Duration::from_millis(1))
    }
}

/// Per-asset alert publisher: duplicate suppression, rate limiting, retries.
pub struct Dispatcher<P> {
    publisher: P,
    topic_prefix: String,
    retry: RetryPolicy,
    limiter: TokenBucket,
    stats: Arc<AlertStats>,
    cancel: CancellationToken,
}

impl<P: Publisher> Dispatcher<P> {
    pub fn new(
        publisher: P,
        topic_prefix: impl Into<String>,
        retry: RetryPolicy,
        alerts_per_minute: u32,
        stats: Arc<AlertStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            publisher,
            topic_prefix: topic_prefix.into(),
            retry,
            limiter: TokenBucket::per_minute(alerts_per_minute),
            stats,
            cancel,
        }
    }

    pub async fn dispatch(
        &mut self,
        last_dispatched: Option<AlertKind>,
        event: &AlertEvent,
    ) -> DispatchOutcome {
        if last_dispatched == Some(event.level) {
            AlertStats::incr(&self.stats.alerts_suppressed);
            tracing::debug!(
                asset_id = %event.asset_id,
                level = event.level.as_str(),
                "duplicate alert suppressed"
            );
            return DispatchOutcome::Suppressed;
        }

        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(err) => {
                AlertStats::incr(&self.stats.alerts_dropped);
                tracing::warn!(asset_id = %event.asset_id, error = %err, "failed to encode alert");
                return DispatchOutcome::Dropped;
            }
        };

        while !self.limiter.try_take() {
            let delay = self.limiter.delay_for_one();
            tracing::debug!(asset_id = %event.asset_id, ?delay, "alert rate limited");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    AlertStats::incr(&self.stats.alerts_dropped);
                    tracing::warn!(asset_id = %event.asset_id, "alert abandoned during shutdown");
                    return DispatchOutcome::Dropped;
                }
                _ = sleep(delay) => {}
            }
        }

        let topic = alert_topic(&self.topic_prefix, &event.asset_id);
        match publish_with_retry(&self.publisher, &topic, &payload, &self.retry, &self.cancel).await
        {
            Ok(attempts) => {
                AlertStats::incr(&self.stats.alerts_published);
                tracing::info!(
                    asset_id = %event.asset_id,
                    level = event.level.as_str(),
                    attempts,
                    message = %event.message,
                    "alert published"
                );
                DispatchOutcome::Published
            }
            Err(err) => {
                AlertStats::incr(&self.stats.alerts_dropped);
                self.stats.record_error(err.to_string());
                tracing::warn!(
                    asset_id = %event.asset_id,
                    level = event.level.as_str(),
                    error = %err,
                    "alert dropped after publish retries"
                );
                DispatchOutcome::Dropped
            }
        }
    }
}
