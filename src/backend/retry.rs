use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::AppError;

/// Successive retry delays. Each one is the previous times the multiplier,
/// capped at `max_backoff_ms`, then scaled by a random factor within
/// `1 ± jitter_factor`.
struct Backoff {
    next_ms: f64,
    max_ms: f64,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    fn new(config: &RetryConfig) -> Self {
        Self {
            next_ms: config.initial_backoff_ms as f64,
            max_ms: config.max_backoff_ms as f64,
            multiplier: f64::from(config.backoff_multiplier).max(1.0),
            jitter: f64::from(config.jitter_factor).clamp(0.0, 1.0),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let base = self.next_ms.min(self.max_ms);
        self.next_ms = base * self.multiplier;

        let scale = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Some(Duration::from_millis((base * scale).round() as u64))
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent. Only [`AppError::is_retryable`] errors retry.
pub async fn with_retry<T, Op, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: Op,
) -> Result<T, AppError>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let max = config.max_attempts.max(1);
    let mut delays = Backoff::new(config);
    let mut attempt: u32 = 0;

    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt + 1 >= max {
            warn!(operation = operation_name, attempts = max, "Retries exhausted: {err}");
            return Err(err);
        }

        let delay = delays.next().unwrap_or_default();
        debug!(
            operation = operation_name,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Retry backoff: {err}"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
