//! Retry classification, exponential backoff and call pacing.

use std::future::Future;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::warn;

use crate::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Pause before retry `attempt`: doubles from `base_delay`, never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

/// Run a store operation, retrying only transient failures.
pub async fn with_store_retries<T, F, Fut>(
    policy: &BackoffPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(operation, attempt, ?delay, error = %err, "transient store failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Throughput constraint for external lookups: a minimum gap between calls and a
/// longer pause after every `burst_size` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupSchedule {
    pub min_delay: Duration,
    pub burst_size: usize,
    pub burst_pause: Duration,
}

impl Default for LookupSchedule {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(250),
            burst_size: 40,
            burst_pause: Duration::from_secs(10),
        }
    }
}

impl LookupSchedule {
    pub fn unthrottled() -> Self {
        Self {
            min_delay: Duration::ZERO,
            burst_size: 0,
            burst_pause: Duration::ZERO,
        }
    }

    /// Gap required before the call with zero-based index `call_index`.
    pub fn delay_before(&self, call_index: usize) -> Duration {
        if call_index == 0 {
            Duration::ZERO
        } else if self.burst_size > 0 && call_index % self.burst_size == 0 {
            self.burst_pause.max(self.min_delay)
        } else {
            self.min_delay
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    calls: usize,
    last_call: Option<Instant>,
}

/// Serializes callers onto a [`LookupSchedule`].
#[derive(Debug)]
pub struct Pacer {
    schedule: LookupSchedule,
    state: Mutex<PacerState>,
}

impl Pacer {
    pub fn new(schedule: LookupSchedule) -> Self {
        Self {
            schedule,
            state: Mutex::new(PacerState {
                calls: 0,
                last_call: None,
            }),
        }
    }

    pub fn schedule(&self) -> LookupSchedule {
        self.schedule
    }

    /// Wait until the next call is allowed, then claim it.
    pub async fn wait_turn(&self) {
        let mut state = self.state.lock().await;
        let required = self.schedule.delay_before(state.calls);
        if let Some(last) = state.last_call {
            let elapsed = last.elapsed();
            if elapsed < required {
                tokio::time::sleep(required - elapsed).await;
            }
        }
        state.calls += 1;
        state.last_call = Some(Instant::now());
    }

    pub async fn calls_made(&self) -> usize {
        self.state.lock().await.calls
    }
}
