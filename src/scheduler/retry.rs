// Iterative retry with exponential backoff and cooperative cancellation.
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const ATTEMPT_LOG_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Wait before retry number `retry + 1`: base, 2x base, 4x base, ...
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor)
    }

    pub fn backoff_table(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|r| self.delay_for(r)).collect()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Cancelled; the interrupted attempt is not counted.
    Aborted { retries: u32 },
    Exhausted { retries: u32, last: E },
}

/// Runs `op` until it succeeds, the retry budget is spent or `cancel` fires.
pub async fn run_with_retry<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<Attempted<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retries = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("{}: aborted after {} retries", operation, retries);
                return Err(RetryError::Aborted { retries });
            }
            r = op() => r,
        };

        match result {
            Ok(value) => return Ok(Attempted { value, retries }),
            Err(e) if retries >= policy.max_retries => {
                warn!("{}: giving up after {} retries: {}", operation, retries, e);
                return Err(RetryError::Exhausted { retries, last: e });
            }
            Err(e) => {
                let delay = policy.delay_for(retries);
                warn!(
                    "{}: attempt {} failed ({}), retrying in {:?}",
                    operation,
                    retries + 1,
                    e,
                    delay
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Aborted { retries }),
                    _ = tokio::time::sleep(delay) => {}
                }
                retries += 1;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AttemptStatus,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Most recent attempts, oldest dropped first.
#[derive(Debug)]
pub struct AttemptLog {
    entries: VecDeque<AttemptRecord>,
    capacity: usize,
}

impl AttemptLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: AttemptRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<AttemptRecord> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AttemptLog {
    fn default() -> Self {
        Self::new(ATTEMPT_LOG_CAPACITY)
    }
}
