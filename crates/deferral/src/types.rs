//! Scheduler types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::ceil_millis;

/// Callback run when a job becomes due.
///
/// Returning `false` reports failure and schedules a retry if any remain.
pub type Callback = Arc<dyn Fn() -> bool + Send + Sync>;

/// Opaque identifier returned by submit and accepted by cancel.
///
/// Stable for the whole life of a job, including its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub i64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobHandle {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Position of a job in the time index.
///
/// Ordered by `due_ms`, then by `sequence`. The derived ordering compares
/// fields in declaration order, which is exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderKey {
    /// Due time in milliseconds since the scheduler started.
    pub due_ms: u64,
    /// Tie-breaker among jobs due in the same millisecond, assigned on insert.
    pub sequence: u64,
}

impl OrderKey {
    /// Create a key.
    pub fn new(due_ms: u64, sequence: u64) -> Self {
        Self { due_ms, sequence }
    }

    /// Smallest key in the `due_ms` bucket.
    pub(crate) fn bucket_start(due_ms: u64) -> Self {
        Self::new(due_ms, 0)
    }

    /// Largest key in the `due_ms` bucket.
    pub(crate) fn bucket_end(due_ms: u64) -> Self {
        Self::new(due_ms, u64::MAX)
    }
}

/// Per-job overrides for [`Scheduler::submit_with`](crate::Scheduler::submit_with).
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Retries after the first attempt. `None` uses the configured default.
    pub max_retries: Option<u32>,
    /// Callback to run. `None` makes the job a trivial success when it fires.
    pub callback: Option<Callback>,
}

impl JobOptions {
    /// Options running `callback` with the default retry budget.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            max_retries: None,
            callback: Some(Arc::new(callback)),
        }
    }

    /// Override the retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

impl fmt::Debug for JobOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOptions")
            .field("max_retries", &self.max_retries)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// A scheduled unit of work.
pub(crate) struct Job {
    /// Current position; rewritten on every (re)insertion.
    pub key: OrderKey,
    pub handle: JobHandle,
    /// Originally requested delay, used to scale retry backoff.
    pub interval: Duration,
    /// Failed attempts so far.
    pub retry_count: u32,
    pub max_retries: u32,
    pub callback: Option<Callback>,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(
        handle: JobHandle,
        due_ms: u64,
        interval: Duration,
        max_retries: u32,
        callback: Option<Callback>,
    ) -> Self {
        Self {
            key: OrderKey::bucket_start(due_ms),
            handle,
            interval,
            retry_count: 0,
            max_retries,
            callback,
            submitted_at: Utc::now(),
        }
    }

    /// Whether this job is a retry rather than a first submission.
    pub(crate) fn is_resubmission(&self) -> bool {
        self.retry_count > 0
    }

    /// Whether another attempt is allowed after `retry_count` failures.
    pub(crate) fn has_retries_left(&self) -> bool {
        self.retry_count <= self.max_retries
    }

    /// Due time for the next attempt: the interval scaled by the attempt number.
    pub(crate) fn backoff_due_ms(&self, now_ms: u64) -> u64 {
        let step = ceil_millis(self.interval).saturating_mul(u64::from(self.retry_count));
        now_ms.saturating_add(step)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .field("interval", &self.interval)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("callback", &self.callback.is_some())
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}
