//! Time and handle indices owned by the scheduler loop.
//!
//! Nothing in here is synchronized: the loop task is the only caller.

use std::collections::{BTreeMap, HashMap};
use std::mem;

use tracing::{debug, trace, warn};

use crate::types::{Job, JobHandle, OrderKey};

/// What the handle index knows about a live job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// Waiting in the time index under this key.
    Pending(OrderKey),
    /// Handed to the dispatcher; awaiting completion or a retry decision.
    InFlight,
}

/// Result of an explicit cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cancelled {
    /// Removed before it fired.
    Pending(OrderKey),
    /// Already dispatched; only the handle was forgotten, so no retry will follow.
    InFlight,
    /// Handle not tracked.
    Unknown,
}

/// Jobs collected by one dispatch sweep.
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    /// Due jobs in dispatch order.
    pub due: Vec<Job>,
    /// Due entries dropped because the handle index did not point at them.
    pub dropped: usize,
    /// Due time of the earliest job still pending, if any.
    pub next_due_ms: Option<u64>,
}

/// Time index and handle index, kept consistent with each other.
#[derive(Debug, Default)]
pub(crate) struct JobIndex {
    by_time: BTreeMap<OrderKey, Job>,
    by_handle: HashMap<JobHandle, Slot>,
}

impl JobIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of jobs waiting in the time index.
    pub(crate) fn pending_len(&self) -> usize {
        self.by_time.len()
    }

    /// Number of handles tracked, pending or in flight.
    pub(crate) fn tracked_len(&self) -> usize {
        self.by_handle.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }

    pub(crate) fn contains(&self, handle: JobHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    /// Earliest due time in the time index.
    pub(crate) fn next_due_ms(&self) -> Option<u64> {
        self.by_time.keys().next().map(|key| key.due_ms)
    }

    /// Sequence for a new entry in the `due_ms` bucket.
    ///
    /// The range walk ends at the bucket boundary or at the end of the index,
    /// whichever comes first.
    fn next_sequence(&self, due_ms: u64) -> u64 {
        self.by_time
            .range(OrderKey::bucket_start(due_ms)..=OrderKey::bucket_end(due_ms))
            .next_back()
            .map_or(0, |(key, _)| key.sequence.saturating_add(1))
    }

    /// Insert a job into both indices.
    ///
    /// Returns `None` when a retry arrives for a handle that was cancelled
    /// while the job was in flight.
    pub(crate) fn admit(&mut self, mut job: Job) -> Option<OrderKey> {
        if job.is_resubmission() && !self.by_handle.contains_key(&job.handle) {
            debug!(
                handle = %job.handle,
                retry = job.retry_count,
                "dropping retry for cancelled job"
            );
            return None;
        }

        let due_ms = job.key.due_ms;
        let key = OrderKey::new(due_ms, self.next_sequence(due_ms));
        job.key = key;

        let handle = job.handle;
        if let Some(Slot::Pending(stale)) = self.by_handle.insert(handle, Slot::Pending(key)) {
            warn!(%handle, ?stale, "handle already pending, replacing entry");
            self.by_time.remove(&stale);
        }
        self.by_time.insert(key, job);

        trace!(%handle, due_ms, sequence = key.sequence, "admitted job");
        Some(key)
    }

    /// Explicit cancellation: forget the handle and drop any pending entry.
    pub(crate) fn cancel(&mut self, handle: JobHandle) -> Cancelled {
        match self.by_handle.remove(&handle) {
            Some(Slot::Pending(key)) => {
                self.by_time.remove(&key);
                Cancelled::Pending(key)
            }
            Some(Slot::InFlight) => Cancelled::InFlight,
            None => Cancelled::Unknown,
        }
    }

    /// Internal removal after a job finished: touches the handle index only.
    pub(crate) fn forget(&mut self, handle: JobHandle) -> bool {
        self.by_handle.remove(&handle).is_some()
    }

    /// Remove every job due at or before `now_ms` and mark it in flight.
    pub(crate) fn take_due(&mut self, now_ms: u64) -> Sweep {
        // Everything before the first key of the next millisecond is due.
        let rest = match now_ms.checked_add(1) {
            Some(next_ms) => self.by_time.split_off(&OrderKey::bucket_start(next_ms)),
            None => BTreeMap::new(),
        };
        let due = mem::replace(&mut self.by_time, rest);

        let mut sweep = Sweep {
            due: Vec::with_capacity(due.len()),
            dropped: 0,
            next_due_ms: self.next_due_ms(),
        };

        for (key, job) in due {
            match self.by_handle.get_mut(&job.handle) {
                Some(slot) if *slot == Slot::Pending(key) => {
                    *slot = Slot::InFlight;
                    sweep.due.push(job);
                }
                other => {
                    warn!(
                        handle = %job.handle,
                        ?key,
                        slot = ?other,
                        "dropping orphaned time index entry"
                    );
                    sweep.dropped += 1;
                }
            }
        }

        sweep
    }
}
