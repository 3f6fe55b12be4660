//! Millisecond time base for order keys.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic clock measuring milliseconds since the scheduler started.
///
/// Built on `tokio::time::Instant` so paused test runtimes drive it too.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Whole milliseconds elapsed since the epoch, rounded down.
    pub(crate) fn now_ms(&self) -> u64 {
        floor_millis(self.epoch.elapsed())
    }

    /// Due time for something that must not fire before `delay` from now.
    ///
    /// Rounded up so that `now_ms() >= due_ms` implies the full delay elapsed.
    pub(crate) fn due_after(&self, delay: Duration) -> u64 {
        ceil_millis(self.epoch.elapsed().saturating_add(delay))
    }

    /// Instant at which `due_ms` is reached.
    pub(crate) fn instant_at(&self, due_ms: u64) -> Instant {
        self.epoch + Duration::from_millis(due_ms)
    }
}

fn floor_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Milliseconds in `d`, rounding any sub-millisecond remainder up.
pub(crate) fn ceil_millis(d: Duration) -> u64 {
    let ms = floor_millis(d);
    if d.subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms.saturating_add(1)
    }
}
