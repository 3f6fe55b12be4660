//! In-process delayed task scheduler.
//!
//! This crate provides a scheduler that:
//! - Runs a callback no earlier than a requested delay
//! - Retries callbacks that report failure, with linear backoff
//! - Supports best-effort cancellation by handle
//! - Keeps all state in memory, owned by a single event loop task

mod clock;
mod config;
mod dispatch;
mod error;
mod handle;
mod index;
mod retry;
mod scheduler;
mod types;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use handle::{HandleSource, SnowflakeSource};
pub use scheduler::{Scheduler, SchedulerSnapshot, TimerState};
pub use types::{Callback, JobHandle, JobOptions, OrderKey};
