//! Concurrent execution of due jobs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, trace};

use crate::types::Job;

/// How a callback invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Returned `true`, or the job had no callback.
    Succeeded,
    /// Returned `false`.
    Failed,
    /// Panicked; handled like a failure.
    Panicked,
}

impl Outcome {
    pub(crate) fn is_success(self) -> bool {
        self == Outcome::Succeeded
    }
}

/// Report sent to the retry coordinator once a callback returns.
#[derive(Debug)]
pub(crate) struct Completion {
    pub job: Job,
    pub outcome: Outcome,
}

/// Spawns one task per due job and reports completions.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    completion_tx: mpsc::Sender<Completion>,
    limit: Option<Arc<Semaphore>>,
}

impl Dispatcher {
    /// Create a dispatcher. `max_concurrency` caps running callbacks when set.
    pub(crate) fn new(
        completion_tx: mpsc::Sender<Completion>,
        max_concurrency: Option<usize>,
    ) -> Self {
        Self {
            completion_tx,
            limit: max_concurrency.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Run `job` on a fresh task. Never blocks the caller.
    pub(crate) fn dispatch(&self, job: Job) {
        let completion_tx = self.completion_tx.clone();
        let limit = self.limit.clone();

        tokio::spawn(async move {
            let permit = match limit {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        debug!(handle = %job.handle, "concurrency limiter closed, skipping job");
                        return;
                    }
                },
                None => None,
            };

            let outcome = run_callback(&job);
            drop(permit);
            trace!(handle = %job.handle, ?outcome, "job callback returned");

            if completion_tx.send(Completion { job, outcome }).await.is_err() {
                debug!("retry coordinator gone, dropping completion");
            }
        });
    }
}

fn run_callback(job: &Job) -> Outcome {
    let Some(callback) = job.callback.as_ref() else {
        return Outcome::Succeeded;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(true) => Outcome::Succeeded,
        Ok(false) => Outcome::Failed,
        Err(payload) => {
            error!(
                handle = %job.handle,
                retry = job.retry_count,
                panic = %panic_message(payload.as_ref()),
                "job callback panicked"
            );
            Outcome::Panicked
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
