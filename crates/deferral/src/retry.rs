//! Retry decisions for completed jobs.
//!
//! The coordinator is the single reader of the completion channel. Its
//! decisions go back to the scheduler loop as ordinary commands, so the loop
//! stays the only owner of the indices.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::dispatch::{Completion, Outcome};
use crate::scheduler::Command;
use crate::types::{Job, JobHandle, OrderKey};

/// What to do with a job after one attempt.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Reinsert under a later due time.
    Retry(Job),
    /// Out of retries; forget the handle.
    Exhausted(JobHandle),
    /// Finished; forget the handle.
    Completed(JobHandle),
}

impl Decision {
    /// Command carrying this decision to the scheduler loop.
    fn into_command(self) -> Command {
        match self {
            Decision::Retry(job) => Command::Add(job),
            Decision::Exhausted(handle) | Decision::Completed(handle) => Command::Remove {
                handle,
                internal: true,
            },
        }
    }
}

/// Decide the fate of a completed attempt observed at `now_ms`.
pub(crate) fn decide(completion: Completion, now_ms: u64) -> Decision {
    let Completion { mut job, outcome } = completion;

    if outcome.is_success() {
        return Decision::Completed(job.handle);
    }

    job.retry_count = job.retry_count.saturating_add(1);
    if !job.has_retries_left() {
        return Decision::Exhausted(job.handle);
    }

    job.key = OrderKey::bucket_start(job.backoff_due_ms(now_ms));
    Decision::Retry(job)
}

/// Consumes completion reports and feeds decisions back to the loop.
pub(crate) struct RetryCoordinator {
    completion_rx: mpsc::Receiver<Completion>,
    command_tx: mpsc::Sender<Command>,
    clock: Clock,
}

impl RetryCoordinator {
    pub(crate) fn new(
        completion_rx: mpsc::Receiver<Completion>,
        command_tx: mpsc::Sender<Command>,
        clock: Clock,
    ) -> Self {
        Self {
            completion_rx,
            command_tx,
            clock,
        }
    }

    /// Process completions until every dispatcher sender is gone.
    pub(crate) async fn run(mut self) {
        debug!("retry coordinator started");

        while let Some(completion) = self.completion_rx.recv().await {
            let handle = completion.job.handle;
            let submitted_at = completion.job.submitted_at;
            let panicked = completion.outcome == Outcome::Panicked;
            let decision = decide(completion, self.clock.now_ms());

            match &decision {
                Decision::Completed(_) => debug!(%handle, "job completed"),
                Decision::Retry(job) => info!(
                    %handle,
                    retry = job.retry_count,
                    max_retries = job.max_retries,
                    due_ms = job.key.due_ms,
                    panicked,
                    "job failed, scheduled retry"
                ),
                Decision::Exhausted(_) => warn!(
                    %handle,
                    %submitted_at,
                    panicked,
                    "job failed, retries exhausted"
                ),
            }

            if self.command_tx.send(decision.into_command()).await.is_err() {
                debug!("scheduler loop gone, stopping retry coordinator");
                break;
            }
        }

        debug!("retry coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;

    fn completion(retry_count: u32, max_retries: u32, outcome: Outcome) -> Completion {
        let mut job = Job::new(JobHandle(9), 50, Duration::from_millis(50), max_retries, None);
        job.retry_count = retry_count;
        Completion { job, outcome }
    }

    #[test]
    fn test_success_completes() {
        let decision = decide(completion(1, 2, Outcome::Succeeded), 500);
        assert!(matches!(decision, Decision::Completed(JobHandle(9))));
    }

    #[test]
    fn test_first_failure_retries_after_one_interval() {
        match decide(completion(0, 2, Outcome::Failed), 500) {
            Decision::Retry(job) => {
                assert_eq!(job.retry_count, 1);
                assert_eq!(job.key, OrderKey::new(550, 0));
                assert_eq!(job.handle, JobHandle(9));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_second_failure_backs_off_linearly() {
        match decide(completion(1, 2, Outcome::Failed), 500) {
            Decision::Retry(job) => {
                assert_eq!(job.retry_count, 2);
                assert_eq!(job.key.due_ms, 600);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_past_budget_exhausts() {
        let decision = decide(completion(2, 2, Outcome::Failed), 500);
        assert!(matches!(decision, Decision::Exhausted(JobHandle(9))));
    }

    #[test]
    fn test_panic_counts_as_failure() {
        assert!(matches!(
            decide(completion(0, 2, Outcome::Panicked), 0),
            Decision::Retry(_)
        ));
        assert!(matches!(
            decide(completion(2, 2, Outcome::Panicked), 0),
            Decision::Exhausted(_)
        ));
    }

    #[test]
    fn test_zero_retries_exhausts_immediately() {
        let decision = decide(completion(0, 0, Outcome::Failed), 0);
        assert!(matches!(decision, Decision::Exhausted(_)));
    }

    #[test]
    fn test_retry_count_saturates() {
        match decide(completion(u32::MAX, u32::MAX, Outcome::Failed), 500) {
            Decision::Retry(job) => {
                assert_eq!(job.retry_count, u32::MAX);
                assert!(job.key.due_ms > 500);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_cleanup_commands_are_internal() {
        let command = Decision::Exhausted(JobHandle(3)).into_command();
        assert!(matches!(
            command,
            Command::Remove {
                handle: JobHandle(3),
                internal: true
            }
        ));
        let command = Decision::Completed(JobHandle(4)).into_command();
        assert!(matches!(command, Command::Remove { internal: true, .. }));
    }

    proptest! {
        // A job that always fails is attempted exactly max_retries + 1 times
        #[test]
        fn always_failing_job_attempt_count(max_retries in 0u32..8) {
            let mut attempts = 1;
            let mut current = completion(0, max_retries, Outcome::Failed);
            loop {
                match decide(current, 0) {
                    Decision::Retry(job) => {
                        attempts += 1;
                        current = Completion { job, outcome: Outcome::Failed };
                    }
                    Decision::Exhausted(_) => break,
                    Decision::Completed(_) => {
                        prop_assert!(false, "failure never completes");
                        break;
                    }
                }
            }
            prop_assert_eq!(attempts, max_retries + 1);
        }

        // Retries are spaced by interval * attempt number
        #[test]
        fn retry_due_is_linear(retry_count in 0u32..5, now_ms in 0u64..100_000) {
            match decide(completion(retry_count, 10, Outcome::Failed), now_ms) {
                Decision::Retry(job) => {
                    prop_assert_eq!(job.key.due_ms, now_ms + 50 * u64::from(retry_count + 1));
                    prop_assert_eq!(job.key.sequence, 0);
                }
                other => prop_assert!(false, "expected retry, got {:?}", other),
            }
        }
    }
}
