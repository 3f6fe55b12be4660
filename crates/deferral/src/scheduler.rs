//! Scheduler loop and public handle.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, trace};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::SchedulerError;
use crate::handle::{HandleSource, SnowflakeSource};
use crate::index::{Cancelled, JobIndex};
use crate::retry::RetryCoordinator;
use crate::types::{Job, JobHandle, JobOptions};

/// Commands processed by the scheduler loop.
pub(crate) enum Command {
    /// Admit a new job or a retry.
    Add(Job),
    /// Remove a handle. `internal` removals come from the retry coordinator
    /// after the job already left the time index.
    Remove { handle: JobHandle, internal: bool },
    /// Report loop state.
    Snapshot {
        response: oneshot::Sender<SchedulerSnapshot>,
    },
    /// Report whether a handle is still tracked.
    Contains {
        handle: JobHandle,
        response: oneshot::Sender<bool>,
    },
}

/// What the loop timer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TimerState {
    /// No pending jobs; the timer holds the long idle wait.
    Idle,
    /// Armed for the earliest pending job.
    Armed { due_ms: u64 },
}

/// Point-in-time view of the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Jobs waiting in the time index.
    pub pending: usize,
    /// Handles still resolvable, pending or in flight.
    pub tracked: usize,
    /// Current timer target.
    pub timer: TimerState,
    /// Loop clock reading, in milliseconds since start.
    pub now_ms: u64,
}

/// Handle to a running scheduler.
///
/// Cheap to clone; every clone talks to the same loop. The loop stops when
/// [`shutdown`](Self::shutdown) is called or the last clone is dropped.
#[derive(Clone)]
pub struct Scheduler {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    handles: Arc<dyn HandleSource>,
    clock: Clock,
    max_retries: u32,
}

impl Scheduler {
    /// Start a scheduler with the default snowflake handle source.
    ///
    /// Spawns the loop and the retry coordinator on the current tokio runtime.
    pub fn start(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let handles = Arc::new(SnowflakeSource::new(config.node_id));
        Self::start_with_source(config, handles)
    }

    /// Start a scheduler that takes handles from `handles`.
    pub fn start_with_source(
        config: SchedulerConfig,
        handles: Arc<dyn HandleSource>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let clock = Clock::new();
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let event_loop = SchedulerLoop {
            index: JobIndex::new(),
            command_rx,
            shutdown_rx,
            dispatcher: Dispatcher::new(completion_tx, config.max_concurrency),
            clock,
            idle_wait: config.idle_wait(),
            timer: TimerState::Idle,
        };
        let coordinator = RetryCoordinator::new(completion_rx, command_tx.clone(), clock);

        runtime.spawn(event_loop.run());
        runtime.spawn(coordinator.run());

        info!(
            max_retries = config.max_retries,
            max_concurrency = ?config.max_concurrency,
            command_capacity = config.command_capacity,
            completion_capacity = config.completion_capacity,
            "scheduler started"
        );

        Ok(Self {
            command_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            handles,
            clock,
            max_retries: config.max_retries,
        })
    }

    /// Run `callback` no earlier than `delay` from now.
    ///
    /// Returns as soon as the request is queued; the job may not be admitted
    /// yet. A callback returning `false` is retried with linear backoff up to
    /// the configured retry budget.
    pub async fn submit<F>(&self, delay: Duration, callback: F) -> Result<JobHandle, SchedulerError>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.submit_with(delay, JobOptions::new(callback)).await
    }

    /// Like [`submit`](Self::submit), with per-job options.
    #[tracing::instrument(skip(self, options), fields(max_retries = ?options.max_retries))]
    pub async fn submit_with(
        &self,
        delay: Duration,
        options: JobOptions,
    ) -> Result<JobHandle, SchedulerError> {
        let handle = self.handles.next_handle();
        let due_ms = self.clock.due_after(delay);
        let job = Job::new(
            handle,
            due_ms,
            delay,
            options.max_retries.unwrap_or(self.max_retries),
            options.callback,
        );

        self.send(Command::Add(job)).await?;
        debug!(%handle, due_ms, "submitted job");
        Ok(handle)
    }

    /// Ask the loop to drop `handle` before it fires.
    ///
    /// Best effort: a job already handed to the dispatcher still runs once,
    /// but will not be retried.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, handle: JobHandle) -> Result<(), SchedulerError> {
        self.send(Command::Remove {
            handle,
            internal: false,
        })
        .await
    }

    /// Current loop state.
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerError> {
        let (response, response_rx) = oneshot::channel();
        self.send(Command::Snapshot { response }).await?;
        response_rx.await.map_err(|_| SchedulerError::ResponseDropped)
    }

    /// Whether `handle` is still pending or awaiting a retry decision.
    pub async fn is_tracked(&self, handle: JobHandle) -> Result<bool, SchedulerError> {
        let (response, response_rx) = oneshot::channel();
        self.send(Command::Contains { handle, response }).await?;
        response_rx.await.map_err(|_| SchedulerError::ResponseDropped)
    }

    /// Stop the loop and wait until it has exited.
    ///
    /// Pending jobs are discarded. Callbacks already running finish, but
    /// their retries are not scheduled.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("scheduler loop already stopped");
        }
        self.command_tx.closed().await;
    }

    /// Whether the loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.command_tx.is_closed()
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }
}

/// Sole owner of the job indices.
struct SchedulerLoop {
    index: JobIndex,
    command_rx: mpsc::Receiver<Command>,
    shutdown_rx: watch::Receiver<bool>,
    dispatcher: Dispatcher,
    clock: Clock,
    idle_wait: Duration,
    timer: TimerState,
}

impl SchedulerLoop {
    async fn run(mut self) {
        info!("scheduler loop starting");

        let sleep = tokio::time::sleep(self.idle_wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    // The sender lives inside every `Scheduler` clone.
                    if changed.is_err() {
                        info!("all scheduler handles dropped");
                        break;
                    }
                    if *self.shutdown_rx.borrow() {
                        info!("scheduler loop received shutdown signal");
                        break;
                    }
                }
                // The retry coordinator holds a command sender for as long as
                // this loop runs, so the channel never closes first.
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                () = &mut sleep => {
                    if self.index.is_empty() {
                        trace!("timer fired with no pending jobs");
                        self.arm(sleep.as_mut(), None);
                    }
                }
            }

            self.sweep(sleep.as_mut());
            trace!(
                pending = self.index.pending_len(),
                tracked = self.index.tracked_len(),
                timer = ?self.timer,
                "loop iteration complete"
            );
        }

        info!(
            pending = self.index.pending_len(),
            tracked = self.index.tracked_len(),
            "scheduler loop stopped"
        );
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Add(job) => {
                let handle = job.handle;
                if self.index.admit(job).is_none() {
                    debug!(%handle, "retry arrived after cancellation, dropped");
                }
            }
            Command::Remove {
                handle,
                internal: true,
            } => {
                self.index.forget(handle);
            }
            Command::Remove {
                handle,
                internal: false,
            } => match self.index.cancel(handle) {
                Cancelled::Pending(key) => {
                    debug!(%handle, due_ms = key.due_ms, "cancelled pending job")
                }
                Cancelled::InFlight => {
                    debug!(%handle, "cancelled in-flight job, retries suppressed")
                }
                Cancelled::Unknown => trace!(%handle, "cancel for unknown handle"),
            },
            Command::Snapshot { response } => {
                let _ = response.send(SchedulerSnapshot {
                    pending: self.index.pending_len(),
                    tracked: self.index.tracked_len(),
                    timer: self.timer,
                    now_ms: self.clock.now_ms(),
                });
            }
            Command::Contains { handle, response } => {
                let _ = response.send(self.index.contains(handle));
            }
        }
    }

    /// Dispatch everything due and re-arm the timer for what remains.
    fn sweep(&mut self, sleep: Pin<&mut Sleep>) {
        let now_ms = self.clock.now_ms();
        let sweep = self.index.take_due(now_ms);

        if !sweep.due.is_empty() || sweep.dropped > 0 {
            debug!(
                count = sweep.due.len(),
                dropped = sweep.dropped,
                now_ms,
                "dispatching due jobs"
            );
        }
        for job in sweep.due {
            self.dispatcher.dispatch(job);
        }

        self.arm(sleep, sweep.next_due_ms);
    }

    /// Point the single timer at `next_due_ms`, or at the idle wait.
    ///
    /// `Sleep::reset` replaces the deadline outright, so an expiry that was
    /// already pending cannot leak into the next iteration.
    fn arm(&mut self, sleep: Pin<&mut Sleep>, next_due_ms: Option<u64>) {
        match next_due_ms {
            Some(due_ms) => {
                sleep.reset(self.clock.instant_at(due_ms));
                self.timer = TimerState::Armed { due_ms };
            }
            None => {
                let deadline = Instant::now()
                    .checked_add(self.idle_wait)
                    .unwrap_or_else(|| self.clock.instant_at(u64::MAX));
                sleep.reset(deadline);
                self.timer = TimerState::Idle;
            }
        }
    }
}
