//! Strict-priority task scheduler with bounded concurrency.
//!
//! Tasks carry one of four priority classes. The pump loop selects the
//! head of the highest non-empty queue — strictly `Critical > High >
//! Normal > Low`, via a `biased` `tokio::select!` over per-class channels —
//! then acquires one of a fixed number of concurrency permits (blocking
//! the pump, never tasks already running) and spawns the work. Completion
//! callbacks are posted to a single consumer loop, the designated
//! execution context: exactly one of `on_success`/`on_error`/`on_cancel`
//! fires per task, and callback bodies never overlap. Ordering among
//! callbacks is not guaranteed.
//!
//! Priority is a selection guarantee, not a completion guarantee: with the
//! cap saturated, a running Low task may finish after a later-enqueued
//! Critical task. Sustained Critical/High load starves Low indefinitely —
//! an accepted trade-off of strict selection, deliberately not "fixed"
//! with weighted fairness.
//!
//! Work panics are caught at the pump boundary and delivered through
//! `on_error`; they never crash the pump loop.


use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::panic::format_panic;

/// Default concurrency cap.
pub const DEFAULT_CONCURRENCY: usize = 24;

/// Strict precedence tiers governing dequeue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Drained before everything else.
    Critical,
    /// Drained before Normal and Low.
    High,
    /// The default class.
    Normal,
    /// Only drained when every other queue is empty.
    Low,
}

impl Priority {
    /// All classes in precedence order.
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Normal, Self::Low];

    const fn index(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

/// Boxed error type carried by failed task work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Task work: a closure receiving the task's cancellation handle and
/// returning the future to run.
pub type TaskWork<O> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<O, BoxError>> + Send>;

/// One schedulable unit of work plus its completion callbacks.
pub struct TaskSpec<O> {
    /// Name used in logs and panic reports.
    pub name: String,
    /// Priority class.
    pub priority: Priority,
    /// Cancellation handle; cancelling it delivers `on_cancel` unless the
    /// work already completed.
    pub cancel: CancellationToken,
    work: TaskWork<O>,
    on_success: Box<dyn FnOnce(O) + Send>,
    on_error: Box<dyn FnOnce(BoxError) + Send>,
    on_cancel: Box<dyn FnOnce() + Send>,
}

impl<O> TaskSpec<O> {
    /// Build a task with no-op callbacks.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: Priority, work: TaskWork<O>) -> Self {
        Self {
            name: name.into(),
            priority,
            cancel: CancellationToken::new(),
            work,
            on_success: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
            on_cancel: Box::new(|| {}),
        }
    }

    /// Use an externally owned cancellation handle.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Callback delivered when the work returns `Ok`.
    #[must_use]
    pub fn on_success(mut self, callback: impl FnOnce(O) + Send + 'static) -> Self {
        self.on_success = Box::new(callback);
        self
    }

    /// Callback delivered when the work returns `Err` or panics.
    #[must_use]
    pub fn on_error(mut self, callback: impl FnOnce(BoxError) + Send + 'static) -> Self {
        self.on_error = Box::new(callback);
        self
    }

    /// Callback delivered when the task is cancelled before completion.
    #[must_use]
    pub fn on_cancel(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_cancel = Box::new(callback);
        self
    }
}

/// Errors surfaced by [`Scheduler::enqueue`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// [`Scheduler::stop_all`] was called; no further work is accepted.
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Handle to a running scheduler.
///
/// Dropping the handle does not stop in-flight work; call
/// [`stop_all`](Self::stop_all) for the emergency-shutdown path.
pub struct Scheduler<O> {
    queues: [mpsc::UnboundedSender<TaskSpec<O>>; 4],
    shutdown: CancellationToken,
}

impl<O: Send + 'static> Scheduler<O> {
    /// Start a scheduler with `concurrency` permits.
    ///
    /// Spawns the pump loop and the completion consumer; must be called
    /// within a Tokio runtime.
    #[must_use]
    pub fn new(concurrency: usize) -> Self {
        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<Delivery>();
        // The designated execution context: one consumer, callbacks are
        // invoked strictly one at a time.
        tokio::spawn(async move {
            while let Some(deliver) = completion_rx.recv().await {
                deliver();
            }
        });

        let (critical_tx, critical_rx) = mpsc::unbounded_channel();
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        tokio::spawn(pump(
            [critical_rx, high_rx, normal_rx, low_rx],
            Arc::new(Semaphore::new(concurrency)),
            completion_tx,
            shutdown.clone(),
        ));

        Self {
            queues: [critical_tx, high_tx, normal_tx, low_tx],
            shutdown,
        }
    }

    /// Start a scheduler with the default concurrency cap.
    #[must_use]
    pub fn with_default_concurrency() -> Self { Self::new(DEFAULT_CONCURRENCY) }

    /// Place a task at the tail of its priority class's queue.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::ShutDown`] after [`stop_all`](Self::stop_all);
    /// the task is dropped without any callback, surfacing the rejection
    /// synchronously instead.
    pub fn enqueue(&self, task: TaskSpec<O>) -> Result<(), SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        self.queues[task.priority.index()]
            .send(task)
            .map_err(|_| SchedulerError::ShutDown)
    }

    /// Cancel every queued and in-flight task and halt the pump.
    ///
    /// Queued tasks receive `on_cancel`; in-flight tasks are cancelled and
    /// receive `on_cancel` unless their work already completed. Idempotent.
    pub fn stop_all(&self) { self.shutdown.cancel(); }
}

/// A completion callback, boxed for delivery on the completion context.
type Delivery = Box<dyn FnOnce() + Send>;

enum Outcome<O> {
    Success(O),
    Error(BoxError),
    Cancelled,
}

async fn pump<O: Send + 'static>(
    queues: [mpsc::UnboundedReceiver<TaskSpec<O>>; 4],
    permits: Arc<Semaphore>,
    completions: mpsc::UnboundedSender<Delivery>,
    shutdown: CancellationToken,
) {
    let [mut critical, mut high, mut normal, mut low] = queues;

    loop {
        // Selection: strictly highest class first. `biased` makes the poll
        // order the declaration order, so a Low task is never taken while
        // a higher queue holds one.
        let task = tokio::select! {
            biased;

            () = shutdown.cancelled() => break,
            Some(task) = critical.recv() => task,
            Some(task) = high.recv() => task,
            Some(task) = normal.recv() => task,
            Some(task) = low.recv() => task,
            else => break,
        };

        // One permit per running task; acquisition blocks the pump (not
        // tasks already running) until a permit frees up.
        let permit = tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                deliver_cancel(&completions, task);
                break;
            }
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let completions = completions.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(run_task(task, permit, completions, shutdown));
    }

    // Emergency shutdown: everything still queued is cancelled, exactly
    // one callback each.
    for queue in [&mut critical, &mut high, &mut normal, &mut low] {
        queue.close();
        while let Ok(task) = queue.try_recv() {
            deliver_cancel(&completions, task);
        }
    }
    debug!("scheduler pump halted");
}

async fn run_task<O: Send + 'static>(
    task: TaskSpec<O>,
    permit: tokio::sync::OwnedSemaphorePermit,
    completions: mpsc::UnboundedSender<Delivery>,
    shutdown: CancellationToken,
) {
    let TaskSpec {
        name,
        cancel,
        work,
        on_success,
        on_error,
        on_cancel,
        ..
    } = task;

    let work_fut = AssertUnwindSafe((work)(cancel.clone())).catch_unwind();
    let outcome = tokio::select! {
        biased;

        () = shutdown.cancelled() => Outcome::Cancelled,
        () = cancel.cancelled() => Outcome::Cancelled,
        finished = work_fut => match finished {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(error)) => Outcome::Error(error),
            Err(panic) => {
                let message = format!("task '{name}' panicked: {}", format_panic(panic));
                Outcome::Error(message.into())
            }
        },
    };

    // Release the permit before delivery so the pump can start the next
    // task while the callback waits its turn on the completion context.
    drop(permit);

    let deliver: Delivery = match outcome {
        Outcome::Success(value) => Box::new(move || on_success(value)),
        Outcome::Error(error) => Box::new(move || on_error(error)),
        Outcome::Cancelled => on_cancel,
    };
    if completions.send(deliver).is_err() {
        debug!(task = %name, "completion context gone; dropping callback");
    }
}

fn deliver_cancel<O>(completions: &mpsc::UnboundedSender<Delivery>, task: TaskSpec<O>) {
    if completions.send(task.on_cancel).is_err() {
        debug!(task = %task.name, "completion context gone; dropping cancel callback");
    }
}
