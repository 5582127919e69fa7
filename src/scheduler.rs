//! Cancellable one-shot and periodic tasks.
//!
//! Auto-stop, the lighting frame clock and the MIDI reconnect loop all run
//! through a [`Scheduler`]. Every task is tracked by a [`TaskHandle`] whose
//! cancelled flag is checked right before the body runs, so a task that fires
//! while it is being cancelled does nothing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

/// Result returned by a task body. Errors are logged, never propagated.
pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Could not start the scheduler runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

pub struct Scheduler {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Scheduler {
    /// Starts a scheduler on its own small runtime.
    pub fn new() -> Result<Self, SchedulerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stagehand-scheduler")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Schedules onto an already running runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `task` once after `delay`, unless cancelled first.
    pub fn schedule_once<F>(&self, name: &'static str, delay: Duration, task: F) -> TaskHandle
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::Acquire) {
                return;
            }
            let outcome = tokio::task::spawn_blocking(task).await;
            log_outcome(name, outcome);
        });
        TaskHandle {
            cancelled,
            abort: Some(join.abort_handle()),
        }
    }

    /// Runs `task` every `period`, starting immediately. A failing or
    /// panicking tick is logged and the next tick still runs.
    pub fn schedule_periodic<F>(&self, name: &'static str, period: Duration, task: F) -> TaskHandle
    where
        F: Fn() -> TaskResult + Send + Sync + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let task = Arc::new(task);
        let period = period.max(Duration::from_millis(1));
        let join = self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let tick = Arc::clone(&task);
                let outcome = tokio::task::spawn_blocking(move || tick()).await;
                log_outcome(name, outcome);
            }
        });
        TaskHandle {
            cancelled,
            abort: Some(join.abort_handle()),
        }
    }
}

fn log_outcome(name: &str, outcome: Result<TaskResult, tokio::task::JoinError>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "Scheduled task failed"),
        Err(e) if e.is_panic() => tracing::error!(task = name, "Scheduled task panicked"),
        Err(_) => {}
    }
}

/// Cancellation token for a scheduled task.
#[derive(Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    /// Marks the task cancelled and aborts it. Calling this more than once is fine.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
