//! Shared timer service and bounded task dispatch
//!
//! One periodic mechanism serves every timeout in the stack: DISCOVER_MAIN
//! escalation, election windows, leader heartbeats and idle-link sweeps.
//! A listener's `signal` must be fast and non-blocking; its return value
//! decides whether it is scheduled again, so one-shot and periodic timers
//! share one code path.

pub mod pool;

pub use pool::TaskPool;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receiver of timer signals
pub trait TimerListener: Send + Sync {
    /// Called once per period. Return `true` to be scheduled again.
    fn signal(&self, tag: &str, payload: Option<&str>) -> bool;
}

impl<F> TimerListener for F
where
    F: Fn(&str, Option<&str>) -> bool + Send + Sync,
{
    fn signal(&self, tag: &str, payload: Option<&str>) -> bool {
        self(tag, payload)
    }
}

/// Handle to one registration
#[derive(Debug)]
pub struct TimerHandle {
    task: tokio::task::AbortHandle,
}

impl TimerHandle {
    /// Stop delivering signals
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Owner of every timer task of one node
#[derive(Default)]
pub struct TimerService {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `signal(tag, payload)` to `listener` every `period` until it
    /// returns `false`, the handle is cancelled, or the service shuts down.
    pub fn register(
        &self,
        listener: Arc<dyn TimerListener>,
        period: Duration,
        tag: impl Into<String>,
        payload: Option<String>,
    ) -> TimerHandle {
        let tag = tag.into();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !listener.signal(&tag, payload.as_deref()) {
                    debug!(tag = %tag, "timer finished");
                    break;
                }
            }
        });
        let handle = TimerHandle {
            task: task.abort_handle(),
        };

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        if self.stopped.load(Ordering::SeqCst) {
            task.abort();
        } else {
            tasks.push(task);
        }
        handle
    }

    /// One-shot convenience: fire once after `delay`
    pub fn schedule_once<F>(&self, delay: Duration, tag: impl Into<String>, f: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let listener = move |_: &str, _: Option<&str>| {
            f();
            false
        };
        self.register(Arc::new(listener), delay, tag, None)
    }

    /// Number of live registrations
    pub fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Abort every registration; later registrations are inert
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
