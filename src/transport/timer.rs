//! Cancellable timers on a shared tokio runtime.
//!
//! Every guard and wakeup in a transport is a [`TimerHandle`] owned by the
//! transport or its keepalive predictor. Dropping or cancelling the handle
//! aborts the task. Callbacks only ever capture `Weak` references, so a
//! timer that outlives its owner does nothing when it fires.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};
use tracing::warn;

/// Spawns timer and deferred work on a tokio runtime.
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Option<Handle>,
}

impl Scheduler {
    /// Use the runtime of the calling context, if there is one.
    pub fn current() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }

    /// Use an explicit runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Whether a runtime is attached.
    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// Run `f` soon on the runtime.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move { f() });
    }

    /// Run `f` after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, f: F) -> Option<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, f)
    }

    /// Run `f` at `deadline`.
    pub fn schedule_at<F>(&self, deadline: Instant, f: F) -> Option<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            time::sleep_until(deadline).await;
            f();
        })
        .map(|abort| TimerHandle {
            abort: Some(abort),
            deadline,
        })
    }

    /// Spawn a future on the runtime. `None` if no runtime is attached.
    pub fn spawn<T>(&self, task: T) -> Option<AbortHandle>
    where
        T: Future<Output = ()> + Send + 'static,
    {
        match &self.handle {
            Some(handle) => Some(handle.spawn(task).abort_handle()),
            None => {
                warn!("no tokio runtime attached; deferred work dropped");
                None
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::current()
    }
}

/// Owned, cancellable timer. Aborts its task when dropped.
#[derive(Debug)]
pub struct TimerHandle {
    abort: Option<AbortHandle>,
    deadline: Instant,
}

impl TimerHandle {
    /// When the timer fires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Abort the timer if it has not fired yet.
    pub fn cancel(mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }

    /// Release the handle without aborting. Used by a timer clearing its
    /// own slot from inside its callback.
    pub fn disarm(mut self) {
        self.abort = None;
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_deadline() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _timer = scheduler
            .schedule_after(Duration::from_millis(100), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = scheduler
            .schedule_after(Duration::from_millis(10), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        drop(timer);

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_timer_still_fires() {
        let scheduler = Scheduler::current();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        scheduler
            .schedule_after(Duration::from_millis(10), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
            .disarm();

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_scheduler_drops_work() {
        let scheduler = Scheduler { handle: None };
        assert!(!scheduler.is_attached());
        assert!(scheduler.schedule_after(Duration::ZERO, || {}).is_none());
    }
}
