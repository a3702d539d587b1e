use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle phase derived from a [`HealthSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherPhase {
    NotStarted,
    Running,
    StopRequested,
    Stopped,
}

/// Immutable view of dispatcher health. A new snapshot replaces the old one on every
/// transition; fields are never updated in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    running: bool,
    stop_requested: bool,
    stopped: bool,
    thread_write_error_count: usize,
}

impl HealthSnapshot {
    pub fn running(&self) -> bool {
        self.running
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Number of workers currently registered as failing repeatedly.
    pub fn thread_write_error_count(&self) -> usize {
        self.thread_write_error_count
    }

    pub fn is_healthy(&self) -> bool {
        self.running && !self.stop_requested && self.thread_write_error_count == 0
    }

    pub fn phase(&self) -> DispatcherPhase {
        if self.stopped {
            DispatcherPhase::Stopped
        } else if self.stop_requested {
            DispatcherPhase::StopRequested
        } else if self.running {
            DispatcherPhase::Running
        } else {
            DispatcherPhase::NotStarted
        }
    }
}

/// Shared owner of the current [`HealthSnapshot`] plus the live-worker count used to
/// detect the last worker exit.
#[derive(Debug, Default)]
pub struct HealthState {
    current: ArcSwap<HealthSnapshot>,
    live_workers: AtomicUsize,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        **self.current.load()
    }

    pub fn is_healthy(&self) -> bool {
        self.current.load().is_healthy()
    }

    /// Moves from `NotStarted` to `Running` with `workers` live workers. Returns false if
    /// the dispatcher was already started or stopped.
    pub(crate) fn mark_running(&self, workers: usize) -> bool {
        self.live_workers.store(workers, Ordering::SeqCst);
        let previous = self.current.rcu(|current| {
            let mut next = **current;
            if current.phase() == DispatcherPhase::NotStarted {
                next.running = true;
            }
            next
        });
        previous.phase() == DispatcherPhase::NotStarted
    }

    /// Sets the stop-requested flag. Only the first caller gets `true`.
    pub(crate) fn request_stop(&self) -> bool {
        let previous = self.current.rcu(|current| {
            let mut next = **current;
            next.stop_requested = true;
            if current.phase() == DispatcherPhase::NotStarted {
                next.stopped = true;
            }
            next
        });
        !previous.stop_requested
    }

    /// Records a worker exit; the last one flips the snapshot to stopped.
    pub(crate) fn worker_exited(&self) {
        let previous = self
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                Some(live.saturating_sub(1))
            })
            .unwrap_or(0);

        if previous <= 1 {
            self.current.rcu(|current| {
                let mut next = **current;
                next.running = false;
                next.stopped = true;
                next
            });
        }
    }

    pub(crate) fn write_error_occurred(&self) -> usize {
        let previous = self.current.rcu(|current| {
            let mut next = **current;
            next.thread_write_error_count = current.thread_write_error_count.saturating_add(1);
            next
        });
        previous.thread_write_error_count + 1
    }

    pub(crate) fn write_error_cleared(&self) -> usize {
        let previous = self.current.rcu(|current| {
            let mut next = **current;
            next.thread_write_error_count = current.thread_write_error_count.saturating_sub(1);
            next
        });
        previous.thread_write_error_count.saturating_sub(1)
    }
}
