use super::errors::WriteErrorTracker;
use super::types::{BatchLimits, WorkerStats};
use crate::dispatcher::health::HealthState;
use crate::queueing::queues::DispatchQueues;
use crate::runtime::backoff::RetryBackoff;
use crate::runtime::config::DispatcherConfig;
use crate::runtime::telemetry::Telemetry;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Everything guarded by the per-worker lock.
#[derive(Debug)]
pub(crate) struct WorkerState {
    pub queues: DispatchQueues,
    pub errors: WriteErrorTracker,
    /// False while the worker is parked waiting for a wake-up.
    pub active: bool,
    pub wake_pending: bool,
    /// Set by admission when an element at the byte ceiling went to the front of a lane.
    pub oversized_admitted: bool,
    /// Set once shutdown has discarded the waiting queue.
    pub closed: bool,
}

/// State of one worker shared between its task and the dispatching callers.
#[derive(Debug)]
pub struct WorkerShared {
    pub(crate) id: usize,
    pub(crate) limits: BatchLimits,
    state: Mutex<WorkerState>,
    pub(super) wake: Notify,
    pub(super) health: Arc<HealthState>,
    pub(super) telemetry: Arc<Telemetry>,
}

pub(crate) struct WorkerSharedParams {
    pub id: usize,
    pub config: DispatcherConfig,
    pub health: Arc<HealthState>,
    pub telemetry: Arc<Telemetry>,
}

impl WorkerShared {
    pub(crate) fn new(params: WorkerSharedParams) -> Self {
        let WorkerSharedParams {
            id,
            config,
            health,
            telemetry,
        } = params;

        let backoff = RetryBackoff::new(config.retry_initial_delay(), config.retry_max_delay());
        Self {
            id,
            limits: BatchLimits::from(&config),
            state: Mutex::new(WorkerState {
                queues: DispatchQueues::new(),
                errors: WriteErrorTracker::new(backoff, config.writes_to_reset_error_state()),
                active: true,
                wake_pending: false,
                oversized_admitted: false,
                closed: false,
            }),
            wake: Notify::new(),
            health,
            telemetry,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().expect("worker state mutex poisoned")
    }

    /// Task ceiling for the next batch: one while the worker is in write-error state.
    pub(crate) fn max_tasks(&self, state: &WorkerState) -> usize {
        if state.errors.in_error() {
            1
        } else {
            self.limits.max_tasks_per_batch
        }
    }

    pub fn stats(&self) -> WorkerStats {
        let state = self.lock_state();
        WorkerStats {
            queued: state.queues.queued_len(),
            waiting: state.queues.waiting_len(),
            dispatched_bytes: state.queues.dispatched_bytes(),
            error_state: state.errors.state(),
        }
    }

    /// Wakes the worker if it is idle and the queues justify a batch-building pass.
    pub(crate) fn notify_dispatch_arrived(&self) {
        let mut state = self.lock_state();
        let oversized = std::mem::take(&mut state.oversized_admitted);
        if state.active || state.wake_pending {
            return;
        }

        let wanted = oversized
            || state.queues.queued_len() >= self.max_tasks(&state)
            || state.queues.dispatched_bytes() >= self.limits.min_bytes_per_batch
            || state.queues.has_waiting();
        if !wanted {
            return;
        }

        state.wake_pending = true;
        drop(state);
        tracing::trace!(worker = self.id, "waking spill worker");
        self.wake.notify_one();
    }

    pub(super) fn unpark(&self) {
        let mut state = self.lock_state();
        state.active = true;
        state.wake_pending = false;
    }

    /// Releases every parked caller without writing their elements and refuses further
    /// parking.
    pub(crate) fn discard_waiting(&self) -> usize {
        let drained = {
            let mut state = self.lock_state();
            state.closed = true;
            state.queues.drain_waiting()
        };

        for element in &drained {
            element.release_discarded();
        }

        if !drained.is_empty() {
            tracing::info!(
                worker = self.id,
                discarded = drained.len(),
                "discarded waiting spill operations on shutdown"
            );
        }
        drained.len()
    }
}
