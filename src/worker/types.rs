use crate::queueing::queues::QueueEntry;
use crate::runtime::config::DispatcherConfig;
use std::time::Duration;

/// Write-error state of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorState {
    Healthy,
    /// One failed write; the worker retries without delay.
    WriteError,
    /// Two or more consecutive failures; the worker counts against dispatcher health.
    RepeatedError,
}

/// Point-in-time view of a worker's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub queued: usize,
    pub waiting: usize,
    pub dispatched_bytes: usize,
    pub error_state: WriteErrorState,
}

/// Batch and admission thresholds copied out of [`DispatcherConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchLimits {
    pub min_bytes_per_batch: usize,
    pub max_bytes_per_batch: usize,
    pub max_tasks_per_batch: usize,
    pub max_dispatched_bytes: usize,
}

impl From<&DispatcherConfig> for BatchLimits {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            min_bytes_per_batch: config.min_bytes_per_batch(),
            max_bytes_per_batch: config.max_bytes_per_batch(),
            max_tasks_per_batch: config.max_tasks_per_batch(),
            max_dispatched_bytes: config.max_dispatched_bytes_per_worker(),
        }
    }
}

/// Result of admitting one operation to a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Admission {
    /// The operation was parked and the caller has to wait for promotion.
    pub must_wait: bool,
    /// A pending add for the same item was retracted, so the delete itself was dropped.
    pub cancelled: bool,
}

/// Elements claimed by one batch-building pass.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub entries: Vec<QueueEntry>,
    pub bytes: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time the longest-waiting element has spent since its dispatch.
    pub fn oldest_age(&self) -> Duration {
        self.entries
            .iter()
            .map(|entry| entry.element.age())
            .max()
            .unwrap_or_default()
    }

    pub(crate) fn push(&mut self, entry: QueueEntry) {
        self.bytes = self.bytes.saturating_add(entry.element.size());
        self.entries.push(entry);
    }
}
