use super::shared::{WorkerShared, WorkerState};
use super::types::Batch;
use crate::queueing::queues::QueueSlot;

const DELETE_LANES: &[QueueSlot] = &[QueueSlot::Removing];
const WRITE_LANES: &[QueueSlot] = &[QueueSlot::Adding, QueueSlot::Updating];

impl WorkerShared {
    /// Claims the next batch under the worker lock. An empty batch means there is nothing
    /// worth writing yet.
    pub(crate) fn build_batch(&self, state: &WorkerState) -> Batch {
        let queues = &state.queues;
        let max_tasks = self.max_tasks(state);
        let min_bytes = self.limits.min_bytes_per_batch;
        let max_bytes = self.limits.max_bytes_per_batch;
        let mut batch = Batch::default();

        let ready = queues.queued_len() >= max_tasks
            || queues.dispatched_bytes() >= min_bytes
            || queues.has_waiting();
        if !ready {
            return batch;
        }

        let lanes = if queues.len(QueueSlot::Removing) > 0 {
            DELETE_LANES
        } else {
            WRITE_LANES
        };

        'lanes: for &slot in lanes {
            for entry in queues.entries(slot) {
                if batch.len() >= max_tasks || batch.bytes >= max_bytes {
                    break 'lanes;
                }

                // Leave small trailing work queued so deletes still have a chance to
                // retract it.
                let remaining = queues.dispatched_bytes().saturating_sub(batch.bytes);
                if batch.bytes >= min_bytes && remaining < min_bytes {
                    break 'lanes;
                }

                let element = entry.element.clone();
                let mut flags = element.lock_flags();
                if flags.cancelled || flags.batched {
                    continue;
                }
                if element.is_update() && element.operation().is_item_removing() {
                    continue;
                }
                if !batch.is_empty() && batch.bytes.saturating_add(element.size()) >= max_bytes {
                    break 'lanes;
                }

                flags.batched = true;
                drop(flags);
                batch.push(entry);
            }
        }

        if !batch.is_empty() {
            tracing::debug!(
                worker = self.id,
                tasks = batch.len(),
                bytes = batch.bytes,
                oldest_ms = batch.oldest_age().as_millis() as u64,
                deletes = lanes == DELETE_LANES,
                "built spill batch"
            );
        }
        batch
    }
}
