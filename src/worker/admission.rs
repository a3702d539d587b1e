use super::shared::{WorkerShared, WorkerState};
use super::types::Admission;
use crate::error::DispatchError;
use crate::operation::OperationRef;
use crate::queueing::element::QueueElement;
use crate::queueing::notifier::CompletionNotifier;
use crate::queueing::queues::{QueueEntry, QueueSlot};
use std::sync::Arc;
use std::time::Instant;

impl WorkerShared {
    /// Admits one operation. Deletes first try to retract pending work for their item.
    pub(crate) fn add_task(
        &self,
        operation: OperationRef,
        dispatched_at: Instant,
        notifier: Arc<CompletionNotifier>,
    ) -> Result<Admission, DispatchError> {
        let element = Arc::new(QueueElement::new(operation, dispatched_at, notifier));
        let mut state = self.lock_state();

        if state.closed {
            drop(state);
            element.release_discarded();
            return Ok(Admission {
                must_wait: true,
                cancelled: false,
            });
        }

        if element.is_delete() {
            match self.cancel_pending(&mut state, &element) {
                Ok(false) => {}
                Ok(true) => {
                    drop(state);
                    element.lock_flags().cancelled = true;
                    element.operation().persistable().operation_cancelled();
                    element.notify_dispatch();
                    self.telemetry.record_cancelled(1);
                    tracing::debug!(
                        worker = self.id,
                        item = element.item(),
                        "delete cancelled together with its pending add"
                    );
                    return Ok(Admission {
                        must_wait: false,
                        cancelled: true,
                    });
                }
                Err(err) => {
                    drop(state);
                    element.notify_dispatch();
                    tracing::error!(
                        worker = self.id,
                        item = element.item(),
                        error = %err,
                        "cancellation search hit an inconsistent queue state"
                    );
                    return Err(err);
                }
            }
        }

        let size = element.size();
        let mut must_wait = false;
        let admitted = if size >= self.limits.max_bytes_per_batch {
            state.queues.enqueue(element.clone(), true);
            state.oversized_admitted = true;
            true
        } else if element.is_delete()
            || (!state.queues.has_waiting()
                && state.queues.dispatched_bytes().saturating_add(size)
                    <= self.limits.max_dispatched_bytes)
        {
            state.queues.enqueue(element.clone(), false);
            true
        } else {
            state.queues.park(element.clone());
            must_wait = !state.errors.is_contributing();
            !must_wait
        };
        let dispatched_bytes = state.queues.dispatched_bytes();
        drop(state);

        if admitted {
            element.notify_dispatch();
        }

        tracing::trace!(
            worker = self.id,
            item = element.item(),
            kind = ?element.kind(),
            size,
            dispatched_bytes,
            parked = must_wait,
            "spill operation admitted"
        );

        Ok(Admission {
            must_wait,
            cancelled: false,
        })
    }

    /// Retracts pending adds, updates and parked operations for the delete's item.
    /// Returns true when an add was retracted, meaning the delete has nothing left to do.
    fn cancel_pending(
        &self,
        state: &mut WorkerState,
        delete: &QueueElement,
    ) -> Result<bool, DispatchError> {
        let persistable = delete.operation().persistable();
        let has_others = || persistable.operations_outstanding() != 1;

        let mut outstanding = has_others();
        if !outstanding {
            return Ok(false);
        }

        let candidates = state.queues.cancellation_candidates(delete.item());
        let mut found_add = false;

        if !persistable.representation_created() {
            for entry in candidates.iter().filter(|e| e.slot == QueueSlot::Adding) {
                let element = &entry.element;
                let mut flags = element.lock_flags();
                if flags.batched {
                    break;
                }
                let operation = element.operation();
                if !operation.is_item_removing()
                    || operation.persistable().representation_created()
                {
                    continue;
                }
                flags.cancelled = true;
                drop(flags);

                self.retract(state, entry);
                outstanding = has_others();
                found_add = true;
                break;
            }
        }

        for entry in candidates.iter().filter(|e| e.slot == QueueSlot::Updating) {
            if !outstanding {
                break;
            }
            let element = &entry.element;
            let mut flags = element.lock_flags();
            if flags.batched {
                if found_add {
                    return Err(DispatchError::invariant(format!(
                        "update for item {} batched after its add was cancelled",
                        element.item()
                    )));
                }
                continue;
            }
            if !element.operation().is_item_removing() {
                continue;
            }
            flags.cancelled = true;
            drop(flags);

            self.retract(state, entry);
            outstanding = has_others();
        }

        for entry in candidates.iter().filter(|e| e.slot == QueueSlot::Waiting) {
            if !outstanding {
                break;
            }
            let element = &entry.element;
            if element.is_delete() {
                continue;
            }
            let mut flags = element.lock_flags();
            if flags.batched || !element.operation().is_item_removing() {
                continue;
            }
            flags.cancelled = true;
            drop(flags);

            self.retract(state, entry);
            if element.is_add() {
                found_add = true;
            }
            outstanding = has_others();
        }

        Ok(found_add)
    }

    fn retract(&self, state: &mut WorkerState, entry: &QueueEntry) {
        state.queues.remove(entry.slot, entry.key);
        entry.element.operation().persistable().operation_cancelled();
        entry.element.notify_dispatch();
        self.telemetry.record_cancelled(1);
        tracing::trace!(
            worker = self.id,
            item = entry.element.item(),
            slot = ?entry.slot,
            "retracted pending spill operation"
        );
    }

    /// Moves parked elements into the dispatch lanes while the byte budget allows.
    pub(crate) fn promote_waiters(&self, state: &mut WorkerState) -> usize {
        let mut promoted = 0;
        while state.queues.dispatched_bytes() < self.limits.max_dispatched_bytes {
            let Some(front) = state.queues.front_waiting() else {
                break;
            };

            let dispatched = state.queues.dispatched_bytes();
            let fits = dispatched.saturating_add(front.element.size())
                <= self.limits.max_dispatched_bytes;
            if dispatched >= self.limits.min_bytes_per_batch && !fits {
                break;
            }

            state.queues.promote(front.key);
            front.element.notify_dispatch();
            promoted += 1;
        }

        if promoted > 0 {
            tracing::trace!(
                worker = self.id,
                promoted,
                waiting = state.queues.waiting_len(),
                "promoted parked spill operations"
            );
        }
        promoted
    }
}
