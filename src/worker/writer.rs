use super::errors::{FailureOutcome, SuccessOutcome};
use super::shared::{WorkerShared, WorkerState};
use super::types::Batch;
use crate::store::{BatchingContext, BatchingContextFactory, StagedWrite, StoreError};
use anyhow::Result;

impl WorkerShared {
    /// Encodes and writes one batch. Transient store failures are absorbed by the error
    /// state machine; only a severe store failure is returned.
    pub(crate) async fn write_batch(
        &self,
        batch: Batch,
        factory: &dyn BatchingContextFactory,
    ) -> Result<()> {
        let mut context: Option<Box<dyn BatchingContext>> = None;
        let mut staged = 0usize;
        let mut staged_bytes = 0usize;

        for entry in &batch.entries {
            let element = &entry.element;
            let operation = element.operation();

            if element.is_delete() && !operation.persistable().representation_created() {
                element.lock_flags().cancelled = true;
                tracing::trace!(
                    worker = self.id,
                    item = element.item(),
                    "skipping delete for an item that was never written"
                );
                continue;
            }

            match operation.encode() {
                Ok(payload) => {
                    staged_bytes = staged_bytes.saturating_add(payload.len());
                    context
                        .get_or_insert_with(|| factory.create_batching_context())
                        .stage(StagedWrite {
                            kind: element.kind(),
                            item: element.item(),
                            payload,
                        });
                    staged += 1;
                }
                Err(err) => {
                    element.lock_flags().cancelled = true;
                    self.telemetry.record_encoding_failure();
                    tracing::warn!(
                        worker = self.id,
                        item = element.item(),
                        error = %err,
                        "failed to encode spill operation; cancelling it"
                    );
                }
            }
        }

        let outcome = match context {
            Some(context) => context.execute_batch().await,
            None => Ok(()),
        };

        match outcome {
            Ok(()) => {
                self.batch_completed(&batch, staged, staged_bytes);
                Ok(())
            }
            Err(StoreError::Transient(err)) => {
                self.batch_failed(&batch, &err);
                Ok(())
            }
            Err(StoreError::Severe(err)) => {
                {
                    let mut state = self.lock_state();
                    self.release_batch(&mut state, &batch);
                }
                Err(err.context(format!(
                    "worker {} hit a severe store failure writing {} operations",
                    self.id,
                    batch.len()
                )))
            }
        }
    }

    fn batch_completed(&self, batch: &Batch, staged: usize, staged_bytes: usize) {
        let (cancelled, outcome) = {
            let mut state = self.lock_state();
            let mut cancelled = 0usize;
            for entry in &batch.entries {
                state.queues.remove(entry.slot, entry.key);
                let persistable = entry.element.operation().persistable();
                if entry.element.is_cancelled() {
                    persistable.operation_cancelled();
                    cancelled += 1;
                } else {
                    persistable.operation_completed();
                }
            }
            let outcome = (staged > 0).then(|| state.errors.record_success());
            (cancelled, outcome)
        };

        self.telemetry.record_cancelled(cancelled as u64);
        if staged > 0 {
            self.telemetry
                .record_batch_written(staged as u64, staged_bytes as u64);
        }

        match outcome {
            Some(SuccessOutcome::Recovering { remaining }) => {
                tracing::debug!(
                    worker = self.id,
                    remaining,
                    "spill write succeeded while recovering from write errors"
                );
            }
            Some(SuccessOutcome::Recovered { unregister }) => {
                if unregister {
                    let failing = self.health.write_error_cleared();
                    tracing::info!(
                        worker = self.id,
                        failing_workers = failing,
                        "spill worker recovered from repeated write errors"
                    );
                } else {
                    tracing::info!(worker = self.id, "spill worker recovered from write error");
                }
            }
            Some(SuccessOutcome::Healthy) | None => {}
        }

        tracing::trace!(
            worker = self.id,
            written = staged,
            cancelled,
            "spill batch completed"
        );
    }

    fn batch_failed(&self, batch: &Batch, err: &anyhow::Error) {
        let (outcome, failed, parked) = {
            let mut state = self.lock_state();
            let cancelled = self.release_batch(&mut state, batch);
            let failed = batch.len().saturating_sub(cancelled);
            let outcome = state.errors.record_failure(failed);
            let parked: Vec<_> = match outcome {
                FailureOutcome::Repeated { .. } => {
                    state.queues.waiting_elements().cloned().collect()
                }
                FailureOutcome::First => Vec::new(),
            };
            (outcome, failed, parked)
        };

        self.telemetry.record_write_failure();
        tracing::warn!(
            worker = self.id,
            failed,
            outcome = ?outcome,
            error = %err,
            "spill batch write failed"
        );

        if let FailureOutcome::Repeated { register: true } = outcome {
            let failing = self.health.write_error_occurred();
            tracing::error!(
                worker = self.id,
                failing_workers = failing,
                "spill worker is failing repeatedly; dispatcher marked unhealthy"
            );
        }

        for element in &parked {
            element.notify_dispatch();
        }
    }

    /// Drops cancelled entries of an unwritten batch and returns the rest to their lanes.
    fn release_batch(&self, state: &mut WorkerState, batch: &Batch) -> usize {
        let mut cancelled = 0usize;
        for entry in &batch.entries {
            let mut flags = entry.element.lock_flags();
            if flags.cancelled {
                drop(flags);
                state.queues.remove(entry.slot, entry.key);
                entry.element.operation().persistable().operation_cancelled();
                cancelled += 1;
            } else {
                flags.batched = false;
            }
        }
        self.telemetry.record_cancelled(cancelled as u64);
        cancelled
    }
}
