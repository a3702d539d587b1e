use super::shared::WorkerShared;
use super::types::Batch;
use crate::runtime::backoff::sleep_with_cancellation;
use crate::store::BatchingContextFactory;
use anyhow::Result;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;

pub struct Worker {
    pub(super) shared: Arc<WorkerShared>,
    pub(super) factory: Arc<dyn BatchingContextFactory>,
    pub(super) shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        shared: Arc<WorkerShared>,
        factory: Arc<dyn BatchingContextFactory>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared,
            factory,
            shutdown,
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        self.shared.clone()
    }

    #[tracing::instrument(name = "spill_worker", skip_all, fields(worker = self.shared.id))]
    pub async fn run(self) -> Result<()> {
        let id = self.shared.id;
        tracing::info!(worker = id, "spill worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let retry_delay = self.shared.lock_state().errors.retry_delay();
            if let Some(delay) = retry_delay {
                tracing::debug!(
                    worker = id,
                    delay_ms = delay.as_millis() as u64,
                    "delaying spill retry after repeated write errors"
                );
                if sleep_with_cancellation(delay, Some(&self.shutdown))
                    .await
                    .is_err()
                {
                    break;
                }
            }

            match self.next_batch() {
                Some(batch) => {
                    self.shared
                        .write_batch(batch, self.factory.as_ref())
                        .await?;
                }
                None => {
                    select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.shared.wake.notified() => {}
                    }
                    self.shared.unpark();
                }
            }
        }

        self.shared.discard_waiting();
        tracing::info!(worker = id, "spill worker stopped");
        Ok(())
    }

    /// Promotes parked work and claims a batch; parks the worker when there is none.
    fn next_batch(&self) -> Option<Batch> {
        let mut state = self.shared.lock_state();
        self.shared.promote_waiters(&mut state);
        let batch = self.shared.build_batch(&state);
        if batch.is_empty() {
            state.active = false;
            None
        } else {
            Some(batch)
        }
    }
}
