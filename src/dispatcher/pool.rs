//! Worker task spawning and bounded joins for the spill dispatcher.

use super::health::HealthState;
use crate::runtime::fatal::FatalErrorHandler;
use crate::worker::Worker;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Runs `worker` on its own task. Any exit that was not requested is reported through
/// the fatal error handler.
pub(crate) fn spawn_worker(
    worker: Worker,
    health: Arc<HealthState>,
    fatal_handler: FatalErrorHandler,
) -> JoinHandle<()> {
    let worker_id = worker.id();
    let shared = worker.shared();
    let exit = ExitGuard {
        health: health.clone(),
    };

    tokio::spawn(async move {
        let _exit = exit;

        let result = std::panic::AssertUnwindSafe(worker.run())
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                if !health.snapshot().stop_requested() && !fatal_handler.is_triggered() {
                    let context = format!("worker {worker_id} exited without a stop request");
                    tracing::error!(worker = worker_id, "{context}");
                    fatal_handler.trigger(context.as_str(), anyhow::anyhow!(context.clone()));
                }
            }
            Ok(Err(err)) => {
                tracing::error!(
                    worker = worker_id,
                    error = %err,
                    "spill worker exited with error"
                );
                let context = format!("worker {worker_id} exited with error");
                let err = err.context(context.clone());
                fatal_handler.trigger(context.as_str(), err);
            }
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(
                    worker = worker_id,
                    panic = %panic_msg,
                    "spill worker panicked"
                );
                let context = format!("worker {worker_id} panicked");
                let panic_error = anyhow::anyhow!("worker {worker_id} panicked: {panic_msg}");
                fatal_handler.trigger(context.as_str(), panic_error);
            }
        }

        shared.discard_waiting();
    })
}

/// Counts the worker out even when its task is aborted, including before its first poll.
struct ExitGuard {
    health: Arc<HealthState>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.health.worker_exited();
    }
}

/// Joins every handle against one shared deadline. Workers that miss it are logged and
/// aborted. Returns the number of laggards.
pub(crate) async fn join_with_deadline(handles: Vec<JoinHandle<()>>, budget: Duration) -> usize {
    let deadline = Instant::now() + budget;
    let mut laggards = 0;

    for (worker_id, mut handle) in handles.into_iter().enumerate() {
        match timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_cancelled() => {}
            Ok(Err(err)) => {
                tracing::warn!(worker = worker_id, error = %err, "spill worker task failed");
            }
            Err(_) => {
                laggards += 1;
                tracing::warn!(
                    worker = worker_id,
                    timeout_ms = budget.as_millis() as u64,
                    "spill worker did not stop before the deadline; aborting it"
                );
                handle.abort();
            }
        }
    }

    laggards
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
