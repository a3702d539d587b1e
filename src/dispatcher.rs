//! Spill dispatcher coordinator: owns the workers, routes operations to them by item
//! identity and exposes lifecycle and health to the host.

pub mod health;
mod pool;

use crate::error::DispatchError;
use crate::operation::{ItemId, OperationRef};
use crate::queueing::notifier::CompletionNotifier;
use crate::runtime::config::DispatcherConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, GaugeSource, QueueGauges, Telemetry, TelemetrySnapshot};
use crate::store::BatchingContextFactory;
use crate::worker::{Worker, WorkerShared, WorkerSharedParams, WorkerStats};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use health::{DispatcherPhase, HealthSnapshot, HealthState};

/// How [`SpillDispatcher::stop`] treats running workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Let workers finish their current write and join them up to the stop timeout.
    Graceful,
    /// Abort worker tasks right after requesting stop.
    Immediate,
}

struct RunState {
    workers: Arc<[Arc<WorkerShared>]>,
    handles: Vec<JoinHandle<()>>,
    run_token: Option<CancellationToken>,
    metrics_handle: Option<JoinHandle<()>>,
}

impl RunState {
    fn idle() -> Self {
        Self {
            workers: Arc::from(Vec::new()),
            handles: Vec::new(),
            run_token: None,
            metrics_handle: None,
        }
    }
}

/// Batches, orders and cancels item writes across a fixed set of workers.
pub struct SpillDispatcher {
    config: DispatcherConfig,
    factory: Arc<dyn BatchingContextFactory>,
    health: Arc<HealthState>,
    telemetry: Arc<Telemetry>,
    shutdown_root: CancellationToken,
    fatal_handler: FatalErrorHandler,
    run: Mutex<RunState>,
}

impl SpillDispatcher {
    pub fn new(config: DispatcherConfig, factory: Arc<dyn BatchingContextFactory>) -> Self {
        Self::with_shutdown_token(config, factory, CancellationToken::new())
    }

    /// Uses `shutdown_root` as the parent of the worker run token. A fatal worker failure
    /// cancels it so the host can react.
    pub fn with_shutdown_token(
        config: DispatcherConfig,
        factory: Arc<dyn BatchingContextFactory>,
        shutdown_root: CancellationToken,
    ) -> Self {
        let fatal_handler = FatalErrorHandler::new(shutdown_root.clone());
        Self {
            config,
            factory,
            health: Arc::new(HealthState::new()),
            telemetry: Arc::new(Telemetry::default()),
            shutdown_root,
            fatal_handler,
            run: Mutex::new(RunState::idle()),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().expect("dispatcher run state mutex poisoned")
    }

    /// Spawns the workers and the metrics reporter. Must be called from within a tokio
    /// runtime.
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut run = self.lock_run();
        let phase = self.health.snapshot().phase();
        if phase != DispatcherPhase::NotStarted {
            return Err(DispatchError::invariant(format!(
                "spill dispatcher cannot start from {phase:?}"
            )));
        }

        let count = self.config.worker_count();
        let workers: Arc<[Arc<WorkerShared>]> = (0..count)
            .map(|id| {
                Arc::new(WorkerShared::new(WorkerSharedParams {
                    id,
                    config: self.config.clone(),
                    health: self.health.clone(),
                    telemetry: self.telemetry.clone(),
                }))
            })
            .collect();

        if !self.health.mark_running(count) {
            return Err(DispatchError::invariant(
                "spill dispatcher was stopped while starting",
            ));
        }

        let run_token = self.shutdown_root.child_token();
        let handles = workers
            .iter()
            .map(|shared| {
                let worker = Worker::new(shared.clone(), self.factory.clone(), run_token.clone());
                pool::spawn_worker(worker, self.health.clone(), self.fatal_handler.clone())
            })
            .collect();

        let gauges: Arc<dyn GaugeSource> = Arc::new(PoolGauges {
            workers: workers.clone(),
            health: self.health.clone(),
        });
        let metrics_handle = telemetry::spawn_metrics_reporter(
            self.telemetry.clone(),
            gauges,
            run_token.clone(),
            self.config.metrics_interval(),
        );

        *run = RunState {
            workers,
            handles,
            run_token: Some(run_token),
            metrics_handle: Some(metrics_handle),
        };
        drop(run);

        tracing::info!(
            workers = count,
            min_bytes_per_batch = self.config.min_bytes_per_batch(),
            max_bytes_per_batch = self.config.max_bytes_per_batch(),
            max_tasks_per_batch = self.config.max_tasks_per_batch(),
            max_dispatched_bytes = self.config.max_dispatched_bytes_per_worker(),
            "spill dispatcher started"
        );
        if self.config.thread_priority_delta() != 0 {
            tracing::info!(
                thread_priority_delta = self.config.thread_priority_delta(),
                "worker priority delta is not applied to async worker tasks"
            );
        }
        Ok(())
    }

    /// Requests stop, discards parked work and joins the workers. Only the first caller
    /// does anything.
    pub async fn stop(&self, mode: StopMode) {
        if !self.health.request_stop() {
            tracing::debug!("spill dispatcher stop already requested");
            return;
        }
        tracing::info!(mode = ?mode, "stopping spill dispatcher");

        let (workers, handles, run_token, metrics_handle) = {
            let mut run = self.lock_run();
            (
                run.workers.clone(),
                std::mem::take(&mut run.handles),
                run.run_token.clone(),
                run.metrics_handle.take(),
            )
        };

        for worker in workers.iter() {
            worker.discard_waiting();
        }
        if let Some(token) = run_token {
            token.cancel();
        }

        if mode == StopMode::Immediate {
            for handle in &handles {
                handle.abort();
            }
        }

        let laggards = pool::join_with_deadline(handles, self.config.stop_timeout()).await;
        if laggards > 0 {
            tracing::warn!(laggards, "some spill workers missed the stop deadline");
        }

        if let Some(handle) = metrics_handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    tracing::warn!(error = %err, "metrics reporter task panicked");
                }
            }
        }

        tracing::info!(phase = ?self.health.snapshot().phase(), "spill dispatcher stopped");
    }

    /// Hands `operations` to their workers and waits only if a worker had to park one of
    /// them. Work discarded by shutdown still returns normally; the dispatcher never
    /// rejects it.
    pub async fn dispatch(
        &self,
        operations: Vec<OperationRef>,
        can_reject: bool,
    ) -> Result<(), DispatchError> {
        if let Some(err) = self.fatal_handler.error() {
            return Err(DispatchError::Fatal(err));
        }

        let workers = self.running_workers()?;
        if operations.is_empty() {
            return Ok(());
        }

        let notifier = Arc::new(CompletionNotifier::new(operations.len(), can_reject));
        let dispatched_at = Instant::now();

        let mut touched = vec![false; workers.len()];
        let mut must_wait = false;
        let mut failure = None;
        for operation in operations {
            let index = partition(operation.item_id(), workers.len());
            touched[index] = true;
            operation.persistable().operation_begun();
            match workers[index].add_task(operation, dispatched_at, notifier.clone()) {
                Ok(admission) => must_wait |= admission.must_wait,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        for (worker, touched) in workers.iter().zip(touched) {
            if touched {
                worker.notify_dispatch_arrived();
            }
        }

        if let Some(err) = failure {
            return Err(err);
        }

        if must_wait {
            tracing::trace!("dispatch waiting for parked spill operations");
            notifier.wait_for_dispatch().await?;
        }
        Ok(())
    }

    fn running_workers(&self) -> Result<Arc<[Arc<WorkerShared>]>, DispatchError> {
        if self.health.snapshot().phase() != DispatcherPhase::Running {
            return Err(DispatchError::NotRunning);
        }
        Ok(self.lock_run().workers.clone())
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Registers `worker_id` as failing repeatedly.
    pub fn thread_write_error_occurred(&self, worker_id: usize) {
        let failing = self.health.write_error_occurred();
        tracing::warn!(
            worker = worker_id,
            failing_workers = failing,
            "spill worker registered write errors"
        );
    }

    /// Clears a registration made by [`Self::thread_write_error_occurred`]. The count never
    /// drops below zero.
    pub fn thread_write_error_cleared(&self, worker_id: usize) {
        let failing = self.health.write_error_cleared();
        tracing::info!(
            worker = worker_id,
            failing_workers = failing,
            "spill worker cleared write errors"
        );
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.lock_run()
            .workers
            .iter()
            .map(|worker| worker.stats())
            .collect()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// The first fatal worker failure, if any.
    pub fn fatal_error(&self) -> Option<anyhow::Error> {
        self.fatal_handler.error()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_root.clone()
    }
}

impl fmt::Display for SpillDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.health.snapshot();
        f.write_str("SpillDispatcher")?;
        if snapshot.stop_requested() {
            f.write_str(" (STOP REQUESTED)")?;
        }
        if snapshot.stopped() {
            f.write_str(" (STOPPED)")?;
        }
        if snapshot.thread_write_error_count() > 0 {
            f.write_str(" (ERROR)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SpillDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillDispatcher")
            .field("config", &self.config)
            .field("health", &self.health.snapshot())
            .finish()
    }
}

impl Drop for SpillDispatcher {
    fn drop(&mut self) {
        let Ok(run) = self.run.get_mut() else {
            return;
        };
        if let Some(token) = run.run_token.take() {
            self.health.request_stop();
            token.cancel();
        }
    }
}

/// Worker index owning `item`. Stable for the lifetime of the dispatcher.
fn partition(item: ItemId, workers: usize) -> usize {
    (item % workers as u64) as usize
}

struct PoolGauges {
    workers: Arc<[Arc<WorkerShared>]>,
    health: Arc<HealthState>,
}

impl GaugeSource for PoolGauges {
    fn gauges(&self) -> QueueGauges {
        self.workers.iter().map(|worker| worker.stats()).fold(
            QueueGauges {
                healthy: self.health.is_healthy(),
                ..QueueGauges::default()
            },
            |mut gauges, stats| {
                gauges.queued += stats.queued;
                gauges.waiting += stats.waiting;
                gauges.dispatched_bytes += stats.dispatched_bytes;
                gauges
            },
        )
    }
}
