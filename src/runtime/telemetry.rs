use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters for batch writes.
#[derive(Default, Debug)]
pub struct Telemetry {
    batches_written: AtomicU64,
    operations_written: AtomicU64,
    operations_cancelled: AtomicU64,
    bytes_written: AtomicU64,
    write_failures: AtomicU64,
    encoding_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_batch_written(&self, operations: u64, bytes: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.operations_written
            .fetch_add(operations, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.operations_cancelled
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encoding_failure(&self) {
        self.encoding_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            batches_written: self.batches_written.load(Ordering::Relaxed),
            operations_written: self.operations_written.load(Ordering::Relaxed),
            operations_cancelled: self.operations_cancelled.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            encoding_failures: self.encoding_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub batches_written: u64,
    pub operations_written: u64,
    pub operations_cancelled: u64,
    pub bytes_written: u64,
    pub write_failures: u64,
    pub encoding_failures: u64,
}

/// Point-in-time queue gauges reported alongside the counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct QueueGauges {
    pub queued: usize,
    pub waiting: usize,
    pub dispatched_bytes: usize,
    pub healthy: bool,
}

/// Anything that can report current queue gauges to the metrics reporter.
pub trait GaugeSource: Send + Sync + 'static {
    fn gauges(&self) -> QueueGauges;
}

/// Spawns a background task that periodically logs write throughput, queue depth and
/// dispatcher health.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    gauges: Arc<dyn GaugeSource>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "spillway::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let written_delta = current_snapshot
                        .operations_written
                        .saturating_sub(last_snapshot.operations_written);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        written_delta as f64 / elapsed
                    };
                    let current = gauges.gauges();

                    tracing::info!(
                        target: "spillway::metrics",
                        throughput = format!("{throughput:.2}"),
                        batches = current_snapshot.batches_written,
                        written = current_snapshot.operations_written,
                        cancelled = current_snapshot.operations_cancelled,
                        bytes_written = current_snapshot.bytes_written,
                        write_failures = current_snapshot.write_failures,
                        encoding_failures = current_snapshot.encoding_failures,
                        queued = current.queued,
                        waiting = current.waiting,
                        dispatched_bytes = current.dispatched_bytes,
                        healthy = current.healthy,
                        "spill dispatcher metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
