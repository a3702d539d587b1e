use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::time::Duration;

/// Prefix used by [`EnvProperties`] when no other prefix is given.
pub const DEFAULT_ENV_PREFIX: &str = "SPILLWAY_";

const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(25);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// A named integer tunable with a default and an accepted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunable {
    pub name: &'static str,
    pub default: i64,
    pub min: i64,
    pub max: i64,
}

impl Tunable {
    /// Reads the tunable from `source`. Missing, unparsable, or out-of-range values
    /// fall back to the default.
    pub fn resolve(&self, source: &dyn PropertySource) -> i64 {
        let Some(raw) = source.property(self.name) else {
            return self.default;
        };

        match raw.trim().parse::<i64>() {
            Ok(value) if (self.min..=self.max).contains(&value) => value,
            Ok(value) => {
                tracing::warn!(
                    property = self.name,
                    value,
                    min = self.min,
                    max = self.max,
                    default = self.default,
                    "property out of range; using default"
                );
                self.default
            }
            Err(err) => {
                tracing::warn!(
                    property = self.name,
                    raw = %raw,
                    error = %err,
                    default = self.default,
                    "property is not an integer; using default"
                );
                self.default
            }
        }
    }
}

pub const WORKER_COUNT: Tunable = Tunable {
    name: "workers",
    default: 1,
    min: 1,
    max: 32,
};

pub const MIN_BYTES_PER_BATCH: Tunable = Tunable {
    name: "min_bytes_per_batch",
    default: 200_000,
    min: 10_000,
    max: 100_000_000,
};

pub const MAX_BYTES_PER_BATCH: Tunable = Tunable {
    name: "max_bytes_per_batch",
    default: 8_000_000,
    min: 100_000,
    max: 100_000_000,
};

pub const MAX_TASKS_PER_BATCH: Tunable = Tunable {
    name: "max_tasks_per_batch",
    default: 64,
    min: 1,
    max: 10_000,
};

pub const MAX_DISPATCHED_BYTES_PER_WORKER: Tunable = Tunable {
    name: "max_dispatched_bytes_per_worker",
    default: 8_000_000,
    min: 100_000,
    max: 1_000_000_000,
};

pub const THREAD_PRIORITY_DELTA: Tunable = Tunable {
    name: "thread_priority_delta",
    default: 0,
    min: -4,
    max: 5,
};

pub const WRITES_TO_RESET_ERROR_STATE: Tunable = Tunable {
    name: "writes_to_reset_error_state",
    default: 10,
    min: 1,
    max: 10_000,
};

/// Source of raw configuration values keyed by tunable name.
pub trait PropertySource {
    fn property(&self, name: &str) -> Option<String>;
}

/// Reads tunables from environment variables such as `SPILLWAY_WORKERS`.
#[derive(Debug, Clone)]
pub struct EnvProperties {
    prefix: String,
}

impl EnvProperties {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn variable(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_ascii_uppercase())
    }
}

impl Default for EnvProperties {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertySource for EnvProperties {
    fn property(&self, name: &str) -> Option<String> {
        std::env::var(self.variable(name)).ok()
    }
}

/// In-memory property source, handy for embedding hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct MapProperties {
    values: HashMap<String, String>,
}

impl MapProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

impl PropertySource for MapProperties {
    fn property(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Runtime configuration for the spill dispatcher.
///
/// All instances are constructed via [`DispatcherConfig::builder`],
/// [`DispatcherConfig::from_properties`] or [`DispatcherConfig::new`], so the batch
/// thresholds are always consistent with each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    worker_count: usize,
    min_bytes_per_batch: usize,
    max_bytes_per_batch: usize,
    max_tasks_per_batch: usize,
    max_dispatched_bytes_per_worker: usize,
    thread_priority_delta: i32,
    writes_to_reset_error_state: usize,
    retry_initial_delay: Duration,
    retry_max_delay: Duration,
    stop_timeout: Duration,
    metrics_interval: Duration,
}

pub struct DispatcherConfigParams {
    pub worker_count: usize,
    pub min_bytes_per_batch: usize,
    pub max_bytes_per_batch: usize,
    pub max_tasks_per_batch: usize,
    pub max_dispatched_bytes_per_worker: usize,
    pub thread_priority_delta: i32,
    pub writes_to_reset_error_state: usize,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub stop_timeout: Duration,
    pub metrics_interval: Duration,
}

impl DispatcherConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::default()
    }

    /// Resolves every tunable from `source`, falling back to defaults for anything
    /// missing or out of range. Durations use their defaults.
    pub fn from_properties(source: &dyn PropertySource) -> Result<Self> {
        Self::new(DispatcherConfigParams {
            worker_count: resolve_usize(&WORKER_COUNT, source),
            min_bytes_per_batch: resolve_usize(&MIN_BYTES_PER_BATCH, source),
            max_bytes_per_batch: resolve_usize(&MAX_BYTES_PER_BATCH, source),
            max_tasks_per_batch: resolve_usize(&MAX_TASKS_PER_BATCH, source),
            max_dispatched_bytes_per_worker: resolve_usize(
                &MAX_DISPATCHED_BYTES_PER_WORKER,
                source,
            ),
            thread_priority_delta: THREAD_PRIORITY_DELTA.resolve(source) as i32,
            writes_to_reset_error_state: resolve_usize(&WRITES_TO_RESET_ERROR_STATE, source),
            retry_initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        })
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// `min_bytes_per_batch` is lowered to fit under both the per-worker budget and the
    /// batch byte ceiling.
    pub fn new(params: DispatcherConfigParams) -> Result<Self> {
        let DispatcherConfigParams {
            worker_count,
            min_bytes_per_batch,
            max_bytes_per_batch,
            max_tasks_per_batch,
            max_dispatched_bytes_per_worker,
            thread_priority_delta,
            writes_to_reset_error_state,
            retry_initial_delay,
            retry_max_delay,
            stop_timeout,
            metrics_interval,
        } = params;

        let min_bytes_per_batch = min_bytes_per_batch
            .min(max_dispatched_bytes_per_worker)
            .min(max_bytes_per_batch);

        let config = Self {
            worker_count,
            min_bytes_per_batch,
            max_bytes_per_batch,
            max_tasks_per_batch,
            max_dispatched_bytes_per_worker,
            thread_priority_delta,
            writes_to_reset_error_state,
            retry_initial_delay,
            retry_max_delay,
            stop_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of workers; items are partitioned across them by identity.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Dispatched bytes a worker accumulates before it builds a batch.
    pub fn min_bytes_per_batch(&self) -> usize {
        self.min_bytes_per_batch
    }

    /// Byte ceiling of a batch. Operations at or above it are written alone.
    pub fn max_bytes_per_batch(&self) -> usize {
        self.max_bytes_per_batch
    }

    /// Task ceiling of a batch while the worker is healthy.
    pub fn max_tasks_per_batch(&self) -> usize {
        self.max_tasks_per_batch
    }

    /// Byte budget of a worker's dispatch queues before callers are parked.
    pub fn max_dispatched_bytes_per_worker(&self) -> usize {
        self.max_dispatched_bytes_per_worker
    }

    /// Requested scheduling priority offset for workers, relative to normal.
    pub fn thread_priority_delta(&self) -> i32 {
        self.thread_priority_delta
    }

    /// Minimum number of good writes before a worker leaves its error state.
    pub fn writes_to_reset_error_state(&self) -> usize {
        self.writes_to_reset_error_state
    }

    /// Delay before the first retry after repeated write failures.
    pub fn retry_initial_delay(&self) -> Duration {
        self.retry_initial_delay
    }

    /// Cap on the retry delay.
    pub fn retry_max_delay(&self) -> Duration {
        self.retry_max_delay
    }

    /// Overall deadline for joining workers on stop.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Interval used by the metrics reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.max_bytes_per_batch == 0 {
            bail!("max_bytes_per_batch must be greater than 0");
        }

        if self.max_tasks_per_batch == 0 {
            bail!("max_tasks_per_batch must be greater than 0");
        }

        if self.max_dispatched_bytes_per_worker == 0 {
            bail!("max_dispatched_bytes_per_worker must be greater than 0");
        }

        if self.min_bytes_per_batch > self.max_bytes_per_batch
            || self.min_bytes_per_batch > self.max_dispatched_bytes_per_worker
        {
            bail!(
                "min_bytes_per_batch ({}) must not exceed max_bytes_per_batch ({}) or \
                 max_dispatched_bytes_per_worker ({})",
                self.min_bytes_per_batch,
                self.max_bytes_per_batch,
                self.max_dispatched_bytes_per_worker,
            );
        }

        if self.writes_to_reset_error_state == 0 {
            bail!("writes_to_reset_error_state must be greater than 0");
        }

        if self.retry_initial_delay.is_zero() {
            bail!("retry_initial_delay must be greater than 0");
        }

        if self.retry_max_delay < self.retry_initial_delay {
            bail!("retry_max_delay must be at least retry_initial_delay");
        }

        if self.stop_timeout.is_zero() {
            bail!("stop_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: WORKER_COUNT.default as usize,
            min_bytes_per_batch: MIN_BYTES_PER_BATCH.default as usize,
            max_bytes_per_batch: MAX_BYTES_PER_BATCH.default as usize,
            max_tasks_per_batch: MAX_TASKS_PER_BATCH.default as usize,
            max_dispatched_bytes_per_worker: MAX_DISPATCHED_BYTES_PER_WORKER.default as usize,
            thread_priority_delta: THREAD_PRIORITY_DELTA.default as i32,
            writes_to_reset_error_state: WRITES_TO_RESET_ERROR_STATE.default as usize,
            retry_initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

/// Builder for [`DispatcherConfig`]. Values set here are taken as given (no range
/// clamping) and only checked by [`DispatcherConfig::validate`].
#[derive(Debug, Default, Clone)]
pub struct DispatcherConfigBuilder {
    worker_count: Option<usize>,
    min_bytes_per_batch: Option<usize>,
    max_bytes_per_batch: Option<usize>,
    max_tasks_per_batch: Option<usize>,
    max_dispatched_bytes_per_worker: Option<usize>,
    thread_priority_delta: Option<i32>,
    writes_to_reset_error_state: Option<usize>,
    retry_initial_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    stop_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl DispatcherConfigBuilder {
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn min_bytes_per_batch(mut self, bytes: usize) -> Self {
        self.min_bytes_per_batch = Some(bytes);
        self
    }

    pub fn max_bytes_per_batch(mut self, bytes: usize) -> Self {
        self.max_bytes_per_batch = Some(bytes);
        self
    }

    pub fn max_tasks_per_batch(mut self, tasks: usize) -> Self {
        self.max_tasks_per_batch = Some(tasks);
        self
    }

    pub fn max_dispatched_bytes_per_worker(mut self, bytes: usize) -> Self {
        self.max_dispatched_bytes_per_worker = Some(bytes);
        self
    }

    pub fn thread_priority_delta(mut self, delta: i32) -> Self {
        self.thread_priority_delta = Some(delta);
        self
    }

    pub fn writes_to_reset_error_state(mut self, writes: usize) -> Self {
        self.writes_to_reset_error_state = Some(writes);
        self
    }

    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = Some(delay);
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<DispatcherConfig> {
        let defaults = DispatcherConfig::default();
        let params = DispatcherConfigParams {
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            min_bytes_per_batch: self
                .min_bytes_per_batch
                .unwrap_or(defaults.min_bytes_per_batch),
            max_bytes_per_batch: self
                .max_bytes_per_batch
                .unwrap_or(defaults.max_bytes_per_batch),
            max_tasks_per_batch: self
                .max_tasks_per_batch
                .unwrap_or(defaults.max_tasks_per_batch),
            max_dispatched_bytes_per_worker: self
                .max_dispatched_bytes_per_worker
                .unwrap_or(defaults.max_dispatched_bytes_per_worker),
            thread_priority_delta: self
                .thread_priority_delta
                .unwrap_or(defaults.thread_priority_delta),
            writes_to_reset_error_state: self
                .writes_to_reset_error_state
                .unwrap_or(defaults.writes_to_reset_error_state),
            retry_initial_delay: self
                .retry_initial_delay
                .unwrap_or(defaults.retry_initial_delay),
            retry_max_delay: self.retry_max_delay.unwrap_or(defaults.retry_max_delay),
            stop_timeout: self.stop_timeout.unwrap_or(defaults.stop_timeout),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        DispatcherConfig::new(params).context("invalid spill dispatcher configuration")
    }
}

fn resolve_usize(tunable: &Tunable, source: &dyn PropertySource) -> usize {
    usize::try_from(tunable.resolve(source)).unwrap_or(tunable.default as usize)
}
