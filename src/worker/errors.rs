use super::types::WriteErrorState;
use crate::runtime::backoff::RetryBackoff;
use std::time::Duration;

/// What the caller has to do after a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    First,
    /// `register` is true the first time the worker starts counting against dispatcher
    /// health.
    Repeated { register: bool },
}

/// What the caller has to do after a good write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SuccessOutcome {
    Healthy,
    Recovering { remaining: usize },
    /// `unregister` is true when the worker had been counting against dispatcher health.
    Recovered { unregister: bool },
}

/// Per-worker write-error state machine.
#[derive(Debug)]
pub(crate) struct WriteErrorTracker {
    backoff: RetryBackoff,
    reset_floor: usize,
    in_error: bool,
    consecutive_failures: usize,
    good_writes: usize,
    writes_to_reset: usize,
    contributing: bool,
    retry_delay: Duration,
}

impl WriteErrorTracker {
    pub fn new(backoff: RetryBackoff, reset_floor: usize) -> Self {
        Self {
            backoff,
            reset_floor: reset_floor.max(1),
            in_error: false,
            consecutive_failures: 0,
            good_writes: 0,
            writes_to_reset: 0,
            contributing: false,
            retry_delay: backoff.initial_delay,
        }
    }

    pub fn state(&self) -> WriteErrorState {
        match (self.in_error, self.consecutive_failures) {
            (false, _) => WriteErrorState::Healthy,
            (true, 0 | 1) => WriteErrorState::WriteError,
            (true, _) => WriteErrorState::RepeatedError,
        }
    }

    pub fn in_error(&self) -> bool {
        self.in_error
    }

    /// True while this worker counts against dispatcher health.
    pub fn is_contributing(&self) -> bool {
        self.contributing
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    /// Delay to observe before the next write, if the last one failed repeatedly.
    pub fn retry_delay(&self) -> Option<Duration> {
        (self.in_error && self.consecutive_failures > 1).then_some(self.retry_delay)
    }

    pub fn record_failure(&mut self, batch_size: usize) -> FailureOutcome {
        if !self.in_error || self.consecutive_failures == 0 {
            if !self.in_error {
                self.writes_to_reset = batch_size.max(self.reset_floor);
                self.retry_delay = self.backoff.initial_delay;
            }
            self.in_error = true;
            self.good_writes = 0;
            self.consecutive_failures = 1;
            return FailureOutcome::First;
        }

        self.consecutive_failures += 1;
        self.good_writes = 0;
        if self.consecutive_failures > 2 {
            self.retry_delay = self.backoff.next(self.retry_delay);
        }
        let register = !self.contributing;
        self.contributing = true;
        FailureOutcome::Repeated { register }
    }

    pub fn record_success(&mut self) -> SuccessOutcome {
        if !self.in_error {
            return SuccessOutcome::Healthy;
        }

        self.consecutive_failures = 0;
        self.good_writes += 1;
        if self.good_writes < self.writes_to_reset {
            return SuccessOutcome::Recovering {
                remaining: self.writes_to_reset - self.good_writes,
            };
        }

        self.in_error = false;
        self.good_writes = 0;
        self.retry_delay = self.backoff.initial_delay;
        let unregister = self.contributing;
        self.contributing = false;
        SuccessOutcome::Recovered { unregister }
    }
}
