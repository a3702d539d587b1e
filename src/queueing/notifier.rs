use crate::error::DispatchError;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct NotifierState {
    remaining: usize,
    notified: bool,
    rejected: bool,
}

/// Countdown latch shared by every queue element created from one `dispatch` call.
///
/// The waiter is released exactly once: when the count reaches zero, when the notifier is
/// forced, or when it is rejected. Further signals after that point are ignored.
#[derive(Debug)]
pub struct CompletionNotifier {
    state: Mutex<NotifierState>,
    rejectable: bool,
    notify: Notify,
}

impl CompletionNotifier {
    pub fn new(count: usize, rejectable: bool) -> Self {
        Self {
            state: Mutex::new(NotifierState {
                remaining: count,
                notified: count == 0,
                rejected: false,
            }),
            rejectable,
            notify: Notify::new(),
        }
    }

    /// Records that one element has been accepted for write.
    pub fn notify_dispatch(&self) {
        let mut state = self.state.lock().expect("completion notifier mutex poisoned");
        if state.notified {
            return;
        }

        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            state.notified = true;
            drop(state);
            self.notify.notify_waiters();
        }
    }

    /// Releases the waiter regardless of the remaining count.
    pub fn force_notify(&self) {
        let mut state = self.state.lock().expect("completion notifier mutex poisoned");
        if state.notified {
            return;
        }

        state.notified = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Releases the waiter with a "backend unavailable" outcome.
    pub fn notify_rejected(&self) -> Result<(), DispatchError> {
        if !self.rejectable {
            return Err(DispatchError::invariant(
                "attempted to reject a dispatch that cannot be rejected",
            ));
        }

        let mut state = self.state.lock().expect("completion notifier mutex poisoned");
        if state.notified {
            return Ok(());
        }

        state.rejected = true;
        state.notified = true;
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits until the notifier fires.
    pub async fn wait_for_dispatch(&self) -> Result<(), DispatchError> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock().expect("completion notifier mutex poisoned");
                if state.notified {
                    return if state.rejected {
                        Err(DispatchError::BackendUnavailable)
                    } else {
                        Ok(())
                    };
                }
            }
            notified.await;
        }
    }

    pub fn is_notified(&self) -> bool {
        self.state
            .lock()
            .expect("completion notifier mutex poisoned")
            .notified
    }

    pub fn remaining(&self) -> usize {
        self.state
            .lock()
            .expect("completion notifier mutex poisoned")
            .remaining
    }
}
