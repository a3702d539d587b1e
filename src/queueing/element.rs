use super::notifier::CompletionNotifier;
use crate::operation::{ItemId, OperationKind, OperationRef};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Flags guarded by the per-element lock. The admission path (cancellation) and the batch
/// builder both take this lock before deciding whether the element is still unbatched.
#[derive(Debug, Default)]
pub struct ElementFlags {
    pub batched: bool,
    pub cancelled: bool,
}

/// Wraps one dispatched operation while it waits to be written.
pub struct QueueElement {
    operation: OperationRef,
    kind: OperationKind,
    item: ItemId,
    size: usize,
    dispatched_at: Instant,
    notifier: Arc<CompletionNotifier>,
    notified: AtomicBool,
    flags: Mutex<ElementFlags>,
}

impl QueueElement {
    pub fn new(
        operation: OperationRef,
        dispatched_at: Instant,
        notifier: Arc<CompletionNotifier>,
    ) -> Self {
        let kind = operation.kind();
        let item = operation.item_id();
        let size = operation.size_estimate();
        Self {
            operation,
            kind,
            item,
            size,
            dispatched_at,
            notifier,
            notified: AtomicBool::new(false),
            flags: Mutex::new(ElementFlags::default()),
        }
    }

    pub fn operation(&self) -> &OperationRef {
        &self.operation
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn item(&self) -> ItemId {
        self.item
    }

    /// Size estimate cached at construction so byte accounting never drifts.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_add(&self) -> bool {
        self.kind == OperationKind::Add
    }

    pub fn is_update(&self) -> bool {
        self.kind == OperationKind::Update
    }

    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    pub fn age(&self) -> Duration {
        self.dispatched_at.elapsed()
    }

    pub fn lock_flags(&self) -> MutexGuard<'_, ElementFlags> {
        self.flags.lock().expect("queue element mutex poisoned")
    }

    pub fn is_batched(&self) -> bool {
        self.lock_flags().batched
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_flags().cancelled
    }

    /// Marks the element cancelled unless a batch already claimed it.
    pub fn try_cancel(&self) -> bool {
        let mut flags = self.lock_flags();
        if flags.batched {
            return false;
        }
        flags.cancelled = true;
        true
    }

    /// Counts this element against its notifier. Only the first call has any effect.
    pub fn notify_dispatch(&self) {
        if !self.notified.swap(true, Ordering::SeqCst) {
            self.notifier.notify_dispatch();
        }
    }

    /// Releases the dispatching caller because the element is being discarded. The caller
    /// sees a normal return; discarded work is never reported as rejected.
    pub fn release_discarded(&self) {
        if !self.notified.swap(true, Ordering::SeqCst) {
            self.notifier.force_notify();
        }
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for QueueElement {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueElement")
            .field("kind", &self.kind)
            .field("item", &self.item)
            .field("size", &self.size)
            .field("notified", &self.is_notified())
            .finish()
    }
}
