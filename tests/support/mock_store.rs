use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use anyhow::anyhow;
use bytes::Bytes;
use spillway::{
    BatchingContext, BatchingContextFactory, EncodingError, ItemId, ItemLink, Operation,
    OperationKind, OperationRef, Persistable, SpillDispatcher, StagedWrite, StoreError,
    StoreFuture,
};

/// Scripted failure for the next `execute_batch` call.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transient,
    Severe,
}

/// One `execute_batch` call as seen by the store.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub items: Vec<ItemId>,
    pub kinds: Vec<OperationKind>,
    pub succeeded: bool,
    /// Dispatcher health observed when the batch reached the store.
    pub healthy: Option<bool>,
}

/// In-memory backing store that records every batch and can fail or hang on demand.
#[derive(Default)]
pub struct RecordingStore {
    attempts: Mutex<Vec<Attempt>>,
    failures: Mutex<VecDeque<Failure>>,
    hang: AtomicBool,
    executing: AtomicUsize,
    dispatcher: OnceLock<Weak<SpillDispatcher>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(failures: impl IntoIterator<Item = Failure>) -> Arc<Self> {
        let store = Self::default();
        store.failures.lock().unwrap().extend(failures);
        Arc::new(store)
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn BatchingContextFactory> {
        Arc::new(RecordingFactory {
            store: self.clone(),
        })
    }

    /// Every subsequent batch blocks forever.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    /// Records `is_healthy()` of `dispatcher` for each attempt.
    pub fn observe(&self, dispatcher: &Arc<SpillDispatcher>) {
        let _ = self.dispatcher.set(Arc::downgrade(dispatcher));
    }

    /// Batches that reached `execute_batch`, including ones that never returned.
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn written(&self) -> Vec<Vec<ItemId>> {
        self.attempts()
            .into_iter()
            .filter(|attempt| attempt.succeeded)
            .map(|attempt| attempt.items)
            .collect()
    }

    /// Successful writes in store order.
    pub fn written_ops(&self) -> Vec<(ItemId, OperationKind)> {
        self.attempts()
            .into_iter()
            .filter(|attempt| attempt.succeeded)
            .flat_map(|attempt| attempt.items.into_iter().zip(attempt.kinds))
            .collect()
    }

    fn healthy(&self) -> Option<bool> {
        self.dispatcher
            .get()
            .and_then(Weak::upgrade)
            .map(|dispatcher| dispatcher.is_healthy())
    }
}

struct RecordingFactory {
    store: Arc<RecordingStore>,
}

impl BatchingContextFactory for RecordingFactory {
    fn create_batching_context(&self) -> Box<dyn BatchingContext> {
        Box::new(RecordingContext {
            store: self.store.clone(),
            staged: Vec::new(),
        })
    }
}

struct RecordingContext {
    store: Arc<RecordingStore>,
    staged: Vec<StagedWrite>,
}

impl BatchingContext for RecordingContext {
    fn stage(&mut self, write: StagedWrite) {
        self.staged.push(write);
    }

    fn execute_batch(self: Box<Self>) -> StoreFuture {
        let RecordingContext { store, staged } = *self;
        let healthy = store.healthy();
        Box::pin(async move {
            store.executing.fetch_add(1, Ordering::SeqCst);
            if store.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }

            let failure = store.failures.lock().unwrap().pop_front();
            store.attempts.lock().unwrap().push(Attempt {
                items: staged.iter().map(|write| write.item).collect(),
                kinds: staged.iter().map(|write| write.kind).collect(),
                succeeded: failure.is_none(),
                healthy,
            });

            match failure {
                None => Ok(()),
                Some(Failure::Transient) => Err(StoreError::transient(anyhow!("store offline"))),
                Some(Failure::Severe) => Err(StoreError::severe(anyhow!("store corrupted"))),
            }
        })
    }
}

/// Item with lifecycle counters. Outstanding operations are begun minus settled.
pub struct TestItem {
    id: ItemId,
    begun: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    removing: AtomicBool,
    created: AtomicBool,
}

impl TestItem {
    pub fn new(id: ItemId) -> Arc<Self> {
        Arc::new(Self {
            id,
            begun: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            removing: AtomicBool::new(false),
            created: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn begin_removal(&self) {
        self.removing.store(true, Ordering::SeqCst);
    }

    pub fn mark_created(&self) {
        self.created.store(true, Ordering::SeqCst);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }
}

impl ItemLink for TestItem {
    fn is_removing(&self) -> bool {
        self.removing.load(Ordering::SeqCst)
    }
}

impl Persistable for TestItem {
    fn unique_id(&self) -> ItemId {
        self.id
    }

    fn operation_begun(&self) {
        self.begun.fetch_add(1, Ordering::SeqCst);
    }

    fn operation_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.created.store(true, Ordering::SeqCst);
    }

    fn operation_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn operations_outstanding(&self) -> usize {
        self.begun()
            .saturating_sub(self.completed() + self.cancelled())
    }

    fn representation_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Valid,
    Panics,
}

pub struct TestOp {
    kind: OperationKind,
    size: usize,
    item: Arc<TestItem>,
    encoding: Encoding,
}

impl Operation for TestOp {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn size_estimate(&self) -> usize {
        self.size
    }

    fn link(&self) -> Option<&dyn ItemLink> {
        Some(self.item.as_ref())
    }

    fn persistable(&self) -> &dyn Persistable {
        self.item.as_ref()
    }

    fn encode(&self) -> Result<Bytes, EncodingError> {
        if self.encoding == Encoding::Panics {
            panic!("encoder exploded for item {}", self.item.id);
        }
        if self.kind.is_delete() {
            return Ok(Bytes::new());
        }
        Ok(Bytes::from(self.item.id.to_be_bytes().to_vec()))
    }
}

pub fn add(item: &Arc<TestItem>, size: usize) -> OperationRef {
    operation(OperationKind::Add, item, size)
}

pub fn update(item: &Arc<TestItem>, size: usize) -> OperationRef {
    operation(OperationKind::Update, item, size)
}

pub fn delete(item: &Arc<TestItem>) -> OperationRef {
    operation(OperationKind::Delete, item, 8)
}

pub fn operation(kind: OperationKind, item: &Arc<TestItem>, size: usize) -> OperationRef {
    Arc::new(TestOp {
        kind,
        size,
        item: item.clone(),
        encoding: Encoding::Valid,
    })
}

pub fn exploding_add(item: &Arc<TestItem>, size: usize) -> OperationRef {
    Arc::new(TestOp {
        kind: OperationKind::Add,
        size,
        item: item.clone(),
        encoding: Encoding::Panics,
    })
}
