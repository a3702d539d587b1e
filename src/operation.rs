//! Boundary traits for the message-store objects the dispatcher persists.

use anyhow::Error as AnyError;
use bytes::Bytes;
use std::sync::Arc;

/// Stable identity of a stored item. Routing and cancellation both key on it.
pub type ItemId = u64;

/// Shared handle to an operation handed to the dispatcher.
pub type OperationRef = Arc<dyn Operation>;

/// Kind of durable write an operation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

impl OperationKind {
    pub fn is_delete(self) -> bool {
        matches!(self, OperationKind::Delete)
    }
}

/// In-memory handle connecting an operation to its owning item.
pub trait ItemLink: Send + Sync {
    /// True while the owning item is in the middle of being removed.
    fn is_removing(&self) -> bool;
}

/// On-disk representation of an item and its lifecycle callbacks.
///
/// The dispatcher calls `operation_begun` once per dispatched operation and then exactly
/// one of `operation_completed` or `operation_cancelled` for it, unless the operation is
/// discarded by shutdown.
pub trait Persistable: Send + Sync {
    fn unique_id(&self) -> ItemId;

    fn operation_begun(&self);

    fn operation_completed(&self);

    fn operation_cancelled(&self);

    /// Number of operations begun for this item that have not yet completed or been
    /// cancelled.
    fn operations_outstanding(&self) -> usize;

    /// True once an add for this item has reached the backing store.
    fn representation_created(&self) -> bool;
}

/// One requested durable-write unit for a single item.
pub trait Operation: Send + Sync + 'static {
    fn kind(&self) -> OperationKind;

    /// Approximate bytes the operation keeps in memory until written.
    fn size_estimate(&self) -> usize;

    /// Link to the owning item. Operations without a link are never cancelled.
    fn link(&self) -> Option<&dyn ItemLink>;

    fn persistable(&self) -> &dyn Persistable;

    /// Produces the bytes staged into a batch. Deletes usually return an empty buffer.
    fn encode(&self) -> Result<Bytes, EncodingError>;

    fn item_id(&self) -> ItemId {
        self.persistable().unique_id()
    }

    fn is_item_removing(&self) -> bool {
        self.link().is_some_and(|link| link.is_removing())
    }
}

/// Failure to turn a single operation into bytes. Only that operation is cancelled.
#[derive(Debug)]
pub struct EncodingError {
    item: ItemId,
    source: AnyError,
}

impl EncodingError {
    pub fn new(item: ItemId, source: AnyError) -> Self {
        Self { item, source }
    }

    pub fn item(&self) -> ItemId {
        self.item
    }
}

impl core::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "failed to encode item {}: {}", self.item, self.source)
    }
}

impl std::error::Error for EncodingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
