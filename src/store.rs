//! Backing-store boundary: batching contexts and the factory that opens them.

use crate::operation::{ItemId, OperationKind};
use anyhow::Error as AnyError;
use bytes::Bytes;
use core::future::Future;
use core::pin::Pin;

pub type StoreFuture = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'static>>;

/// A single write staged into a batching context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedWrite {
    pub kind: OperationKind,
    pub item: ItemId,
    pub payload: Bytes,
}

/// One backing-store transaction under construction.
pub trait BatchingContext: Send {
    fn stage(&mut self, write: StagedWrite);

    /// Commits every staged write as one transaction.
    fn execute_batch(self: Box<Self>) -> StoreFuture;
}

/// Opens batching contexts against the backing store.
pub trait BatchingContextFactory: Send + Sync + 'static {
    fn create_batching_context(&self) -> Box<dyn BatchingContext>;
}

/// Failure reported by [`BatchingContext::execute_batch`].
#[derive(Debug)]
pub enum StoreError {
    /// Retryable; drives the worker's backoff state machine.
    Transient(AnyError),
    /// Unrecoverable; terminates the worker and is reported as fatal.
    Severe(AnyError),
}

impl StoreError {
    pub fn transient(source: impl Into<AnyError>) -> Self {
        StoreError::Transient(source.into())
    }

    pub fn severe(source: impl Into<AnyError>) -> Self {
        StoreError::Severe(source.into())
    }
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Transient(source) => write!(f, "transient store failure: {source}"),
            StoreError::Severe(source) => write!(f, "severe store failure: {source}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Transient(source) | StoreError::Severe(source) => Some(source.as_ref()),
        }
    }
}
