//! Spill worker split across focused submodules:
//! - `types`: stats, limits and batch containers
//! - `shared`: state shared between a worker task and dispatching callers
//! - `admission`: `add_task`, delete-driven cancellation and waiting-queue promotion
//! - `batch`: batch building under the worker lock
//! - `writer`: staging, executing and settling a batch
//! - `errors`: the per-worker write-error state machine
//! - `process`: worker struct plus the run loop
//! - `tests`: worker unit tests

mod admission;
mod batch;
mod errors;
mod process;
mod shared;
mod types;
mod writer;


pub use process::Worker;
pub use shared::WorkerShared;
pub(crate) use shared::WorkerSharedParams;
pub use types::{WorkerStats, WriteErrorState};
