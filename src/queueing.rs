//! Queue primitives owned by each worker: completion latches, queue elements, and the
//! four dispatch queues with their item index.

pub mod element;
pub mod notifier;
pub mod queues;
