pub mod dispatcher;
pub mod error;
pub mod operation;
pub mod queueing;
pub mod runtime;
pub mod store;
pub mod worker;

pub use dispatcher::{DispatcherPhase, HealthSnapshot, SpillDispatcher, StopMode};
pub use error::DispatchError;
pub use operation::{
    EncodingError, ItemId, ItemLink, Operation, OperationKind, OperationRef, Persistable,
};
pub use queueing::notifier::CompletionNotifier;
pub use runtime::config::{
    DispatcherConfig, DispatcherConfigBuilder, DispatcherConfigParams, EnvProperties,
    MapProperties, PropertySource, Tunable,
};
pub use runtime::fatal::FatalErrorHandler;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{BatchingContext, BatchingContextFactory, StagedWrite, StoreError, StoreFuture};
pub use worker::{WorkerStats, WriteErrorState};
