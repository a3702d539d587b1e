//! Runtime glue: configuration, retry backoff, fatal error capture and telemetry.

pub(crate) mod backoff;
pub mod config;
pub mod fatal;
pub mod telemetry;
