//! Application layer: environment, services, runtime, metrics

pub mod metrics;
pub mod runtime;

pub use runtime::{Environment, Runtime, Service};
