//! Failure tracking and load distribution across backend instances.

mod breaker;
mod distributor;

pub use breaker::{CircuitBreaker, CircuitState};
pub use distributor::{BackendInstance, DispatchError, InstanceSnapshot, LoadDistributor};
