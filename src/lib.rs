//! Gatekeeper - Admission Control Engine
//!
//! This crate implements an admission-control layer for multi-tenant
//! backends. Per incoming operation it decides whether a caller (tenant,
//! user, or IP) may proceed, based on rolling time-window quotas tied to a
//! subscription tier, and it shields unhealthy backend instances from
//! further load via circuit breaking and least-connections routing.
//!
//! Quota counting runs against a shared Redis store with a single atomic
//! script per check; when the store is unreachable the engine degrades to an
//! in-process fallback limiter (or denies everything, if configured
//! fail-closed) and resumes on its own once the store recovers.

pub mod config;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod routing;

pub use config::GatekeeperConfig;
pub use error::{GatekeeperError, Result};
pub use limiter::{
    CounterStore, FallbackLimiter, LimiterBackend, LimiterFacade, RateLimitDecision, RateLimitKey,
    RedisStore, SlidingWindowLimiter, StoreError, WindowCheck,
};
pub use middleware::{
    Admission, AdmissionMiddleware, AdmissionRequest, AdmissionResponse, CallerIdentity,
    RateLimitHeaders, ThrottleResponse,
};
pub use policy::{EndpointCategory, PolicyCatalog, PolicyTier, QuotaLimit};
pub use routing::{
    BackendInstance, CircuitBreaker, CircuitState, DispatchError, InstanceSnapshot, LoadDistributor,
};
