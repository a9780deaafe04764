//! Rolling-window rate limiting: remote store, local fallback, and facade.

mod facade;
mod fallback;
mod key;
mod sliding;
mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use facade::{LimiterBackend, LimiterFacade, RateLimitDecision};
pub use fallback::FallbackLimiter;
pub use key::RateLimitKey;
pub use sliding::{SlidingWindowLimiter, WindowCheck};
pub use store::{CounterStore, RedisStore, StoreError};
