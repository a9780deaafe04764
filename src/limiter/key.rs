//! Counter key generation and handling.

use crate::policy::EndpointCategory;

/// A key that uniquely scopes one rolling-window counter.
///
/// The key is composed of the caller identifier, the endpoint category, and
/// the window name, so that the same caller gets independent counters for,
/// say, per-minute API traffic and per-day AI operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Opaque caller identifier (tenant id, user id, or IP)
    pub identifier: String,
    /// Endpoint category this counter applies to
    pub category: EndpointCategory,
    /// Window name, e.g. `"60s"`
    pub window_name: String,
}

impl RateLimitKey {
    /// Create a new rate limit key.
    pub fn new(identifier: &str, category: EndpointCategory, window_name: String) -> Self {
        Self {
            identifier: identifier.to_string(),
            category,
            window_name,
        }
    }

    /// Stable string rendering, used as the remote store key suffix.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.identifier, self.category, self.window_name)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
