//! Admission middleware: the request-path entry point.
//!
//! Resolves the caller's policy, asks the limiter facade for a decision, and
//! on success hands the operation to the load distributor. A denied request
//! produces a structured throttling response and never touches downstream
//! logic.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use crate::limiter::{LimiterFacade, RateLimitDecision};
use crate::policy::{EndpointCategory, PolicyTier};
use crate::routing::{BackendInstance, DispatchError, LoadDistributor};

/// The caller as seen at the boundary, before key selection.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub remote_ip: Option<IpAddr>,
}

impl CallerIdentity {
    /// The counter identifier for this caller: tenant over user over IP.
    pub fn identifier(&self) -> String {
        if let Some(tenant) = &self.tenant_id {
            format!("tenant:{}", tenant)
        } else if let Some(user) = &self.user_id {
            format!("user:{}", user)
        } else if let Some(ip) = &self.remote_ip {
            format!("ip:{}", ip)
        } else {
            "anonymous".to_string()
        }
    }
}

/// One inbound operation to admit or throttle.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// Already-resolved caller identifier
    pub identifier: String,
    /// Subscription tier supplied by the caller, not computed here
    pub tier: PolicyTier,
    /// Endpoint category of the operation
    pub category: EndpointCategory,
}

impl AdmissionRequest {
    /// Build a request from a pre-resolved identifier.
    pub fn new(identifier: impl Into<String>, tier: PolicyTier, category: EndpointCategory) -> Self {
        Self {
            identifier: identifier.into(),
            tier,
            category,
        }
    }

    /// Build a request from a caller identity.
    pub fn from_identity(
        identity: &CallerIdentity,
        tier: PolicyTier,
        category: EndpointCategory,
    ) -> Self {
        Self::new(identity.identifier(), tier, category)
    }
}

/// Quota metadata attached to outbound responses.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    /// Set only on throttled responses
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            retry_after_secs: (!decision.allowed).then(|| decision.retry_after_secs()),
        }
    }

    /// Render as header name/value pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            pairs.push(("Retry-After", retry_after.to_string()));
        }
        pairs
    }
}

/// Structured throttling response surfaced to the middleware's caller.
#[derive(Debug, Clone)]
pub struct ThrottleResponse {
    /// HTTP status, always 429
    pub status: u16,
    pub headers: RateLimitHeaders,
    pub body: serde_json::Value,
}

impl ThrottleResponse {
    fn from_decision(decision: &RateLimitDecision) -> Self {
        let headers = RateLimitHeaders::from_decision(decision);
        let body = json!({
            "error": {
                "code": "RATE_LIMIT_EXCEEDED",
                "message": "Too many requests. Please slow down.",
                "limit": decision.limit,
                "remaining": 0,
                "reset_at": decision.reset_at.to_rfc3339(),
                "retry_after_secs": headers.retry_after_secs,
            }
        });
        Self {
            status: 429,
            headers,
            body,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The request may proceed; attach the headers to the outbound response
    Allowed {
        decision: RateLimitDecision,
        headers: RateLimitHeaders,
    },
    /// The request is throttled; return the response as-is
    Denied(ThrottleResponse),
}

/// Outcome of admitting and executing an operation.
#[derive(Debug)]
pub enum AdmissionResponse<T> {
    /// The operation ran; quota metadata for the outbound response
    Executed { value: T, headers: RateLimitHeaders },
    /// The request was throttled before any downstream work
    Throttled(ThrottleResponse),
}

/// Request-boundary orchestration: policy, quota, then routing.
pub struct AdmissionMiddleware {
    facade: LimiterFacade,
    distributor: Arc<LoadDistributor>,
}

impl AdmissionMiddleware {
    /// Create the middleware over a limiter facade and a distributor.
    pub fn new(facade: LimiterFacade, distributor: Arc<LoadDistributor>) -> Self {
        Self {
            facade,
            distributor,
        }
    }

    /// Check the quota for one request without executing anything.
    pub async fn check(&self, request: &AdmissionRequest) -> Admission {
        let decision = self
            .facade
            .check(&request.identifier, request.tier, request.category)
            .await;

        if decision.allowed {
            Admission::Allowed {
                headers: RateLimitHeaders::from_decision(&decision),
                decision,
            }
        } else {
            debug!(
                identifier = %request.identifier,
                category = %request.category,
                "Request throttled"
            );
            Admission::Denied(ThrottleResponse::from_decision(&decision))
        }
    }

    /// Admit the request and, when allowed, run `op` on the least-loaded
    /// healthy backend instance.
    pub async fn execute<F, Fut, T, E>(
        &self,
        request: &AdmissionRequest,
        op: F,
    ) -> Result<AdmissionResponse<T>, DispatchError<E>>
    where
        F: FnOnce(Arc<BackendInstance>) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        match self.check(request).await {
            Admission::Denied(throttle) => Ok(AdmissionResponse::Throttled(throttle)),
            Admission::Allowed { headers, .. } => {
                let value = self.distributor.execute(op).await?;
                Ok(AdmissionResponse::Executed { value, headers })
            }
        }
    }

    /// The distributor this middleware routes through.
    pub fn distributor(&self) -> &Arc<LoadDistributor> {
        &self.distributor
    }
}
