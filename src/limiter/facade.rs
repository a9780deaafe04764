//! Limiter facade: backend selection and decision normalization.
//!
//! Tries the remote sliding-window limiter first and switches to the local
//! fallback only on store failures (timeout, connection loss), never on a
//! valid over-limit result. The remote store is re-tried on every call, so
//! service resumes on its own once the store recovers.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::fallback::FallbackLimiter;
use super::key::RateLimitKey;
use super::sliding::{SlidingWindowLimiter, WindowCheck};
use super::store::CounterStore;
use crate::config::GatekeeperConfig;
use crate::policy::{EndpointCategory, PolicyCatalog, PolicyTier, QuotaLimit};

/// Which limiter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterBackend {
    /// The shared remote counter store
    Remote,
    /// The in-process fallback limiter
    Local,
    /// No counter was consulted (unlimited policy, or fail-closed denial)
    Skipped,
}

/// The normalized admission decision.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The applicable limit; `u64::MAX` for unlimited policies
    pub limit: u64,
    /// Quota remaining after this check
    pub remaining: u64,
    /// When the consumed slot leaves the window
    pub reset_at: DateTime<Utc>,
    /// True when the decision was made without the shared store
    pub degraded: bool,
    /// Which limiter served the decision
    pub served_by: LimiterBackend,
}

impl RateLimitDecision {
    fn from_check(check: WindowCheck, limit: u64, degraded: bool, served_by: LimiterBackend) -> Self {
        Self {
            allowed: check.allowed,
            limit,
            remaining: check.remaining,
            reset_at: check.reset_at,
            degraded,
            served_by,
        }
    }

    /// Seconds a denied caller should wait before retrying, at least one.
    pub fn retry_after_secs(&self) -> u64 {
        let seconds = (self.reset_at - Utc::now()).num_seconds();
        seconds.max(1) as u64
    }
}

/// Chooses between the remote and fallback limiters and normalizes the
/// result into a single decision type.
pub struct LimiterFacade {
    catalog: Arc<PolicyCatalog>,
    remote: SlidingWindowLimiter,
    fallback: FallbackLimiter,
    fail_open: bool,
}

impl LimiterFacade {
    /// Create a facade over the given counter store.
    pub fn new(
        catalog: Arc<PolicyCatalog>,
        store: Arc<dyn CounterStore>,
        config: &GatekeeperConfig,
    ) -> Self {
        Self {
            catalog,
            remote: SlidingWindowLimiter::new(store, &config.store),
            fallback: FallbackLimiter::new(),
            fail_open: config.limiter.fail_open,
        }
    }

    /// Check the quota for one caller and endpoint category.
    pub async fn check(
        &self,
        identifier: &str,
        tier: PolicyTier,
        category: EndpointCategory,
    ) -> RateLimitDecision {
        let rule = self.catalog.resolve(tier, category);
        let window = rule.window();

        let limit = match rule.limit {
            QuotaLimit::Unlimited => {
                // Top-tier callers pay no store round trip.
                trace!(identifier = %identifier, category = %category, "Unlimited policy, skipping counters");
                return RateLimitDecision {
                    allowed: true,
                    limit: u64::MAX,
                    remaining: u64::MAX,
                    reset_at: Utc::now() + window,
                    degraded: false,
                    served_by: LimiterBackend::Skipped,
                };
            }
            QuotaLimit::Finite(limit) => limit,
        };

        let key = RateLimitKey::new(identifier, category, rule.window_name());

        match self.remote.check_and_increment(&key, limit, window).await {
            Ok(check) => RateLimitDecision::from_check(check, limit, false, LimiterBackend::Remote),
            Err(e) if self.fail_open => {
                warn!(
                    key = %key,
                    error = %e,
                    "Counter store unavailable, degrading to local fallback limiter"
                );
                let check = self.fallback.check_and_increment(&key, limit, window);
                RateLimitDecision::from_check(check, limit, true, LimiterBackend::Local)
            }
            Err(e) => {
                warn!(
                    key = %key,
                    error = %e,
                    "Counter store unavailable, denying request (fail-closed)"
                );
                RateLimitDecision {
                    allowed: false,
                    limit,
                    remaining: 0,
                    reset_at: Utc::now() + window,
                    degraded: true,
                    served_by: LimiterBackend::Skipped,
                }
            }
        }
    }

    /// Drop idle local fallback state.
    pub fn prune_fallback(&self) {
        let before = self.fallback.key_count();
        self.fallback.prune_idle();
        // Concurrent traffic can add keys between the two counts, so the
        // difference is clamped rather than trusted.
        debug!(
            pruned = before.saturating_sub(self.fallback.key_count()),
            "Pruned idle fallback limiter keys"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::testing::{FlakyStore, MemoryStore};

    fn test_facade(store: Arc<dyn CounterStore>) -> LimiterFacade {
        LimiterFacade::new(
            Arc::new(PolicyCatalog::default()),
            store,
            &GatekeeperConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_remote_decision_counts_down() {
        let facade = test_facade(Arc::new(MemoryStore::new()));

        // Free/ai_operation allows 20 per day in the default catalog.
        let first = facade
            .check("tenant:1", PolicyTier::Free, EndpointCategory::AiOperation)
            .await;
        assert!(first.allowed);
        assert_eq!(first.limit, 20);
        assert_eq!(first.remaining, 19);
        assert_eq!(first.served_by, LimiterBackend::Remote);
        assert!(!first.degraded);
    }

    #[tokio::test]
    async fn test_unlimited_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let facade = test_facade(store.clone());

        for _ in 0..50 {
            let decision = facade
                .check(
                    "tenant:big",
                    PolicyTier::Enterprise,
                    EndpointCategory::Authenticated,
                )
                .await;
            assert!(decision.allowed);
            assert_eq!(decision.served_by, LimiterBackend::Skipped);
        }

        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_over_limit_is_not_a_fallback_trigger() {
        let store = Arc::new(MemoryStore::new());
        let facade = test_facade(store.clone());

        // Exhaust the free/ai quota of 20, then one more.
        for _ in 0..20 {
            let decision = facade
                .check("user:9", PolicyTier::Free, EndpointCategory::AiOperation)
                .await;
            assert!(decision.allowed);
        }
        let denied = facade
            .check("user:9", PolicyTier::Free, EndpointCategory::AiOperation)
            .await;

        assert!(!denied.allowed);
        // Still a remote decision; the fallback limiter never ran.
        assert_eq!(denied.served_by, LimiterBackend::Remote);
        assert!(!denied.degraded);
    }

    #[tokio::test]
    async fn test_outage_degrades_then_recovers() {
        let store = Arc::new(FlakyStore::new());
        let facade = test_facade(store.clone());

        let check = |tier, category| facade.check("tenant:7", tier, category);

        for _ in 0..3 {
            let decision = check(PolicyTier::Starter, EndpointCategory::Authenticated).await;
            assert!(decision.allowed);
            assert_eq!(decision.served_by, LimiterBackend::Remote);
        }

        store.set_down(true);
        for _ in 0..3 {
            let decision = check(PolicyTier::Starter, EndpointCategory::Authenticated).await;
            assert!(decision.allowed);
            assert!(decision.degraded);
            assert_eq!(decision.served_by, LimiterBackend::Local);
        }

        store.set_down(false);
        let decision = check(PolicyTier::Starter, EndpointCategory::Authenticated).await;
        assert!(!decision.degraded);
        assert_eq!(decision.served_by, LimiterBackend::Remote);
    }

    #[tokio::test]
    async fn test_fail_closed_denies_during_outage() {
        let store = Arc::new(FlakyStore::new());
        store.set_down(true);

        let mut config = GatekeeperConfig::default();
        config.limiter.fail_open = false;
        let facade = LimiterFacade::new(Arc::new(PolicyCatalog::default()), store, &config);

        let decision = facade
            .check("tenant:7", PolicyTier::Starter, EndpointCategory::Authenticated)
            .await;
        assert!(!decision.allowed);
        assert!(decision.degraded);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_fallback_state_is_separate_from_remote() {
        let store = Arc::new(FlakyStore::new());
        let facade = test_facade(store.clone());

        // Consume most of the free/public quota of 30 remotely.
        for _ in 0..29 {
            assert!(facade
                .check("ip:1.2.3.4", PolicyTier::Free, EndpointCategory::Public)
                .await
                .allowed);
        }

        // The fallback limiter starts from a clean window, not from the
        // remote count.
        store.set_down(true);
        let decision = facade
            .check("ip:1.2.3.4", PolicyTier::Free, EndpointCategory::Public)
            .await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 29);
    }

    #[tokio::test]
    async fn test_prune_keeps_active_fallback_keys() {
        let store = Arc::new(FlakyStore::new());
        store.set_down(true);
        let facade = test_facade(store);

        facade
            .check("tenant:7", PolicyTier::Starter, EndpointCategory::Authenticated)
            .await;
        assert_eq!(facade.fallback.key_count(), 1);

        // Pruning right away finds nothing idle and must cope with the
        // key count not having shrunk.
        facade.prune_fallback();
        assert_eq!(facade.fallback.key_count(), 1);
    }
}
