//! Policy catalog: quota resolution by subscription tier and endpoint category.
//!
//! The catalog is a read-only table built once at startup, either from the
//! built-in defaults or from a YAML file. Lookup never fails: a missing row
//! degrades to the tier's `public` row, and failing that to the built-in
//! most restrictive policy, logging a configuration warning either way.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LimiterConfig;
use crate::error::{GatekeeperError, Result};

/// Subscription tier of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    Free,
    Starter,
    Professional,
    Enterprise,
}

/// Category of the endpoint being called.
///
/// Determines which policy row applies. Webhook ingestion and AI operations
/// carry their own quotas independent of ordinary API traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    Public,
    Authenticated,
    AiOperation,
    Webhook,
}

impl EndpointCategory {
    /// Stable string form, used in counter key rendering.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::Public => "public",
            EndpointCategory::Authenticated => "authenticated",
            EndpointCategory::AiOperation => "ai_operation",
            EndpointCategory::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quota limit: either a finite request count per window or unlimited.
///
/// Unlimited rows cause the limiter facade to skip the counter store
/// entirely, so top-tier callers pay no round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Finite(u64),
    Unlimited,
}

impl QuotaLimit {
    /// Whether the limit admits any number of requests.
    pub fn is_unlimited(&self) -> bool {
        matches!(self, QuotaLimit::Unlimited)
    }
}

impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            QuotaLimit::Finite(n) => serializer.serialize_u64(*n),
            QuotaLimit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for QuotaLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u64),
            Keyword(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(QuotaLimit::Finite(n)),
            Repr::Keyword(word) if word == "unlimited" => Ok(QuotaLimit::Unlimited),
            Repr::Keyword(word) => Err(serde::de::Error::custom(format!(
                "invalid quota limit {:?}, expected a count or \"unlimited\"",
                word
            ))),
        }
    }
}

/// A single policy row: how many requests a caller may make per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Maximum accepted requests within the window
    pub limit: QuotaLimit,
    /// Rolling window length in seconds
    pub window_secs: u64,
}

impl PolicyRule {
    /// The rolling window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Window name used to scope counter keys, e.g. `"60s"`.
    pub fn window_name(&self) -> String {
        format!("{}s", self.window_secs)
    }
}

/// Applied when even the public row is missing for a tier.
const MOST_RESTRICTIVE: PolicyRule = PolicyRule {
    limit: QuotaLimit::Finite(30),
    window_secs: 60,
};

/// Read-only policy table resolving (tier, category) to a quota rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCatalog {
    /// Rows indexed by tier, then by endpoint category
    tiers: HashMap<PolicyTier, HashMap<EndpointCategory, PolicyRule>>,
}

impl PolicyCatalog {
    /// Build the catalog the limiter configuration asks for: the YAML file
    /// at `policy_path` when one is set, the built-in grid otherwise.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        match &config.policy_path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Load a catalog from a YAML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading policy catalog");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a catalog from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: PolicyCatalog = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse policy catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Resolve the policy rule for a tier and endpoint category.
    ///
    /// A missing row degrades to the tier's `public` row, then to the
    /// built-in most restrictive rule. Resolution never fails.
    pub fn resolve(&self, tier: PolicyTier, category: EndpointCategory) -> PolicyRule {
        let rows = match self.tiers.get(&tier) {
            Some(rows) => rows,
            None => {
                warn!(
                    tier = ?tier,
                    "No policy rows configured for tier, applying most restrictive rule"
                );
                return MOST_RESTRICTIVE;
            }
        };

        if let Some(rule) = rows.get(&category) {
            return *rule;
        }

        warn!(
            tier = ?tier,
            category = %category,
            "No policy row for category, falling back to public row"
        );

        rows.get(&EndpointCategory::Public)
            .copied()
            .unwrap_or(MOST_RESTRICTIVE)
    }

    /// Validate the catalog shape.
    ///
    /// Every tier must carry a `public` row (the fallback target for unknown
    /// categories), and no window may be zero.
    fn validate(&self) -> Result<()> {
        for (tier, rows) in &self.tiers {
            if !rows.contains_key(&EndpointCategory::Public) {
                return Err(GatekeeperError::Config(format!(
                    "Tier {:?} has no public policy row",
                    tier
                )));
            }
            for (category, rule) in rows {
                if rule.window_secs == 0 {
                    return Err(GatekeeperError::Config(format!(
                        "Zero-length window for tier {:?}, category {}",
                        tier, category
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for PolicyCatalog {
    /// The built-in policy grid, used when no YAML file is supplied.
    fn default() -> Self {
        use EndpointCategory::*;
        use PolicyTier::*;
        use QuotaLimit::*;

        const MINUTE: u64 = 60;
        const DAY: u64 = 86_400;

        fn rule(limit: QuotaLimit, window_secs: u64) -> PolicyRule {
            PolicyRule { limit, window_secs }
        }

        let mut tiers = HashMap::new();

        tiers.insert(
            Free,
            HashMap::from([
                (Public, rule(Finite(30), MINUTE)),
                (Authenticated, rule(Finite(60), MINUTE)),
                (AiOperation, rule(Finite(20), DAY)),
                (Webhook, rule(Finite(120), MINUTE)),
            ]),
        );
        tiers.insert(
            Starter,
            HashMap::from([
                (Public, rule(Finite(60), MINUTE)),
                (Authenticated, rule(Finite(300), MINUTE)),
                (AiOperation, rule(Finite(100), DAY)),
                (Webhook, rule(Finite(600), MINUTE)),
            ]),
        );
        tiers.insert(
            Professional,
            HashMap::from([
                (Public, rule(Finite(120), MINUTE)),
                (Authenticated, rule(Finite(1000), MINUTE)),
                (AiOperation, rule(Finite(500), DAY)),
                (Webhook, rule(Finite(2000), MINUTE)),
            ]),
        );
        tiers.insert(
            Enterprise,
            HashMap::from([
                (Public, rule(Finite(300), MINUTE)),
                (Authenticated, rule(Unlimited, MINUTE)),
                (AiOperation, rule(Unlimited, DAY)),
                (Webhook, rule(Finite(10_000), MINUTE)),
            ]),
        );

        Self { tiers }
    }
}
