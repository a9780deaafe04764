//! Least-connections routing across circuit-guarded backend instances.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::breaker::{CircuitBreaker, CircuitState};
use crate::config::CircuitConfig;

/// Error from dispatching an operation through the distributor.
#[derive(Debug, Error)]
pub enum DispatchError<E> {
    /// Every instance is circuit-open; the operation was never attempted.
    ///
    /// Distinct from quota exhaustion: this is a service-availability
    /// condition, not a caller misbehaving.
    #[error("No backend instance has capacity")]
    NoCapacity,

    /// The target operation itself failed
    #[error(transparent)]
    Target(E),
}

/// One routable backend instance with its load counter and breaker.
///
/// Instances live for the lifetime of the distributor that owns them and
/// are never persisted; the counters here are strictly process-local.
pub struct BackendInstance {
    id: String,
    in_flight: AtomicU64,
    served: AtomicU64,
    breaker: CircuitBreaker,
}

impl BackendInstance {
    /// Create an instance with a closed breaker.
    pub fn new(id: impl Into<String>, circuit: &CircuitConfig) -> Self {
        let id = id.into();
        Self {
            breaker: CircuitBreaker::new(id.clone(), circuit),
            id,
            in_flight: AtomicU64::new(0),
            served: AtomicU64::new(0),
        }
    }

    /// Instance identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Operations currently dispatched to this instance.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Operations completed successfully on this instance.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// The breaker guarding this instance.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

/// Point-in-time view of one instance, for observability.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub id: String,
    pub in_flight: u64,
    pub served: u64,
    pub state: CircuitState,
}

/// Routes each operation to the least-loaded instance whose breaker admits it.
pub struct LoadDistributor {
    instances: Vec<Arc<BackendInstance>>,
}

impl LoadDistributor {
    /// Create a distributor over the given instances.
    pub fn new(instances: Vec<Arc<BackendInstance>>) -> Self {
        Self { instances }
    }

    /// Convenience constructor from instance identifiers.
    pub fn from_ids<I, S>(ids: I, circuit: &CircuitConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            ids.into_iter()
                .map(|id| Arc::new(BackendInstance::new(id, circuit)))
                .collect(),
        )
    }

    /// Run `op` on the least-loaded healthy instance.
    ///
    /// The claimed in-flight slot is held by a guard for the whole dispatch,
    /// so cancelling the returned future releases the slot (and any claimed
    /// probe) instead of leaking it. Completed calls record their outcome on
    /// the instance's breaker. A failed operation is never retried here.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, DispatchError<E>>
    where
        F: FnOnce(Arc<BackendInstance>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let claim = match self.acquire() {
            Some(claim) => claim,
            None => {
                warn!("All backend instances are circuit-open");
                return Err(DispatchError::NoCapacity);
            }
        };

        debug!(
            instance = %claim.instance.id,
            in_flight = claim.instance.in_flight(),
            "Dispatching operation"
        );

        match op(Arc::clone(&claim.instance)).await {
            Ok(value) => {
                claim.success();
                Ok(value)
            }
            Err(e) => {
                warn!(instance = %claim.instance.id, error = %e, "Backend operation failed");
                claim.failure();
                Err(DispatchError::Target(e))
            }
        }
    }

    /// Pick the least-loaded instance whose breaker admits a call and claim
    /// an in-flight slot on it.
    fn acquire(&self) -> Option<DispatchClaim> {
        let mut candidates: Vec<&Arc<BackendInstance>> = self.instances.iter().collect();
        candidates.sort_by_key(|i| i.in_flight());

        // Preflight in load order: a half-open breaker claims its probe slot
        // here, so only the instance actually chosen consumes it.
        for instance in candidates {
            if let Ok(is_probe) = instance.breaker.preflight_claim() {
                instance.in_flight.fetch_add(1, Ordering::SeqCst);
                return Some(DispatchClaim {
                    instance: Arc::clone(instance),
                    is_probe,
                    settled: false,
                });
            }
        }
        None
    }

    /// Snapshot every instance's counters and breaker state.
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .iter()
            .map(|i| InstanceSnapshot {
                id: i.id.clone(),
                in_flight: i.in_flight(),
                served: i.served(),
                state: i.breaker.state(),
            })
            .collect()
    }

    /// The instances this distributor routes across.
    pub fn instances(&self) -> &[Arc<BackendInstance>] {
        &self.instances
    }
}

/// Holds one in-flight slot (and, during recovery, the probe slot) on an
/// instance until the dispatch settles.
///
/// Dropping the claim without an outcome releases the slot and reports an
/// abandoned probe to the breaker, so a cancelled dispatch cannot pin the
/// in-flight counter or wedge the breaker half-open.
struct DispatchClaim {
    instance: Arc<BackendInstance>,
    is_probe: bool,
    settled: bool,
}

impl DispatchClaim {
    fn success(mut self) {
        self.release();
        self.instance.served.fetch_add(1, Ordering::SeqCst);
        self.instance.breaker.record_success();
    }

    fn failure(mut self) {
        self.release();
        self.instance.breaker.record_failure();
    }

    fn release(&mut self) {
        self.settled = true;
        self.instance.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for DispatchClaim {
    fn drop(&mut self) {
        if !self.settled {
            self.instance.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.is_probe {
                self.instance.breaker.abandon_probe();
            }
        }
    }
}
