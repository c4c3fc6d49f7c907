//! Sliding-window rate limiting and connection admission control.
//!
//! Both checks live in the shared store so every gateway process observes
//! the same counts. Store calls are guarded by the store's circuit breaker;
//! when the store is unavailable the configured [`FailurePolicy`] decides
//! between allowing and denying.
//!
//! The window algorithm is purge-expired, count, then insert. The sequence
//! is not atomic across callers: under high concurrency two checks can both
//! observe `count < limit` and both insert, slightly exceeding the limit.
//! This approximate behavior is accepted; hardening it requires an atomic
//! check-and-increment on the store side.

use crate::breaker::CircuitBreaker;
use crate::store::{SharedStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Behavior when the store needed for a rate decision is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the request (availability over enforcement).
    Open,
    /// Deny the request (enforcement over availability).
    Closed,
}

/// A per-scope rate quota.
#[derive(Debug, Clone)]
pub struct Quota {
    /// Maximum events per window.
    pub limit: u32,
    /// Trailing window length.
    pub window: Duration,
    /// Optional burst cap; the effective limit is `min(burst, limit)`.
    pub burst: Option<u32>,
}

impl Quota {
    /// Create a quota without a burst cap.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            burst: None,
        }
    }

    /// Limit actually enforced for this quota.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.burst.map_or(self.limit, |b| b.min(self.limit))
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the event was admitted (and recorded).
    pub allowed: bool,
    /// Events left in the window after this one.
    pub remaining: u32,
}

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Policy applied when the store is unavailable.
    pub policy: FailurePolicy,
    /// Maximum live connections per identity.
    pub max_connections_per_identity: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::Open,
            max_connections_per_identity: 10,
        }
    }
}

/// Counter making window members unique within a process even at the same
/// millisecond.
static MEMBER_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Sliding-window rate limiter with a connection-admission set.
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
    config: LimiterConfig,
}

impl RateLimiter {
    /// Create a limiter over a shared store, guarded by that store's
    /// circuit breaker.
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        breaker: Arc<CircuitBreaker>,
        config: LimiterConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            config,
        }
    }

    /// Key for a per-identity rate scope.
    #[must_use]
    pub fn scope_key(scope: &str, principal: &str) -> String {
        format!("rate:{scope}:{principal}")
    }

    fn admission_key(principal: &str) -> String {
        format!("conn:{principal}")
    }

    /// Check the quota for `key` and record the event if admitted.
    ///
    /// Entries older than the window are purged before counting. On
    /// admission a collision-resistant member is inserted and the key's TTL
    /// refreshed to twice the window; on denial nothing is inserted.
    pub async fn check_and_record(&self, key: &str, quota: &Quota) -> RateDecision {
        let now = now_ms();
        let cutoff = now.saturating_sub(quota.window.as_millis() as u64);
        let effective = quota.effective_limit();
        let ttl = quota.window * 2;

        let result = self
            .breaker
            .call(|| async {
                let count = self.store.window_count(key, cutoff).await?;
                if count >= u64::from(effective) {
                    return Ok(RateDecision {
                        allowed: false,
                        remaining: 0,
                    });
                }

                let member = format!("{now}-{}", MEMBER_COUNTER.fetch_add(1, Ordering::Relaxed));
                self.store.window_add(key, &member, now, ttl).await?;

                Ok::<_, StoreError>(RateDecision {
                    allowed: true,
                    remaining: effective - count as u32 - 1,
                })
            })
            .await;

        match result {
            Ok(decision) => {
                debug!(
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "Rate check"
                );
                decision
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Rate check failed, applying failure policy");
                match self.config.policy {
                    FailurePolicy::Open => RateDecision {
                        allowed: true,
                        remaining: effective,
                    },
                    FailurePolicy::Closed => RateDecision {
                        allowed: false,
                        remaining: 0,
                    },
                }
            }
        }
    }

    /// Try to claim a connection slot for `principal`.
    ///
    /// Adds `connection_id` to the identity's admission set and keeps it
    /// only if the resulting cardinality stays within the configured
    /// maximum; a rejected claim is rolled back so nothing is left behind.
    pub async fn try_admit(&self, principal: &str, connection_id: &str) -> bool {
        let key = Self::admission_key(principal);
        let max = u64::from(self.config.max_connections_per_identity);

        let result = self
            .breaker
            .call(|| async {
                let cardinality = self.store.set_add(&key, connection_id).await?;
                if cardinality > max {
                    self.store.set_remove(&key, connection_id).await?;
                    return Ok(false);
                }
                Ok::<_, StoreError>(true)
            })
            .await;

        match result {
            Ok(admitted) => {
                if !admitted {
                    warn!(
                        principal = %principal,
                        connection = %connection_id,
                        max,
                        "Connection admission denied"
                    );
                }
                admitted
            }
            Err(err) => {
                warn!(
                    principal = %principal,
                    error = %err,
                    "Admission check failed, applying failure policy"
                );
                matches!(self.config.policy, FailurePolicy::Open)
            }
        }
    }

    /// Release a connection slot. Idempotent; failures are logged, never
    /// surfaced, so cleanup paths cannot error.
    pub async fn release(&self, principal: &str, connection_id: &str) {
        let key = Self::admission_key(principal);
        let result = self
            .breaker
            .call(|| async { self.store.set_remove(&key, connection_id).await })
            .await;

        if let Err(err) = result {
            warn!(
                principal = %principal,
                connection = %connection_id,
                error = %err,
                "Failed to release admission slot"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn limiter_with(store: Arc<dyn SharedStore>, policy: FailurePolicy) -> RateLimiter {
        RateLimiter::new(
            store,
            Arc::new(CircuitBreaker::new("store", BreakerConfig::default())),
            LimiterConfig {
                policy,
                max_connections_per_identity: 2,
            },
        )
    }

    fn open_limiter() -> RateLimiter {
        limiter_with(Arc::new(MemoryStore::new()), FailurePolicy::Open)
    }

    /// Store that always fails, for failure-policy tests.
    struct DownStore;

    #[async_trait]
    impl SharedStore for DownStore {
        async fn window_count(&self, _: &str, _: u64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn window_add(&self, _: &str, _: &str, _: u64, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_add(&self, _: &str, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_remove(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn set_members(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_window_counts_down_then_denies() {
        let limiter = open_limiter();
        let quota = Quota::new(3, Duration::from_secs(60));
        let key = RateLimiter::scope_key("message", "u1");

        for expected in [2, 1, 0] {
            let decision = limiter.check_and_record(&key, &quota).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let denied = limiter.check_and_record(&key, &quota).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn test_window_recovers_after_expiry() {
        let limiter = open_limiter();
        let quota = Quota::new(3, Duration::from_millis(100));
        let key = RateLimiter::scope_key("message", "u1");

        for _ in 0..3 {
            assert!(limiter.check_and_record(&key, &quota).await.allowed);
        }
        assert!(!limiter.check_and_record(&key, &quota).await.allowed);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let decision = limiter.check_and_record(&key, &quota).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_burst_caps_effective_limit() {
        let limiter = open_limiter();
        let quota = Quota {
            limit: 5,
            window: Duration::from_secs(60),
            burst: Some(2),
        };
        let key = RateLimiter::scope_key("message", "u1");

        assert_eq!(limiter.check_and_record(&key, &quota).await.remaining, 1);
        assert_eq!(limiter.check_and_record(&key, &quota).await.remaining, 0);
        assert!(!limiter.check_and_record(&key, &quota).await.allowed);
    }

    #[tokio::test]
    async fn test_admission_enforces_maximum() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter_with(store.clone(), FailurePolicy::Open);

        assert!(limiter.try_admit("u1", "c1").await);
        assert!(limiter.try_admit("u1", "c2").await);
        assert!(!limiter.try_admit("u1", "c3").await);

        // Rejection leaves the tracked set untouched.
        let mut members = store.set_members("conn:u1").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["c1", "c2"]);

        limiter.release("u1", "c1").await;
        assert!(limiter.try_admit("u1", "c3").await);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let limiter = open_limiter();

        assert!(limiter.try_admit("u1", "c1").await);
        limiter.release("u1", "c1").await;
        limiter.release("u1", "c1").await;
        assert!(limiter.try_admit("u1", "c1").await);
    }

    #[tokio::test]
    async fn test_fail_open_allows_when_store_down() {
        let limiter = limiter_with(Arc::new(DownStore), FailurePolicy::Open);
        let quota = Quota::new(3, Duration::from_secs(60));

        let decision = limiter.check_and_record("rate:message:u1", &quota).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
        assert!(limiter.try_admit("u1", "c1").await);
    }

    #[tokio::test]
    async fn test_fail_closed_denies_when_store_down() {
        let limiter = limiter_with(Arc::new(DownStore), FailurePolicy::Closed);
        let quota = Quota::new(3, Duration::from_secs(60));

        let decision = limiter.check_and_record("rate:message:u1", &quota).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.try_admit("u1", "c1").await);
    }
}
