//! Shared-store seam for rate-limit windows and admission sets.
//!
//! The store is an external collaborator (typically Redis); this module
//! defines the operations the limiter needs, each expressed as a single
//! logical round trip so no cross-process lock is required. [`MemoryStore`]
//! is the in-process implementation used for single-node deployments and
//! tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Store connectivity errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),
}

/// Key/ordered-set operations with expiry.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Purge window entries with a score below `min_score`, then return the
    /// number of surviving entries.
    async fn window_count(&self, key: &str, min_score: u64) -> Result<u64, StoreError>;

    /// Insert a window entry and refresh the key's time-to-live.
    async fn window_add(
        &self,
        key: &str,
        member: &str,
        score: u64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Add a member to a set, returning the resulting cardinality.
    async fn set_add(&self, key: &str, member: &str) -> Result<u64, StoreError>;

    /// Remove a member from a set. Idempotent: absent members are not an
    /// error.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of a set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug)]
struct WindowEntry {
    /// Events as (score, member) pairs, insertion-ordered.
    events: Vec<(u64, String)>,
    expires_at: Instant,
}

/// In-process store backed by lock-free maps.
///
/// TTL is honored lazily: expired window keys are dropped on next access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: DashMap<String, WindowEntry>,
    sets: DashMap<String, HashSet<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn window_count(&self, key: &str, min_score: u64) -> Result<u64, StoreError> {
        match self.windows.get_mut(key) {
            Some(mut entry) => {
                if entry.expires_at <= Instant::now() {
                    drop(entry);
                    self.windows.remove(key);
                    return Ok(0);
                }
                entry.events.retain(|(score, _)| *score >= min_score);
                Ok(entry.events.len() as u64)
            }
            None => Ok(0),
        }
    }

    async fn window_add(
        &self,
        key: &str,
        member: &str,
        score: u64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| WindowEntry {
            events: Vec::new(),
            expires_at: Instant::now() + ttl,
        });
        entry.events.push((score, member.to_string()));
        entry.expires_at = Instant::now() + ttl;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<u64, StoreError> {
        let mut entry = self.sets.entry(key.to_string()).or_default();
        entry.insert(member.to_string());
        Ok(entry.len() as u64)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut entry) = self.sets.get_mut(key) {
            entry.remove(member);
            if entry.is_empty() {
                drop(entry);
                self.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default())
    }
}
