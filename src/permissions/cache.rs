//! TTL cache for permission decisions.
//!
//! A decision depends only on the caller's groups and the checked target,
//! so entries are keyed on exactly that. A user whose group membership
//! changes between tokens never reads a decision made for the old groups.
//!
//! Expired entries are swept on insert at most once per TTL. The cache
//! holds at most `max_entries` decisions; when full, expired entries are
//! swept first and then the oldest entry makes room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::service::PermissionCheckResult;

/// Default upper bound on cached decisions.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Identity of one cached decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    groups: Vec<String>,
    kind: &'static str,
    target: String,
}

struct CachedDecision {
    result: PermissionCheckResult,
    cached_at: Instant,
}

impl CachedDecision {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.cached_at.elapsed() > ttl
    }
}

/// Thread-safe, bounded decision cache with a single TTL.
pub struct DecisionCache {
    entries: DashMap<DecisionKey, CachedDecision>,
    ttl: Duration,
    max_entries: usize,
    last_sweep: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DecisionCache {
    /// Create an empty cache whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            last_sweep: Mutex::new(Instant::now()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cap the number of held decisions (at least one).
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Build the key for one decision.
    #[must_use]
    pub fn key(groups: &[String], kind: &'static str, target: &str) -> DecisionKey {
        DecisionKey {
            groups: groups.to_vec(),
            kind,
            target: target.to_string(),
        }
    }

    /// Cached decision, if present and fresh. Stale entries are evicted.
    pub fn get(&self, key: &DecisionKey) -> Option<PermissionCheckResult> {
        let Some(entry) = self.entries.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(self.ttl) {
            drop(entry);
            self.entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.result.clone())
    }

    /// Store a decision, making room first when the cache is full.
    pub fn insert(&self, key: DecisionKey, result: PermissionCheckResult) {
        if self.sweep_due() {
            self.evict_expired();
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }

        self.entries.insert(
            key,
            CachedDecision {
                result,
                cached_at: Instant::now(),
            },
        );
    }

    /// Remove every expired entry.
    pub fn evict_expired(&self) {
        let expired: Vec<DecisionKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(self.ttl))
            .map(|entry| entry.key().clone())
            .collect();

        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }

        if count > 0 {
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "Evicted expired permission decisions");
        }
    }

    fn sweep_due(&self) -> bool {
        let mut last = self.last_sweep.lock();
        if last.elapsed() < self.ttl {
            return false;
        }
        *last = Instant::now();
        true
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().cached_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every cached decision. Counters are kept.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate,
        }
    }
}

/// Snapshot of decision cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Lookups served from cache
    pub hits: u64,
    /// Lookups that had to evaluate rules
    pub misses: u64,
    /// Entries removed for staleness or capacity
    pub evictions: u64,
    /// Entries currently held
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
