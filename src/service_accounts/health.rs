//! Service account health tracking
//!
//! Tracks per-account health:
//! - Consecutive failures, flipping the account unhealthy at a threshold
//! - Last success/failure timestamps and the last error
//! - Operator overrides
//!
//! Request paths read this snapshot; only the monitor and resolution
//! attempts write it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::mapper::ServiceAccountMapper;

/// Health record for one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountHealth {
    /// Account id
    pub account_id: String,
    /// Whether the account may be selected
    pub healthy: bool,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Last successful validation
    pub last_success: Option<DateTime<Utc>>,
    /// Last failed validation
    pub last_failure: Option<DateTime<Utc>>,
    /// Most recent error text
    pub last_error: Option<String>,
}

impl AccountHealth {
    fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            healthy: true,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
        }
    }
}

/// Health records for every account.
pub struct HealthRegistry {
    records: DashMap<String, AccountHealth>,
    failure_threshold: u32,
}

impl HealthRegistry {
    /// Create a registry; `failure_threshold` consecutive failures flip an
    /// account unhealthy.
    #[must_use]
    pub fn new<'a>(account_ids: impl IntoIterator<Item = &'a str>, failure_threshold: u32) -> Self {
        Self {
            records: account_ids
                .into_iter()
                .map(|id| (id.to_string(), AccountHealth::new(id)))
                .collect(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Returns `true` unless the account is marked unhealthy. Unknown
    /// accounts count as healthy.
    #[must_use]
    pub fn is_healthy(&self, account_id: &str) -> bool {
        self.records.get(account_id).is_none_or(|r| r.healthy)
    }

    /// Record a successful validation; resets the failure counter.
    pub fn record_success(&self, account_id: &str) {
        let mut entry = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| AccountHealth::new(account_id));
        if !entry.healthy {
            info!(account = %account_id, "Service account recovered");
        }
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_success = Some(Utc::now());
        entry.last_error = None;
    }

    /// Record a failed validation.
    pub fn record_failure(&self, account_id: &str, error: &str) {
        let mut entry = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| AccountHealth::new(account_id));
        entry.consecutive_failures += 1;
        entry.last_failure = Some(Utc::now());
        entry.last_error = Some(error.to_string());

        if entry.consecutive_failures >= self.failure_threshold && entry.healthy {
            entry.healthy = false;
            warn!(
                account = %account_id,
                consecutive_failures = entry.consecutive_failures,
                error = %error,
                "Service account marked unhealthy"
            );
        }
    }

    /// Force an account unhealthy.
    pub fn mark_unhealthy(&self, account_id: &str, reason: &str) {
        let mut entry = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| AccountHealth::new(account_id));
        entry.healthy = false;
        entry.last_error = Some(reason.to_string());
        warn!(account = %account_id, reason = %reason, "Service account marked unhealthy by operator");
    }

    /// Force an account healthy and reset its counter.
    pub fn mark_healthy(&self, account_id: &str) {
        let mut entry = self
            .records
            .entry(account_id.to_string())
            .or_insert_with(|| AccountHealth::new(account_id));
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.last_error = None;
        info!(account = %account_id, "Service account marked healthy by operator");
    }

    /// Record for one account.
    #[must_use]
    pub fn get(&self, account_id: &str) -> Option<AccountHealth> {
        self.records.get(account_id).map(|r| r.value().clone())
    }

    /// Records for all accounts, sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<AccountHealth> {
        let mut all: Vec<AccountHealth> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        all
    }
}

/// Periodically pings every service account.
pub struct ServiceAccountHealthMonitor {
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceAccountHealthMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            handle: Mutex::new(None),
        }
    }

    /// Start probing `mapper`'s accounts. No-op when already running or
    /// outside a tokio runtime.
    pub fn start(&self, mapper: &Arc<ServiceAccountMapper>) {
        let mut guard = self.handle.lock();
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; service account probes not started");
            return;
        };

        let mapper: Weak<ServiceAccountMapper> = Arc::downgrade(mapper);
        let period = self.interval;
        *guard = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(mapper) = mapper.upgrade() else {
                    break;
                };
                mapper.probe_all().await;
            }
        }));
        info!(interval_secs = period.as_secs(), "Started service account health checks");
    }

    /// Stop probing.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Stopped service account health checks");
        }
    }

    /// Returns `true` while the probe timer is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ServiceAccountHealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_flips_unhealthy_and_success_resets() {
        // GIVEN: a threshold of 3
        let registry = HealthRegistry::new(["sa1"], 3);

        // WHEN: two failures
        registry.record_failure("sa1", "boom");
        registry.record_failure("sa1", "boom");

        // THEN: still healthy
        assert!(registry.is_healthy("sa1"));

        // WHEN: third failure
        registry.record_failure("sa1", "boom");

        // THEN: unhealthy with the error attached
        assert!(!registry.is_healthy("sa1"));
        let record = registry.get("sa1").unwrap();
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        // WHEN: one success
        registry.record_success("sa1");

        // THEN: healthy and reset
        let record = registry.get("sa1").unwrap();
        assert!(record.healthy);
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_success.is_some());
    }

    #[test]
    fn operator_overrides() {
        let registry = HealthRegistry::new(["sa1", "sa2"], 3);

        registry.mark_unhealthy("sa2", "maintenance");
        assert!(!registry.is_healthy("sa2"));

        registry.mark_healthy("sa2");
        assert!(registry.is_healthy("sa2"));
    }

    #[test]
    fn unknown_accounts_count_as_healthy() {
        let registry = HealthRegistry::new(std::iter::empty(), 3);

        assert!(registry.is_healthy("ghost"));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = HealthRegistry::new(["b", "a", "c"], 1);

        let ids: Vec<_> = registry.snapshot().into_iter().map(|h| h.account_id).collect();

        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn monitor_outside_runtime_stays_stopped() {
        let monitor = ServiceAccountHealthMonitor::new(Duration::from_secs(60));

        assert!(!monitor.is_running());
        monitor.stop();
    }
}
