//! Provider health tracking — passive, per-process, based on real request
//! outcomes only. Stats older than the window are reset on access.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// Observation window; stats older than this reset on access.
const HEALTH_WINDOW_MINUTES: i64 = 60;
/// A provider at or above this failure rate is skipped by failover.
const FAILURE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
struct Stats {
    success: u32,
    failure: u32,
    last_check: DateTime<Utc>,
}

/// Public snapshot for diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderHealthEntry {
    pub name: String,
    pub success_count: u32,
    pub failure_count: u32,
    pub failure_rate: f64,
    pub healthy: bool,
}

/// Concurrent per-process health tracker for all LLM providers.
pub struct HealthTracker {
    entries: DashMap<String, Stats>,
}

impl HealthTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
        })
    }

    pub fn record_success(&self, provider: &str) {
        let mut stats = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(|| Stats {
                success: 0,
                failure: 0,
                last_check: Utc::now(),
            });
        stats.success += 1;
        stats.last_check = Utc::now();
    }

    pub fn record_failure(&self, provider: &str) {
        let mut stats = self
            .entries
            .entry(provider.to_string())
            .or_insert_with(|| Stats {
                success: 0,
                failure: 0,
                last_check: Utc::now(),
            });
        stats.failure += 1;
        stats.last_check = Utc::now();
    }

    /// A provider is healthy with no observations, or while its observed
    /// failure rate stays under 50%. Stale stats reset and report healthy.
    pub fn is_healthy(&self, provider: &str) -> bool {
        let Some(mut stats) = self.entries.get_mut(provider) else {
            return true;
        };
        if Utc::now() - stats.last_check > Duration::minutes(HEALTH_WINDOW_MINUTES) {
            stats.success = 0;
            stats.failure = 0;
            stats.last_check = Utc::now();
            return true;
        }
        let total = stats.success + stats.failure;
        if total == 0 {
            return true;
        }
        (stats.failure as f64 / total as f64) < FAILURE_THRESHOLD
    }

    pub fn snapshot(&self) -> Vec<ProviderHealthEntry> {
        self.entries
            .iter()
            .map(|e| {
                let total = e.success + e.failure;
                let failure_rate = if total == 0 {
                    0.0
                } else {
                    e.failure as f64 / total as f64
                };
                ProviderHealthEntry {
                    name: e.key().clone(),
                    success_count: e.success,
                    failure_count: e.failure,
                    failure_rate,
                    healthy: failure_rate < FAILURE_THRESHOLD,
                }
            })
            .collect()
    }

    pub fn reset(&self, provider: Option<&str>) {
        match provider {
            Some(p) => {
                self.entries.remove(p);
            }
            None => self.entries.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_healthy() {
        let tracker = HealthTracker::new();
        assert!(tracker.is_healthy("fresh"));
    }

    #[test]
    fn single_failure_marks_unhealthy() {
        let tracker = HealthTracker::new();
        tracker.record_failure("flaky");
        assert!(!tracker.is_healthy("flaky"));
    }

    #[test]
    fn majority_success_stays_healthy() {
        let tracker = HealthTracker::new();
        for _ in 0..3 {
            tracker.record_success("steady");
        }
        tracker.record_failure("steady");
        assert!(tracker.is_healthy("steady"));
    }

    #[test]
    fn half_failure_rate_is_unhealthy() {
        let tracker = HealthTracker::new();
        tracker.record_success("even");
        tracker.record_failure("even");
        assert!(!tracker.is_healthy("even"));
    }

    #[test]
    fn reset_clears_observations() {
        let tracker = HealthTracker::new();
        tracker.record_failure("flaky");
        tracker.reset(Some("flaky"));
        assert!(tracker.is_healthy("flaky"));
    }
}
