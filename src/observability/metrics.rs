//! Aggregation metrics
//!
//! - Counters only
//! - Monotonic increase
//! - Relaxed atomics; values are exact once the execution has returned

use std::sync::atomic::{AtomicU64, Ordering};

use crate::aggregator::Tier;

/// Counters for one aggregator (or process, via [`MetricsRegistry::global`])
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Executions started
    aggregations: AtomicU64,
    /// Executions that returned a fatal error
    aggregations_failed: AtomicU64,
    /// Executions finished by the SQL tier
    sql_tier_runs: AtomicU64,
    /// Executions finished by the staged tier
    staged_tier_runs: AtomicU64,
    /// Executions finished by the interpreter tier
    interpreter_runs: AtomicU64,
    /// Tier declines
    fallbacks: AtomicU64,
    /// Pipelines replaced by the optimizer
    reorders: AtomicU64,
    /// Temp relations created
    temp_relations_created: AtomicU64,
    /// Temp relations dropped
    temp_relations_dropped: AtomicU64,
    /// Failed drops or releases
    cleanup_failures: AtomicU64,
    /// Rows written into temp relations from the interpreter
    rows_materialized: AtomicU64,
}

static GLOBAL: MetricsRegistry = MetricsRegistry::new_const();

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    const fn new_const() -> Self {
        Self {
            aggregations: AtomicU64::new(0),
            aggregations_failed: AtomicU64::new(0),
            sql_tier_runs: AtomicU64::new(0),
            staged_tier_runs: AtomicU64::new(0),
            interpreter_runs: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            reorders: AtomicU64::new(0),
            temp_relations_created: AtomicU64::new(0),
            temp_relations_dropped: AtomicU64::new(0),
            cleanup_failures: AtomicU64::new(0),
            rows_materialized: AtomicU64::new(0),
        }
    }

    /// Process-wide registry
    pub fn global() -> &'static MetricsRegistry {
        &GLOBAL
    }

    /// Increment executions started
    pub fn increment_aggregations(&self) {
        self.aggregations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment executions failed
    pub fn increment_failures(&self) {
        self.aggregations_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the tier that produced the result
    pub fn record_tier(&self, tier: Tier) {
        let counter = match tier {
            Tier::Sql => &self.sql_tier_runs,
            Tier::Staged => &self.staged_tier_runs,
            Tier::Interpreter => &self.interpreter_runs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment tier declines
    pub fn increment_fallbacks(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment optimizer reorders
    pub fn increment_reorders(&self) {
        self.reorders.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment temp relations created
    pub fn increment_temp_created(&self) {
        self.temp_relations_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment temp relations dropped
    pub fn increment_temp_dropped(&self) {
        self.temp_relations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment cleanup failures
    pub fn increment_cleanup_failures(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add rows materialized from the interpreter
    pub fn add_rows_materialized(&self, rows: u64) {
        self.rows_materialized.fetch_add(rows, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics as JSON
    pub fn to_json(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"{{"aggregations":{},"aggregations_failed":{},"sql_tier_runs":{},"staged_tier_runs":{},"interpreter_runs":{},"fallbacks":{},"reorders":{},"temp_relations_created":{},"temp_relations_dropped":{},"cleanup_failures":{},"rows_materialized":{}}}"#,
            s.aggregations,
            s.aggregations_failed,
            s.sql_tier_runs,
            s.staged_tier_runs,
            s.interpreter_runs,
            s.fallbacks,
            s.reorders,
            s.temp_relations_created,
            s.temp_relations_dropped,
            s.cleanup_failures,
            s.rows_materialized,
        )
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            aggregations: self.aggregations.load(Ordering::Relaxed),
            aggregations_failed: self.aggregations_failed.load(Ordering::Relaxed),
            sql_tier_runs: self.sql_tier_runs.load(Ordering::Relaxed),
            staged_tier_runs: self.staged_tier_runs.load(Ordering::Relaxed),
            interpreter_runs: self.interpreter_runs.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            reorders: self.reorders.load(Ordering::Relaxed),
            temp_relations_created: self.temp_relations_created.load(Ordering::Relaxed),
            temp_relations_dropped: self.temp_relations_dropped.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            rows_materialized: self.rows_materialized.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub aggregations: u64,
    pub aggregations_failed: u64,
    pub sql_tier_runs: u64,
    pub staged_tier_runs: u64,
    pub interpreter_runs: u64,
    pub fallbacks: u64,
    pub reorders: u64,
    pub temp_relations_created: u64,
    pub temp_relations_dropped: u64,
    pub cleanup_failures: u64,
    pub rows_materialized: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let snapshot = MetricsRegistry::new().snapshot();
        assert_eq!(snapshot.aggregations, 0);
        assert_eq!(snapshot.fallbacks, 0);
        assert_eq!(snapshot.temp_relations_created, 0);
    }

    #[test]
    fn test_record_tier() {
        let registry = MetricsRegistry::new();
        registry.record_tier(Tier::Sql);
        registry.record_tier(Tier::Interpreter);
        registry.record_tier(Tier::Interpreter);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.sql_tier_runs, 1);
        assert_eq!(snapshot.staged_tier_runs, 0);
        assert_eq!(snapshot.interpreter_runs, 2);
    }

    #[test]
    fn test_increment_counters() {
        let registry = MetricsRegistry::new();
        registry.increment_aggregations();
        registry.increment_fallbacks();
        registry.increment_fallbacks();
        registry.increment_temp_created();
        registry.increment_temp_dropped();
        registry.add_rows_materialized(40);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.aggregations, 1);
        assert_eq!(snapshot.fallbacks, 2);
        assert_eq!(snapshot.temp_relations_created, 1);
        assert_eq!(snapshot.temp_relations_dropped, 1);
        assert_eq!(snapshot.rows_materialized, 40);
    }

    #[test]
    fn test_to_json_is_valid() {
        let registry = MetricsRegistry::new();
        registry.increment_reorders();
        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["reorders"], 1);
    }
}
