//! Observability for aggregation runs
//!
//! - Structured logging (JSON lines)
//! - Counters
//! - Begin/complete scopes around each execution
//!
//! Observability is read-only: nothing here changes which tier runs or what
//! it returns, and a failed write is ignored.
//!
//! # Usage
//!
//! ```ignore
//! use aeropipe::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::TierDeclined, &[("tier", "sql"), ("reason", "$map")]);
//! MetricsRegistry::global().increment_fallbacks();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity, LOG_LEVEL_ENV};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

/// Log a lifecycle event
pub fn log_event(event: Event) {
    Logger::log(event.severity(), event.as_str(), &[]);
}

/// Log a lifecycle event with fields
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event() {
        log_event(Event::ScopeBegin);
        log_event(Event::ScopeCommit);
    }

    #[test]
    fn test_log_event_with_fields() {
        log_event_with_fields(Event::CleanupFailed, &[("relation", "aero_stage_x_1")]);
    }
}
