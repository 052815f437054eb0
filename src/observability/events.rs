//! Observable aggregation events
//!
//! Events are explicit and typed; each carries the severity it is logged at.

use std::fmt;

use super::logger::Severity;

/// Observable events during aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Options
    /// Execution options loaded from a file
    OptionsLoaded,

    // Optimizer
    /// Optimizer chose a reordered pipeline
    PipelineReordered,
    /// Optimizer kept the original pipeline
    PipelineKept,

    // Tier selection
    /// A tier was chosen to run the pipeline
    TierSelected,
    /// A tier declined and the next one takes over
    TierDeclined,
    /// Heuristic routed the pipeline past one or more tiers
    TierSkipped,
    /// Leading filter pushed into the storage read
    FilterPushedDown,

    // Staged executor
    /// Savepoint scope opened
    ScopeBegin,
    /// Savepoint scope released
    ScopeCommit,
    /// Savepoint scope rolled back
    ScopeRollback,
    /// Temporary relation materialized
    TempRelationCreated,
    /// Temporary relation dropped
    TempRelationDropped,
    /// A stage ran through the interpreter inside the staged tier
    StageInterpreted,
    /// Cleanup of a relation or scope failed
    CleanupFailed,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::OptionsLoaded => "OPTIONS_LOADED",

            Event::PipelineReordered => "PIPELINE_REORDERED",
            Event::PipelineKept => "PIPELINE_KEPT",

            Event::TierSelected => "TIER_SELECTED",
            Event::TierDeclined => "TIER_DECLINED",
            Event::TierSkipped => "TIER_SKIPPED",
            Event::FilterPushedDown => "FILTER_PUSHED_DOWN",

            Event::ScopeBegin => "SCOPE_BEGIN",
            Event::ScopeCommit => "SCOPE_COMMIT",
            Event::ScopeRollback => "SCOPE_ROLLBACK",
            Event::TempRelationCreated => "TEMP_RELATION_CREATED",
            Event::TempRelationDropped => "TEMP_RELATION_DROPPED",
            Event::StageInterpreted => "STAGE_INTERPRETED",
            Event::CleanupFailed => "AERO_CLEANUP_FAILED",
        }
    }

    /// Severity the event is logged at
    pub fn severity(&self) -> Severity {
        match self {
            Event::CleanupFailed => Severity::Warn,
            Event::ScopeRollback | Event::TierDeclined => Severity::Info,
            Event::OptionsLoaded | Event::PipelineReordered | Event::TierSelected => {
                Severity::Info
            }
            _ => Severity::Trace,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
