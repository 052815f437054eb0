//! Aggregation entry point
//!
//! `aggregate` optimizes the pipeline, then tries the tiers in order:
//!
//! 1. SQL: one chained-CTE statement
//! 2. Staged: temporary relations, interpreting the stages SQL declines
//! 3. Interpreter: in memory, accepts everything
//!
//! A tier that declines hands over with a [`FallbackSignal`]; a fatal error
//! stops the execution. With heuristic tiering, the most complex expression
//! in the pipeline picks the first tier worth trying.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use uuid::Uuid;

use crate::compiler;
use crate::config::ExecutionOptions;
use crate::errors::{AggregationError, AggregationResult, FallbackSignal, TierError};
use crate::expression::{complexity, tier_for_score};
use crate::interpreter;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry, ObservationScope};
use crate::optimizer::{optimize, IndexHints};
use crate::pipeline::{Pipeline, PipelineContext, StageKind, TextMatches};
use crate::staged::StagedExecutor;
use crate::storage::{CollectionSource, DocumentStore, IndexCatalog, SearchIndex};
use crate::stream::DocumentStream;

/// Execution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Sql,
    Staged,
    Interpreter,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Sql => "sql",
            Tier::Staged => "staged",
            Tier::Interpreter => "interpreter",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// First tier the heuristic would try for `pipeline`
pub fn heuristic_tier(pipeline: &Pipeline) -> Tier {
    let score = pipeline
        .stages()
        .iter()
        .flat_map(|stage| stage.expressions())
        .map(complexity)
        .max()
        .unwrap_or(1);
    tier_for_score(score)
}

/// Runs pipelines against one set of collaborators
pub struct Aggregator<'a> {
    source: &'a dyn CollectionSource,
    store: Option<&'a dyn DocumentStore>,
    indexes: Option<&'a dyn IndexCatalog>,
    search: Option<&'a dyn SearchIndex>,
    metrics: MetricsRegistry,
}

impl<'a> Aggregator<'a> {
    /// Aggregator over a SQL store; all three tiers are available
    pub fn new<S: DocumentStore>(store: &'a S) -> Self {
        Self {
            source: store,
            store: Some(store),
            indexes: None,
            search: None,
            metrics: MetricsRegistry::new(),
        }
    }

    /// Aggregator over plain collections; only the interpreter runs
    pub fn in_memory(source: &'a dyn CollectionSource) -> Self {
        Self {
            source,
            store: None,
            indexes: None,
            search: None,
            metrics: MetricsRegistry::new(),
        }
    }

    /// Uses index metadata for the optimizer
    pub fn with_index_catalog(mut self, catalog: &'a dyn IndexCatalog) -> Self {
        self.indexes = Some(catalog);
        self
    }

    /// Answers `$text` through a search collaborator
    pub fn with_search_index(mut self, search: &'a dyn SearchIndex) -> Self {
        self.search = Some(search);
        self
    }

    /// Counters of this aggregator
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Parses and runs a JSON pipeline
    pub fn aggregate_json(
        &self,
        collection: &str,
        pipeline: &Value,
        options: &ExecutionOptions,
    ) -> AggregationResult<DocumentStream> {
        let pipeline = Pipeline::from_json(pipeline)?;
        self.aggregate(collection, &pipeline, options)
    }

    /// Runs `pipeline` over `collection`
    pub fn aggregate(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &ExecutionOptions,
    ) -> AggregationResult<DocumentStream> {
        let execution_id = Uuid::new_v4().to_string();
        let scope = ObservationScope::with_fields(
            "AGGREGATE",
            &[("execution_id", &execution_id), ("collection", collection)],
        );
        self.metrics.increment_aggregations();

        match self.run(collection, pipeline, options) {
            Ok(stream) => {
                self.metrics.record_tier(stream.tier());
                scope.complete_with_fields(&[
                    ("tier", stream.tier().as_str()),
                    ("documents", &stream.len().to_string()),
                ]);
                Ok(stream)
            }
            Err(err) => {
                self.metrics.increment_failures();
                scope.fail(&err.to_string());
                Err(err)
            }
        }
    }

    fn run(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        options: &ExecutionOptions,
    ) -> AggregationResult<DocumentStream> {
        options
            .validate()
            .map_err(|e| AggregationError::invalid_pipeline(e.to_string()))?;

        let pipeline = match (options.optimize, self.indexes) {
            (true, Some(catalog)) => {
                let optimized = optimize(pipeline, &IndexHints::from_catalog(catalog, collection));
                if optimized.reordered {
                    self.metrics.increment_reorders();
                }
                optimized.pipeline
            }
            _ => pipeline.clone(),
        };

        let text = self.text_matches(collection, &pipeline)?;
        let ctx = match self.store {
            Some(store) => PipelineContext::with_store(collection, self.source, store, options),
            None => PipelineContext::new(collection, self.source, options),
        }
        .with_text(text);

        let store = match self.store {
            Some(store) if !options.force_fallback => store,
            _ => return self.interpret(&pipeline, &ctx),
        };

        let first = if options.heuristic_tiering {
            heuristic_tier(&pipeline)
        } else {
            Tier::Sql
        };
        if first > Tier::Sql {
            log_event_with_fields(
                Event::TierSkipped,
                &[("collection", collection), ("first_tier", first.as_str())],
            );
        }

        for tier in [Tier::Sql, Tier::Staged] {
            if tier < first {
                continue;
            }
            let mut attempt = ctx.clone();
            let result = match tier {
                Tier::Sql => compiler::execute(&pipeline, &mut attempt),
                _ => StagedExecutor::new(store, &self.metrics).execute(&pipeline, &mut attempt),
            };
            match result {
                Ok(stream) => {
                    log_event_with_fields(Event::TierSelected, &[("tier", tier.as_str())]);
                    return Ok(stream);
                }
                Err(TierError::Fallback(signal)) => self.declined(tier, &signal),
                Err(TierError::Fatal(err)) => return Err(err),
            }
        }
        self.interpret(&pipeline, &ctx)
    }

    fn interpret(&self, pipeline: &Pipeline, ctx: &PipelineContext<'_>) -> AggregationResult<DocumentStream> {
        log_event_with_fields(Event::TierSelected, &[("tier", Tier::Interpreter.as_str())]);
        interpreter::execute(pipeline, &mut ctx.clone())
    }

    fn declined(&self, tier: Tier, signal: &FallbackSignal) {
        self.metrics.increment_fallbacks();
        log_event_with_fields(
            Event::TierDeclined,
            &[
                ("tier", tier.as_str()),
                ("code", signal.code().code()),
                ("reason", signal.reason()),
            ],
        );
    }

    /// `$text` match sets from the search collaborator, if there is one
    fn text_matches(&self, collection: &str, pipeline: &Pipeline) -> AggregationResult<TextMatches> {
        let search = match self.search {
            Some(search) => search,
            None => return Ok(TextMatches::unavailable()),
        };
        let mut sets = HashMap::new();
        for stage in pipeline.stages() {
            if let StageKind::Match(filter) = &stage.kind {
                for term in filter.text_terms() {
                    if !sets.contains_key(&term) {
                        let ids = search.text_match(collection, &term)?;
                        sets.insert(term, ids);
                    }
                }
            }
        }
        Ok(TextMatches::from_sets(sets))
    }
}
