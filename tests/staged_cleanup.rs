//! Staged Tier Cleanup Tests
//!
//! Temporary relations created by the staged tier never outlive the
//! execution:
//! - dropped after a successful run
//! - dropped after a fatal error
//! - counted in the metrics either way

use aeropipe::observability::MetricsRegistry;
use aeropipe::pipeline::{Pipeline, PipelineContext};
use aeropipe::staged::{SavepointScope, ScopeState, StagedExecutor};
use aeropipe::storage::{DocumentStore, SqliteStore};
use aeropipe::{Aggregator, ExecutionOptions, Tier, TierError};
use serde_json::{json, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn seed(store: &SqliteStore) {
    store
        .insert_many(
            "events",
            &[
                json!({"kind": "click", "path": "/a/b", "ms": [12, 30]}),
                json!({"kind": "view", "path": "/a", "ms": [7]}),
                json!({"kind": "click", "path": "/c", "ms": []}),
            ],
        )
        .unwrap();
}

fn staged_tables(store: &SqliteStore) -> i64 {
    store
        .query_rows(
            "SELECT count(*) FROM sqlite_temp_master WHERE type = 'table' AND name LIKE 'aero_stage_%'",
            &[],
        )
        .unwrap()[0][0]
        .as_i64()
        .unwrap()
}

fn split_pipeline() -> Value {
    json!([
        {"$match": {"kind": "click"}},
        {"$addFields": {"segments": {"$split": ["$path", "/"]}}},
        {"$unwind": "$segments"},
        {"$match": {"segments": {"$ne": ""}}},
        {"$project": {"_id": 0, "segments": 1}}
    ])
}

// =============================================================================
// Successful Runs
// =============================================================================

/// A declined expression routes the pipeline to the staged tier and leaves
/// no relation behind.
#[test]
fn test_staged_run_drops_every_relation() {
    let store = SqliteStore::open_in_memory().unwrap();
    seed(&store);

    let aggregator = Aggregator::new(&store);
    let options = ExecutionOptions::default().with_heuristic_tiering(false);
    let out = aggregator
        .aggregate_json("events", &split_pipeline(), &options)
        .unwrap();

    assert_eq!(out.tier(), Tier::Staged);
    assert_eq!(
        out.into_vec(),
        vec![json!({"segments": "a"}), json!({"segments": "b"}), json!({"segments": "c"})]
    );
    assert_eq!(staged_tables(&store), 0);

    let snapshot = aggregator.metrics().snapshot();
    assert_eq!(snapshot.fallbacks, 1);
    assert_eq!(snapshot.staged_tier_runs, 1);
    assert!(snapshot.temp_relations_created > 0);
    assert_eq!(snapshot.temp_relations_created, snapshot.temp_relations_dropped);
    assert_eq!(snapshot.cleanup_failures, 0);
}

/// Small batches give the same result as one large batch.
#[test]
fn test_batch_size_does_not_change_results() {
    let store = SqliteStore::open_in_memory().unwrap();
    seed(&store);
    let pipeline = Pipeline::from_json(&split_pipeline()).unwrap();

    let mut outputs = Vec::new();
    for batch_size in [1, 2, 500] {
        let metrics = MetricsRegistry::new();
        let options = ExecutionOptions::default().with_batch_size(batch_size);
        let mut ctx = PipelineContext::with_store("events", &store, &store, &options);
        let out = StagedExecutor::new(&store, &metrics)
            .execute(&pipeline, &mut ctx)
            .unwrap();
        outputs.push(out.into_vec());
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[1], outputs[2]);
    assert_eq!(staged_tables(&store), 0);
}

/// A file-backed database behaves like the in-memory one.
#[test]
fn test_file_backed_store() {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("pipeline.db")).unwrap();
    seed(&store);

    let options = ExecutionOptions::default().with_heuristic_tiering(false);
    let out = Aggregator::new(&store)
        .aggregate_json("events", &split_pipeline(), &options)
        .unwrap();
    assert_eq!(out.len(), 3);
    assert_eq!(staged_tables(&store), 0);

    // Collection untouched by the scope
    let remaining = store.query_rows("SELECT count(*) FROM events", &[]).unwrap();
    assert_eq!(remaining[0][0].as_i64(), Some(3));
}

// =============================================================================
// Failed Runs
// =============================================================================

/// A run-time type error is fatal and still drops the relations.
#[test]
fn test_fatal_error_drops_every_relation() {
    let store = SqliteStore::open_in_memory().unwrap();
    seed(&store);

    let aggregator = Aggregator::new(&store);
    let options = ExecutionOptions::default().with_heuristic_tiering(false);
    let err = aggregator
        .aggregate_json(
            "events",
            &json!([
                {"$sort": {"path": 1}},
                {"$addFields": {"bad": {"$map": {"input": "$ms", "as": "m", "in": {"$add": ["$$m", "$kind"]}}}}}
            ]),
            &options,
        )
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(staged_tables(&store), 0);
    assert_eq!(aggregator.metrics().snapshot().aggregations_failed, 1);
}

/// The staged executor reports the failure as fatal, never as a fallback.
#[test]
fn test_staged_failure_is_not_a_fallback() {
    let store = SqliteStore::open_in_memory().unwrap();
    seed(&store);
    let metrics = MetricsRegistry::new();
    let options = ExecutionOptions::default();
    let mut ctx = PipelineContext::with_store("events", &store, &store, &options);
    let pipeline = Pipeline::from_json(&json!([
        {"$addFields": {"bad": {"$map": {"input": "$ms", "as": "m", "in": {"$add": ["$$m", "$path"]}}}}}
    ]))
    .unwrap();

    let err = StagedExecutor::new(&store, &metrics)
        .execute(&pipeline, &mut ctx)
        .unwrap_err();
    assert!(matches!(err, TierError::Fatal(_)));
    assert_eq!(staged_tables(&store), 0);
}

// =============================================================================
// Scope Tests
// =============================================================================

/// Dropping an open scope rolls it back and drops registered relations.
#[test]
fn test_dropped_scope_rolls_back() {
    let store = SqliteStore::open_in_memory().unwrap();
    let metrics = MetricsRegistry::new();
    {
        let mut scope = SavepointScope::begin(&store, &metrics).unwrap();
        assert_eq!(scope.state(), ScopeState::Open);
        store
            .execute_sql("CREATE TEMP TABLE aero_stage_manual_1 (x)", &[])
            .unwrap();
        scope.register("aero_stage_manual_1".to_string());
        assert_eq!(staged_tables(&store), 1);
    }
    assert_eq!(staged_tables(&store), 0);
    assert_eq!(metrics.snapshot().temp_relations_dropped, 1);
}
