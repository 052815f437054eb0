//! Staged tier
//!
//! Runs a pipeline the SQL tier declined. Consecutive stages that compile
//! are chained into one CTE statement and materialized into a temporary
//! relation. A stage that does not compile reads the current relation into
//! memory, runs its interpreter handler (batch by batch when the stage
//! streams) and writes the rows into a new relation; SQL resumes after it.
//!
//! Everything happens inside one [`SavepointScope`], which drops every
//! relation on success and on failure.
//!
//! When the engine refuses a chained statement because of a size or depth
//! limit, the remaining stages run in memory from the last relation that
//! was materialized.

pub mod naming;
pub mod scope;

pub use naming::{relation_name, RELATION_PREFIX};
pub use scope::{SavepointScope, ScopeState};

use std::sync::Arc;

use serde_json::Value;

use crate::aggregator::Tier;
use crate::compiler::{parse_documents, source_select, CteBuilder, SOURCE_RELATION};
use crate::errors::{AggregationError, TierError, TierResult};
use crate::expression::SqlFragment;
use crate::interpreter;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::pipeline::{Pipeline, PipelineContext, Row};
use crate::stages::{handler_for, StageHandler};
use crate::storage::{DocumentStore, SqlValue, StoreError};
use crate::stream::DocumentStream;

/// Rows written per INSERT statement
const INSERT_CHUNK: usize = 100;

/// A relation the next stages read from, plus the CTE chain extending it
struct Chain {
    /// CTEs defining `base` (the source read, or a read of a temp table)
    base: CteBuilder,
    base_name: String,
    /// Index of the first stage not yet applied to `base`
    first_stage: usize,
    /// `base` plus the compiled stages since `first_stage`
    builder: CteBuilder,
    /// Last relation of `builder`
    current: String,
}

impl Chain {
    fn new(base: CteBuilder, base_name: String, first_stage: usize) -> Self {
        Self {
            builder: base.clone(),
            current: base_name.clone(),
            base,
            base_name,
            first_stage,
        }
    }

    /// True when stages were compiled on top of the base
    fn has_pending(&self, stage: usize) -> bool {
        stage > self.first_stage
    }
}

/// Executes pipelines through temporary relations
pub struct StagedExecutor<'a> {
    store: &'a dyn DocumentStore,
    metrics: &'a MetricsRegistry,
}

impl<'a> StagedExecutor<'a> {
    /// Creates an executor over a store
    pub fn new(store: &'a dyn DocumentStore, metrics: &'a MetricsRegistry) -> Self {
        Self { store, metrics }
    }

    /// Runs `pipeline` against `ctx.collection`
    pub fn execute(&self, pipeline: &Pipeline, ctx: &mut PipelineContext<'_>) -> TierResult<DocumentStream> {
        let mut scope = SavepointScope::begin(self.store, self.metrics)
            .map_err(|e| TierError::Fatal(AggregationError::from(e)))?;
        match self.run(pipeline, ctx, &mut scope) {
            Ok(documents) => {
                scope.commit();
                Ok(DocumentStream::new(documents, Tier::Staged))
            }
            Err(err) => {
                scope.rollback();
                Err(err)
            }
        }
    }

    fn run(
        &self,
        pipeline: &Pipeline,
        ctx: &mut PipelineContext<'_>,
        scope: &mut SavepointScope<'_>,
    ) -> TierResult<Vec<Value>> {
        let mut source = CteBuilder::new();
        source.push(SOURCE_RELATION, source_select(self.store, &ctx.collection)?);
        let mut chain = Chain::new(source, SOURCE_RELATION.to_string(), 0);

        let stages = pipeline.stages();
        let mut i = 0;
        while i < stages.len() {
            ctx.stage_index = i;
            let handler = handler_for(&stages[i]);

            // Compile on copies so a declined stage leaves no partial CTEs
            let mut builder = chain.builder.clone();
            let mut compiled = ctx.clone();
            match handler.materialize_sql(&chain.current, &mut builder, &mut compiled) {
                Ok(name) => {
                    handler.update_context(&mut compiled);
                    *ctx = compiled;
                    chain.builder = builder;
                    chain.current = name;
                    i += 1;
                    continue;
                }
                Err(err) if err.is_fallback() => {}
                Err(err) => return Err(TierError::Fatal(err)),
            }

            // Pending SQL stages are materialized before reading rows back
            if chain.has_pending(i) {
                let table = relation_name(pipeline, i);
                let create = chain
                    .builder
                    .create_table_as(&table, &chain.current, ctx.capabilities.jsonb);
                match self.store.execute_sql(&create.sql, &create.params) {
                    Ok(_) => {
                        scope.register(table.clone());
                        chain = read_chain(&table, i);
                    }
                    Err(err) if err.is_limit() => return self.interpret_rest(pipeline, &chain, ctx),
                    Err(err) => return Err(err.into()),
                }
            }

            ctx.stage_index = i;
            let table = relation_name(pipeline, i + 1);
            self.interpret_stage(handler.as_ref(), &chain, &table, ctx, scope)?;
            handler.update_context(ctx);
            chain = read_chain(&table, i + 1);
            i += 1;
        }

        let query = chain.builder.select_documents(&chain.current);
        match self.store.query_rows(&query.sql, &query.params) {
            Ok(rows) => parse_documents(rows.into_iter().map(|mut row| row.swap_remove(0))),
            Err(err) if err.is_limit() => self.interpret_rest(pipeline, &chain, ctx),
            Err(err) => Err(err.into()),
        }
    }

    /// Runs one stage in memory from `chain.current` into a new `table`
    fn interpret_stage(
        &self,
        handler: &dyn StageHandler,
        chain: &Chain,
        table: &str,
        ctx: &mut PipelineContext<'_>,
        scope: &mut SavepointScope<'_>,
    ) -> TierResult<()> {
        log_event_with_fields(
            Event::StageInterpreted,
            &[("stage", handler.name()), ("relation", table)],
        );
        self.store.execute_sql(
            &format!(
                "CREATE TEMP TABLE {} (seq INTEGER PRIMARY KEY, id INTEGER, root_payload, data)",
                table
            ),
            &[],
        )?;
        scope.register(table.to_string());

        let jsonb = ctx.capabilities.jsonb;
        let mut next_seq = 0i64;
        if handler.streams() {
            let batch = ctx.options.batch_size;
            let mut after = i64::MIN;
            loop {
                let rows = self.read_rows(&chain.builder, &chain.current, Some((after, batch)))?;
                let last = match rows.last() {
                    Some((seq, _)) => *seq,
                    None => break,
                };
                let input = rows.into_iter().map(|(_, row)| row).collect();
                let output = handler.interpret(input, ctx)?;
                next_seq = self.write_rows(table, output, next_seq, jsonb)?;
                after = last;
            }
        } else {
            let rows = self.read_rows(&chain.builder, &chain.current, None)?;
            let input = rows.into_iter().map(|(_, row)| row).collect();
            let output = handler.interpret(input, ctx)?;
            self.write_rows(table, output, next_seq, jsonb)?;
        }
        Ok(())
    }

    /// Runs the stages from `chain.first_stage` in memory over the chain base
    fn interpret_rest(
        &self,
        pipeline: &Pipeline,
        chain: &Chain,
        ctx: &mut PipelineContext<'_>,
    ) -> TierResult<Vec<Value>> {
        log_event_with_fields(
            Event::StageInterpreted,
            &[("from_stage", &chain.first_stage.to_string()), ("reason", "engine limit")],
        );
        let rows = self
            .read_rows(&chain.base, &chain.base_name, None)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        ctx.stage_index = chain.first_stage;
        let rows = interpreter::run_stages(&pipeline.stages()[chain.first_stage..], rows, ctx)?;
        Ok(rows.into_iter().map(|row| row.current).collect())
    }

    /// Reads `(seq, row)` pairs of `relation` in order, optionally the next
    /// `limit` rows after `seq`
    fn read_rows(
        &self,
        builder: &CteBuilder,
        relation: &str,
        page: Option<(i64, usize)>,
    ) -> TierResult<Vec<(i64, Row)>> {
        let mut query = builder.with_clause();
        if !query.is_empty() {
            query.push(" ");
        }
        query
            .push("SELECT seq, id, json(root_payload), json(data) FROM ")
            .push(relation);
        match page {
            Some((after, limit)) => {
                query
                    .push(" WHERE seq > ")
                    .bind(after)
                    .push(" ORDER BY seq LIMIT ")
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX));
            }
            None => {
                query.push(" ORDER BY seq");
            }
        }

        let rows = self.store.query_rows(&query.sql, &query.params)?;
        rows.into_iter()
            .map(|columns| {
                let mut columns = columns.into_iter();
                let seq = columns.next().and_then(|v| v.as_i64()).unwrap_or_default();
                let id = columns.next().and_then(|v| v.as_i64()).unwrap_or_default();
                let root = parse_column(columns.next())?;
                let current = parse_column(columns.next())?;
                Ok((
                    seq,
                    Row {
                        id,
                        root: Arc::new(root),
                        current,
                    },
                ))
            })
            .collect()
    }

    /// Appends rows to `table` numbered from `first_seq + 1`; returns the
    /// last number used
    fn write_rows(&self, table: &str, rows: Vec<Row>, first_seq: i64, jsonb: bool) -> TierResult<i64> {
        let encode = if jsonb { "jsonb(?)" } else { "json(?)" };
        let mut seq = first_seq;
        let count = rows.len() as u64;

        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut insert = SqlFragment::raw(format!(
                "INSERT INTO {} (seq, id, root_payload, data) VALUES ",
                table
            ));
            for (i, row) in chunk.iter().enumerate() {
                seq += 1;
                if i > 0 {
                    insert.push(", ");
                }
                insert
                    .push("(")
                    .bind(seq)
                    .push(", ")
                    .bind(row.id)
                    .push(&format!(", {}, {})", encode, encode));
                insert.params.push(SqlValue::from(row.root.to_string()));
                insert.params.push(SqlValue::from(row.current.to_string()));
            }
            self.store.execute_sql(&insert.sql, &insert.params)?;
        }

        self.metrics.add_rows_materialized(count);
        Ok(seq)
    }
}

/// A chain whose base reads back a temp table
fn read_chain(table: &str, first_stage: usize) -> Chain {
    let name = format!("{}_r", table);
    let mut base = CteBuilder::new();
    base.push(
        name.clone(),
        SqlFragment::raw(format!(
            "SELECT seq, id, json(root_payload) AS root_payload, json(data) AS data FROM {}",
            table
        )),
    );
    Chain::new(base, name, first_stage)
}

fn parse_column(value: Option<SqlValue>) -> TierResult<Value> {
    match value {
        Some(SqlValue::Text(text)) => serde_json::from_str(&text)
            .map_err(|e| TierError::Fatal(AggregationError::storage(StoreError::from(e)))),
        _ => Ok(Value::Null),
    }
}
