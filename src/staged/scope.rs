//! Savepoint scope owning the temporary relations of one execution
//!
//! `begin` opens a SAVEPOINT. Relations created inside are registered with
//! the scope and dropped when it closes, newest first. `commit` releases the
//! savepoint; `rollback` rolls back to it and releases it. A scope dropped
//! while still open rolls back.
//!
//! Failures while closing are logged as `AERO_CLEANUP_FAILED` and counted,
//! never returned: the caller's own result (or error) is what surfaces.

use crate::errors::AggregationError;
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::storage::{DocumentStore, StoreResult};

use super::naming::savepoint_name;

/// Lifecycle of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Committed,
    RolledBack,
}

/// An open SAVEPOINT and the relations created under it
pub struct SavepointScope<'a> {
    store: &'a dyn DocumentStore,
    metrics: &'a MetricsRegistry,
    name: String,
    relations: Vec<String>,
    state: ScopeState,
}

impl<'a> SavepointScope<'a> {
    /// Opens a savepoint
    pub fn begin(store: &'a dyn DocumentStore, metrics: &'a MetricsRegistry) -> StoreResult<Self> {
        let name = savepoint_name();
        store.execute_sql(&format!("SAVEPOINT {}", name), &[])?;
        log_event_with_fields(Event::ScopeBegin, &[("scope", &name)]);
        Ok(Self {
            store,
            metrics,
            name,
            relations: Vec::new(),
            state: ScopeState::Open,
        })
    }

    /// Savepoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Records a relation to drop when the scope closes
    pub fn register(&mut self, relation: String) {
        log_event_with_fields(Event::TempRelationCreated, &[("relation", &relation)]);
        self.metrics.increment_temp_created();
        self.relations.push(relation);
    }

    /// Relations currently owned by the scope
    pub fn relations(&self) -> &[String] {
        &self.relations
    }

    /// Drops the relations and releases the savepoint
    pub fn commit(mut self) {
        self.drop_relations();
        self.close(&[format!("RELEASE SAVEPOINT {}", self.name)]);
        self.state = ScopeState::Committed;
        log_event_with_fields(Event::ScopeCommit, &[("scope", &self.name)]);
    }

    /// Drops the relations and undoes everything since `begin`
    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        self.drop_relations();
        self.close(&[
            format!("ROLLBACK TO SAVEPOINT {}", self.name),
            format!("RELEASE SAVEPOINT {}", self.name),
        ]);
        self.state = ScopeState::RolledBack;
        log_event_with_fields(Event::ScopeRollback, &[("scope", &self.name)]);
    }

    fn drop_relations(&mut self) {
        while let Some(relation) = self.relations.pop() {
            match self
                .store
                .execute_sql(&format!("DROP TABLE IF EXISTS temp.{}", relation), &[])
            {
                Ok(_) => {
                    self.metrics.increment_temp_dropped();
                    log_event_with_fields(Event::TempRelationDropped, &[("relation", &relation)]);
                }
                Err(err) => self.cleanup_failed(&relation, err.to_string()),
            }
        }
    }

    fn close(&self, statements: &[String]) {
        for sql in statements {
            if let Err(err) = self.store.execute_sql(sql, &[]) {
                self.cleanup_failed(&self.name, err.to_string());
            }
        }
    }

    fn cleanup_failed(&self, target: &str, reason: String) {
        let err = AggregationError::cleanup_failed(reason);
        self.metrics.increment_cleanup_failures();
        log_event_with_fields(
            Event::CleanupFailed,
            &[("target", target), ("error", &err.to_string())],
        );
    }
}

impl Drop for SavepointScope<'_> {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            self.rollback_in_place();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStore, SqlValue};

    fn temp_tables(store: &SqliteStore) -> usize {
        store
            .query_rows("SELECT count(*) FROM sqlite_temp_master WHERE type = 'table'", &[])
            .unwrap()[0][0]
            .as_i64()
            .unwrap() as usize
    }

    #[test]
    fn test_commit_drops_relations() {
        let store = SqliteStore::open_in_memory().unwrap();
        let metrics = MetricsRegistry::new();
        let mut scope = SavepointScope::begin(&store, &metrics).unwrap();
        store.execute_sql("CREATE TEMP TABLE aero_stage_t_1 (x)", &[]).unwrap();
        scope.register("aero_stage_t_1".to_string());
        assert_eq!(temp_tables(&store), 1);

        scope.commit();
        assert_eq!(temp_tables(&store), 0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.temp_relations_created, 1);
        assert_eq!(snapshot.temp_relations_dropped, 1);
        assert_eq!(snapshot.cleanup_failures, 0);
    }

    #[test]
    fn test_drop_while_open_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_collection("c").unwrap();
        let metrics = MetricsRegistry::new();
        {
            let mut scope = SavepointScope::begin(&store, &metrics).unwrap();
            store
                .execute_sql("INSERT INTO \"c\" (data) VALUES (?)", &[SqlValue::from("{}")])
                .unwrap();
            store.execute_sql("CREATE TEMP TABLE aero_stage_t_2 (x)", &[]).unwrap();
            scope.register("aero_stage_t_2".to_string());
        }
        assert_eq!(temp_tables(&store), 0);
        let rows = store.query_rows("SELECT count(*) FROM \"c\"", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::Integer(0));
    }

    #[test]
    fn test_cleanup_failure_is_counted_not_raised() {
        let store = SqliteStore::open_in_memory().unwrap();
        let metrics = MetricsRegistry::new();
        let mut scope = SavepointScope::begin(&store, &metrics).unwrap();
        // Not a valid identifier, so the drop fails
        scope.register("aero_stage_bad name".to_string());
        scope.commit();
        assert_eq!(metrics.snapshot().cleanup_failures, 1);
    }
}
