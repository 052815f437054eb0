//! Chained CTE assembly
//!
//! Every relation in a chain has the columns `seq, id, root_payload, data`:
//!
//! - `seq`: row order, carried between stages
//! - `id`: identifier of the stored document the row came from
//! - `root_payload`: `$$ROOT` as JSON text
//! - `data`: the current document as JSON text

use crate::expression::SqlFragment;
use crate::storage::SqlValue;

/// Column list shared by every relation
pub const RELATION_COLUMNS: &str = "seq, id, root_payload, data";

/// An ordered list of named CTEs
#[derive(Debug, Clone, Default)]
pub struct CteBuilder {
    ctes: Vec<(String, SqlFragment)>,
}

impl CteBuilder {
    /// An empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a CTE
    pub fn push(&mut self, name: impl Into<String>, select: SqlFragment) {
        self.ctes.push((name.into(), select));
    }

    /// Number of CTEs
    pub fn len(&self) -> usize {
        self.ctes.len()
    }

    /// True when nothing was pushed
    pub fn is_empty(&self) -> bool {
        self.ctes.is_empty()
    }

    /// CTE names in definition order
    pub fn names(&self) -> Vec<&str> {
        self.ctes.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// `WITH a AS MATERIALIZED (...), ...`; empty for an empty chain
    pub fn with_clause(&self) -> SqlFragment {
        let mut out = SqlFragment::new();
        for (i, (name, select)) in self.ctes.iter().enumerate() {
            out.push(if i == 0 { "WITH " } else { ", " });
            out.push(name).push(" AS MATERIALIZED (").append(select).push(")");
        }
        out
    }

    /// Final query: the documents of `from` in row order
    pub fn select_documents(&self, from: &str) -> SqlFragment {
        let mut out = self.with_clause();
        if !out.is_empty() {
            out.push(" ");
        }
        out.push("SELECT json(data) FROM ")
            .push(from)
            .push(" ORDER BY seq");
        out
    }

    /// `CREATE TEMP TABLE table AS` the rows of `from`; payloads stored as
    /// binary JSON when `jsonb` is set
    pub fn create_table_as(&self, table: &str, from: &str, jsonb: bool) -> SqlFragment {
        let mut out = SqlFragment::raw("CREATE TEMP TABLE ");
        out.push(table).push(" AS ").append(&self.with_clause());
        if !self.is_empty() {
            out.push(" ");
        }
        if jsonb {
            out.push("SELECT seq, id, jsonb(root_payload) AS root_payload, jsonb(data) AS data FROM ");
        } else {
            out.push("SELECT seq, id, json(root_payload) AS root_payload, json(data) AS data FROM ");
        }
        out.push(from);
        out
    }

    /// Parameters of every CTE, in textual order
    pub fn params(&self) -> Vec<SqlValue> {
        self.with_clause().params
    }
}
