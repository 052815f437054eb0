//! Storage collaborators
//!
//! The aggregation core never owns documents. It reads them through the
//! traits below and, for the SQL tiers, issues statements against the same
//! embedded engine:
//!
//! - [`CollectionSource`]: full collection reads (interpreter tier, `$lookup`)
//! - [`DocumentStore`]: raw SQL access plus engine [`Capabilities`]
//! - [`IndexCatalog`]: indexed field names for the cost estimator
//! - [`SearchIndex`]: full-text match sets for `$text`
//!
//! [`SqliteStore`] implements all of them on top of `rusqlite`.

mod errors;
mod sqlite;

pub use errors::{StoreError, StoreResult};
pub use sqlite::SqliteStore;

pub(crate) use errors::RAISED_CODE_PREFIX;

use std::collections::{HashMap, HashSet};

use crate::value::Document;

/// A value bound to (or read from) a SQL statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Returns the integer value, if any
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text value, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true for NULL
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

/// Optional engine features that change the SQL the compiler may emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Binary JSON (`jsonb`, `jsonb_*`) available
    pub jsonb: bool,
    /// Math functions (`sqrt`, `pow`, `ln`, trig)
    pub math_functions: bool,
    /// `aero_regexp(text, pattern, options)` registered
    pub regexp: bool,
    /// `aero_raise(code, message)` and `aero_finite(x)` registered
    pub raise_function: bool,
    /// `ORDER BY` inside aggregate calls
    pub ordered_aggregates: bool,
}

impl Capabilities {
    /// Every optional feature available
    pub fn full() -> Self {
        Self {
            jsonb: true,
            math_functions: true,
            regexp: true,
            raise_function: true,
            ordered_aggregates: true,
        }
    }
}

/// Reads whole collections
pub trait CollectionSource {
    /// All documents of a collection in identifier order; empty when the
    /// collection does not exist
    fn get_all(&self, collection: &str) -> StoreResult<Vec<Document>>;
}

/// SQL access to the embedded engine
pub trait DocumentStore: CollectionSource {
    /// Quoted table identifier for a collection, or `None` if it does not exist
    fn collection_table(&self, collection: &str) -> StoreResult<Option<String>>;

    /// Documents whose row satisfies `where_sql`, in identifier order.
    ///
    /// The condition may reference the `id` and `data` columns.
    fn get_by_filter_sql(
        &self,
        collection: &str,
        where_sql: &str,
        params: &[SqlValue],
    ) -> StoreResult<Vec<Document>>;

    /// Runs a row-returning statement
    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Vec<SqlValue>>>;

    /// Runs a statement that returns no rows; returns the change count
    fn execute_sql(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize>;

    /// Optional features of the engine
    fn capabilities(&self) -> Capabilities;
}

/// Index metadata
pub trait IndexCatalog {
    /// Dotted paths of the indexed fields of a collection (`_id` implied)
    fn indexed_fields(&self, collection: &str) -> HashSet<String>;
}

/// Full-text search collaborator
pub trait SearchIndex {
    /// Identifiers of the documents matching `term`
    fn text_match(&self, collection: &str, term: &str) -> StoreResult<HashSet<i64>>;
}

impl CollectionSource for HashMap<String, Vec<Document>> {
    fn get_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
        let mut docs = self.get(collection).cloned().unwrap_or_default();
        docs.sort_by_key(|d| d.id);
        Ok(docs)
    }
}

impl IndexCatalog for HashMap<String, HashSet<String>> {
    fn indexed_fields(&self, collection: &str) -> HashSet<String> {
        self.get(collection).cloned().unwrap_or_default()
    }
}
