//! SQLite-backed collaborator
//!
//! Each collection is a table `(id INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT)`
//! holding one JSON object per row. The connection registers the functions the
//! SQL tiers rely on:
//!
//! - `aero_raise(code, message)` fails the running statement; the failure is
//!   reported back as [`StoreError::Raised`]
//! - `aero_regexp(text, pattern, options)` matches with the same regex engine
//!   the interpreter uses
//! - `aero_finite(x)` maps infinite reals to NULL
//! - `aero_number_json(x)` renders a number as JSON text with the shortest
//!   representation that reads back to the same `f64`
//! - `aero_json_scalar(json)` reads a scalar JSON text into an SQL value,
//!   parsing numbers exactly as the interpreter does

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde_json::Value;

use super::{
    Capabilities, CollectionSource, DocumentStore, IndexCatalog, SqlValue, StoreError,
    StoreResult, RAISED_CODE_PREFIX,
};
use crate::value::{compile_pattern, float_value, Document, FieldPath};

/// SQLite version that introduced binary JSON
const JSONB_VERSION: i32 = 3_045_000;
/// SQLite version that introduced `ORDER BY` inside aggregates
const ORDERED_AGGREGATES_VERSION: i32 = 3_044_000;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

/// Document store over a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
    capabilities: Capabilities,
    indexes: Mutex<HashMap<String, HashSet<String>>>,
}

impl SqliteStore {
    /// Opens (or creates) a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::init(conn)
    }

    /// Opens a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        register_functions(&conn)?;
        let capabilities = detect_capabilities(&conn);

        Ok(Self {
            conn: Mutex::new(conn),
            capabilities,
            indexes: Mutex::new(HashMap::new()),
        })
    }

    /// Overrides detected capabilities (to emulate an older engine)
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Creates a collection table if it does not exist
    pub fn create_collection(&self, collection: &str) -> StoreResult<()> {
        let table = quote_collection(collection)?;
        self.lock()?.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT NOT NULL)",
                table
            ),
            [],
        )?;
        Ok(())
    }

    /// Inserts one document, creating the collection when needed
    pub fn insert(&self, collection: &str, body: &Value) -> StoreResult<i64> {
        Ok(self.insert_many(collection, std::slice::from_ref(body))?[0])
    }

    /// Inserts documents in one transaction; returns their identifiers
    pub fn insert_many(&self, collection: &str, bodies: &[Value]) -> StoreResult<Vec<i64>> {
        self.create_collection(collection)?;
        let table = quote_collection(collection)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(bodies.len());
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO {} (data) VALUES (?1)", table))?;
            for body in bodies {
                if !body.is_object() {
                    return Err(StoreError::NotAnObject(collection.to_string()));
                }
                stmt.execute([serde_json::to_string(body)?])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Creates an expression index on a field and records it in the catalog
    pub fn create_index(&self, collection: &str, field: &str) -> StoreResult<()> {
        self.create_collection(collection)?;
        let table = quote_collection(collection)?;
        let path = FieldPath::parse(field)
            .ok()
            .and_then(|p| p.json_path())
            .ok_or_else(|| StoreError::InvalidCollectionName(field.to_string()))?;

        let mut indexes = self.indexes.lock().map_err(|_| StoreError::LockPoisoned)?;
        let fields = indexes.entry(collection.to_string()).or_default();
        let index_name = format!("\"idx_{}_{}\"", collection, fields.len());

        // DDL cannot take bound parameters; the path is quote-escaped instead
        self.lock()?.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} (json_extract(data, '{}'))",
                index_name,
                table,
                path.replace('\'', "''")
            ),
            [],
        )?;
        fields.insert(field.to_string());
        Ok(())
    }
}

impl CollectionSource for SqliteStore {
    fn get_all(&self, collection: &str) -> StoreResult<Vec<Document>> {
        match self.collection_table(collection)? {
            Some(_) => self.get_by_filter_sql(collection, "1", &[]),
            None => Ok(Vec::new()),
        }
    }
}

impl DocumentStore for SqliteStore {
    fn collection_table(&self, collection: &str) -> StoreResult<Option<String>> {
        let table = quote_collection(collection)?;
        let exists = self.query_rows(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &[SqlValue::from(collection)],
        )?;
        Ok(if exists.is_empty() { None } else { Some(table) })
    }

    fn get_by_filter_sql(
        &self,
        collection: &str,
        where_sql: &str,
        params: &[SqlValue],
    ) -> StoreResult<Vec<Document>> {
        let table = quote_collection(collection)?;
        let rows = self.query_rows(
            &format!(
                "SELECT id, data FROM {} WHERE {} ORDER BY id",
                table, where_sql
            ),
            params,
        )?;

        rows.into_iter()
            .map(|row| {
                let id = row.first().and_then(SqlValue::as_i64).unwrap_or_default();
                let body = match row.get(1) {
                    Some(SqlValue::Text(text)) => serde_json::from_str(text)?,
                    _ => Value::Null,
                };
                Ok(Document::new(id, body))
            })
            .collect()
    }

    fn query_rows(&self, sql: &str, params: &[SqlValue]) -> StoreResult<Vec<Vec<SqlValue>>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute_sql(&self, sql: &str, params: &[SqlValue]) -> StoreResult<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(sql, params_from_iter(params.iter()))?)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl IndexCatalog for SqliteStore {
    fn indexed_fields(&self, collection: &str) -> HashSet<String> {
        self.indexes
            .lock()
            .map(|indexes| indexes.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

/// Validates a collection name and returns it quoted
fn quote_collection(collection: &str) -> StoreResult<String> {
    let mut chars = collection.chars();
    let valid_start = chars
        .next()
        .map(|c| c == '_' || c.is_ascii_alphabetic())
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c == '_' || c.is_ascii_alphanumeric());
    let lowered = collection.to_ascii_lowercase();
    let reserved = lowered.starts_with("sqlite_") || lowered.starts_with("aero_");

    if !valid_start || !valid_rest || reserved {
        return Err(StoreError::InvalidCollectionName(collection.to_string()));
    }
    Ok(format!("\"{}\"", collection))
}

fn register_functions(conn: &Connection) -> StoreResult<()> {
    // Not deterministic: the engine must not hoist or fold the call
    conn.create_scalar_function("aero_raise", 2, FunctionFlags::SQLITE_UTF8, |ctx| {
        let code: String = ctx.get(0)?;
        let message: String = ctx.get(1)?;
        let code = if code.starts_with(RAISED_CODE_PREFIX) {
            code
        } else {
            format!("{}{}", RAISED_CODE_PREFIX, code)
        };
        Err::<Option<i64>, _>(rusqlite::Error::UserFunctionError(
            format!("{}: {}", code, message).into(),
        ))
    })?;

    // Infinite results become NULL, like NaN already does
    conn.create_scalar_function(
        "aero_finite",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: rusqlite::types::Value = ctx.get(0)?;
            Ok(match value {
                rusqlite::types::Value::Real(f) if !f.is_finite() => rusqlite::types::Value::Null,
                other => other,
            })
        },
    )?;

    conn.create_scalar_function(
        "aero_number_json",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| number_json(ctx.get(0)?),
    )?;

    conn.create_scalar_function(
        "aero_json_scalar",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| json_scalar(ctx.get(0)?),
    )?;

    let mut cache = AssertUnwindSafe(HashMap::<(String, String), Regex>::new());
    conn.create_scalar_function(
        "aero_regexp",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let text: Option<String> = ctx.get(0)?;
            let pattern: String = ctx.get(1)?;
            let options: Option<String> = ctx.get(2)?;
            let text = match text {
                Some(text) => text,
                None => return Ok(None),
            };

            let key = (pattern, options.unwrap_or_default());
            if !cache.0.contains_key(&key) {
                let regex = compile_pattern(&key.0, &key.1)
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                cache.0.insert(key.clone(), regex);
            }
            Ok(cache.0.get(&key).map(|re| re.is_match(&text)))
        },
    )?;
    Ok(())
}

/// JSON text of an SQL number; NULL and non-finite reals give NULL
fn number_json(value: rusqlite::types::Value) -> rusqlite::Result<Option<String>> {
    use rusqlite::types::Value as Sql;
    Ok(match value {
        Sql::Null => None,
        Sql::Integer(i) => Some(i.to_string()),
        Sql::Real(f) => match float_value(f) {
            Value::Null => None,
            number => Some(number.to_string()),
        },
        Sql::Text(text) => Some(Value::String(text).to_string()),
        Sql::Blob(_) => {
            return Err(rusqlite::Error::UserFunctionError(
                "aero_number_json: binary argument".into(),
            ))
        }
    })
}

/// SQL value of a scalar JSON text: numbers, strings, booleans as 0/1,
/// NULL for null. Containers come back as their JSON text.
fn json_scalar(value: rusqlite::types::Value) -> rusqlite::Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    let text = match value {
        Sql::Text(text) => text,
        Sql::Blob(_) => {
            return Err(rusqlite::Error::UserFunctionError(
                "aero_json_scalar: binary argument".into(),
            ))
        }
        // Already an SQL scalar
        other => return Ok(other),
    };
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
    Ok(match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(b as i64),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Sql::Integer(i),
            (None, Some(f)) => Sql::Real(f),
            (None, None) => Sql::Null,
        },
        Value::String(s) => Sql::Text(s),
        Value::Array(_) | Value::Object(_) => Sql::Text(text),
    })
}

fn detect_capabilities(conn: &Connection) -> Capabilities {
    let version = rusqlite::version_number();
    let math_functions = conn
        .query_row("SELECT sqrt(4.0)", [], |row| row.get::<_, f64>(0))
        .is_ok();

    Capabilities {
        jsonb: version >= JSONB_VERSION,
        math_functions,
        regexp: true,
        raise_function: true,
        ordered_aggregates: version >= ORDERED_AGGREGATES_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get_all() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ids = store
            .insert_many("orders", &[json!({"a": 1}), json!({"a": 2})])
            .unwrap();
        assert_eq!(ids.len(), 2);

        let docs = store.get_all("orders").unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].body, json!({"a": 1}));
        assert!(docs[0].id < docs[1].id);
    }

    #[test]
    fn test_missing_collection_is_empty() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_all("nothing").unwrap().is_empty());
        assert_eq!(store.collection_table("nothing").unwrap(), None);
    }

    #[test]
    fn test_invalid_collection_names() {
        assert!(quote_collection("orders").is_ok());
        assert!(quote_collection("1abc").is_err());
        assert!(quote_collection("a\"; DROP TABLE x; --").is_err());
        assert!(quote_collection("sqlite_master").is_err());
        assert!(quote_collection("aero_stage_1").is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.insert("orders", &json!([1, 2]));
        assert!(matches!(result, Err(StoreError::NotAnObject(_))));
    }

    #[test]
    fn test_raise_function_maps_to_raised() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.query_rows(
            "SELECT aero_raise('AERO_EXPR_TYPE_MISMATCH', ?)",
            &[SqlValue::from("$add: non-numeric operand")],
        );
        match result {
            Err(StoreError::Raised { code, message }) => {
                assert_eq!(code, "AERO_EXPR_TYPE_MISMATCH");
                assert_eq!(message, "$add: non-numeric operand");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_finite_function() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query_rows("SELECT aero_finite(9e999), aero_finite(2.5), aero_finite(3)", &[])
            .unwrap();
        assert_eq!(
            rows[0],
            vec![SqlValue::Null, SqlValue::Real(2.5), SqlValue::Integer(3)]
        );
    }

    #[test]
    fn test_number_json_is_shortest_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query_rows(
                "SELECT aero_number_json(? + ?), aero_number_json(?), aero_number_json(7), \
                 aero_number_json(NULL), json_set('{}', '$.r', json(aero_number_json(? * ?)))",
                &[
                    SqlValue::Real(0.1),
                    SqlValue::Real(0.2),
                    SqlValue::Real(9.223372036854776e18),
                    SqlValue::Real(1.1),
                    SqlValue::Real(1.1),
                ],
            )
            .unwrap();
        assert_eq!(rows[0][0], SqlValue::from("0.30000000000000004"));
        assert_eq!(rows[0][1], SqlValue::from("9.223372036854776e18"));
        assert_eq!(rows[0][2], SqlValue::from("7"));
        assert_eq!(rows[0][3], SqlValue::Null);

        let embedded = match &rows[0][4] {
            SqlValue::Text(text) => serde_json::from_str::<Value>(text).unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(embedded, json!({"r": 1.2100000000000002}));
    }

    #[test]
    fn test_json_scalar_parses_like_serde() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query_rows(
                "SELECT aero_json_scalar('0.30000000000000004'), aero_json_scalar('1.0'), \
                 aero_json_scalar('3'), aero_json_scalar('\"x\"'), aero_json_scalar('null'), \
                 aero_json_scalar(NULL)",
                &[],
            )
            .unwrap();
        assert_eq!(
            rows[0],
            vec![
                SqlValue::Real(0.30000000000000004),
                SqlValue::Real(1.0),
                SqlValue::Integer(3),
                SqlValue::from("x"),
                SqlValue::Null,
                SqlValue::Null,
            ]
        );
    }

    #[test]
    fn test_regexp_function() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query_rows(
                "SELECT aero_regexp('Hello', '^hel', 'i'), aero_regexp('Hello', '^hel', ''), aero_regexp(NULL, 'x', '')",
                &[],
            )
            .unwrap();
        assert_eq!(
            rows[0],
            vec![SqlValue::Integer(1), SqlValue::Integer(0), SqlValue::Null]
        );
    }

    #[test]
    fn test_bound_parameters_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rows = store
            .query_rows(
                "SELECT ?, ?, ?, ?",
                &[
                    SqlValue::Integer(7),
                    SqlValue::Real(2.5),
                    SqlValue::from("x"),
                    SqlValue::Null,
                ],
            )
            .unwrap();
        assert_eq!(
            rows[0],
            vec![
                SqlValue::Integer(7),
                SqlValue::Real(2.5),
                SqlValue::from("x"),
                SqlValue::Null
            ]
        );
    }

    #[test]
    fn test_create_index_records_field() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_index("orders", "status").unwrap();
        assert!(store.indexed_fields("orders").contains("status"));
        assert!(store.indexed_fields("other").is_empty());
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("aero.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert("orders", &json!({"a": 1})).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_all("orders").unwrap().len(), 1);
    }

    #[test]
    fn test_capabilities_detected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let caps = store.capabilities();
        assert!(caps.raise_function);
        assert!(caps.regexp);
        assert!(caps.ordered_aggregates);
    }
}
