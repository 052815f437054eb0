//! Query predicates (`$match`)
//!
//! A filter is parsed once into a [`FilterExpr`] tree, then either matched
//! directly against documents or translated to a SQL condition. Both paths
//! follow the same rules:
//!
//! - equality also matches when any element of an array field is equal;
//!   `{f: null}` matches null, missing, and arrays holding null
//! - range operators only compare values of the bound's type class
//! - `$ne` and `$nin` are complements, so they match missing fields
//! - `$text` uses the search collaborator's id set when one is available

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::errors::{AggregationError, AggregationResult};
use crate::expression::{
    each_sort_key, evaluate_truthy, parse_expression, sort_key_param, ExprTranslator, Expression,
    Scope, SqlExpr, SqlFragment, SqlKind,
};
use crate::storage::SqlValue;
use crate::value::{compare_values, compile_pattern, numeric, type_name, type_rank, values_equal, FieldPath, Numeric};

/// Type names accepted by `$type`
const TYPE_NAMES: &[&str] = &[
    "double", "string", "object", "array", "bool", "null", "int", "long", "number",
];

/// Range comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl RangeOp {
    fn symbol(self) -> &'static str {
        match self {
            RangeOp::Gt => ">",
            RangeOp::Gte => ">=",
            RangeOp::Lt => "<",
            RangeOp::Lte => "<=",
        }
    }

    fn accepts(self, ord: std::cmp::Ordering) -> bool {
        match self {
            RangeOp::Gt => ord.is_gt(),
            RangeOp::Gte => ord.is_ge(),
            RangeOp::Lt => ord.is_lt(),
            RangeOp::Lte => ord.is_le(),
        }
    }
}

/// A predicate on one field
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Range(RangeOp, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex { pattern: String, options: String },
    Size(usize),
    All(Vec<Value>),
    Mod { divisor: i64, remainder: i64 },
    Type(Vec<String>),
    Not(Vec<Predicate>),
}

/// A parsed `$match` filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Nor(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    /// All predicates must hold for the field
    Field(FieldPath, Vec<Predicate>),
    /// `$expr`
    Expr(Expression),
    /// `$text: {$search: term}`
    Text(String),
}

/// Document id sets reported by the search collaborator, per search term
#[derive(Debug, Clone, Default)]
pub struct TextMatches {
    available: bool,
    terms: HashMap<String, HashSet<i64>>,
}

impl TextMatches {
    /// No search collaborator: `$text` falls back to word matching
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Match sets from a search collaborator
    pub fn from_sets(terms: HashMap<String, HashSet<i64>>) -> Self {
        Self {
            available: true,
            terms,
        }
    }

    /// True when a search collaborator answered
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Ids matching `term`; `None` without a collaborator
    pub fn ids(&self, term: &str) -> Option<&HashSet<i64>> {
        if !self.available {
            return None;
        }
        self.terms.get(term)
    }
}

fn invalid(reason: impl Into<String>) -> AggregationError {
    AggregationError::invalid_pipeline(reason)
}

impl FilterExpr {
    /// Parses a filter document
    pub fn parse(filter: &Value) -> AggregationResult<Self> {
        let map = filter
            .as_object()
            .ok_or_else(|| invalid("$match filter must be an object"))?;
        Self::parse_object(map)
    }

    fn parse_object(map: &Map<String, Value>) -> AggregationResult<Self> {
        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            clauses.push(match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let items = value
                        .as_array()
                        .filter(|items| !items.is_empty())
                        .ok_or_else(|| invalid(format!("{} requires a non-empty array", key)))?;
                    let parsed = items
                        .iter()
                        .map(FilterExpr::parse)
                        .collect::<AggregationResult<Vec<_>>>()?;
                    match key.as_str() {
                        "$and" => FilterExpr::And(parsed),
                        "$or" => FilterExpr::Or(parsed),
                        _ => FilterExpr::Nor(parsed),
                    }
                }
                "$not" => FilterExpr::Not(Box::new(FilterExpr::parse(value)?)),
                "$expr" => FilterExpr::Expr(parse_expression(value)?),
                "$text" => match value.get("$search") {
                    Some(Value::String(term)) => FilterExpr::Text(term.clone()),
                    _ => return Err(invalid("$text requires a $search string")),
                },
                other if other.starts_with('$') => {
                    return Err(invalid(format!("unknown top-level operator '{}'", other)))
                }
                field => {
                    let path = FieldPath::parse(field)?;
                    FilterExpr::Field(path, parse_predicates(value)?)
                }
            });
        }

        Ok(if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            FilterExpr::And(clauses)
        })
    }

    /// True for the empty filter `{}`
    pub fn is_trivial(&self) -> bool {
        matches!(self, FilterExpr::And(items) if items.is_empty())
    }

    /// True when the filter contains `$text`
    pub fn has_text(&self) -> bool {
        let mut found = false;
        self.visit(&mut |f| found |= matches!(f, FilterExpr::Text(_)));
        found
    }

    /// Search terms used by `$text` clauses
    pub fn text_terms(&self) -> Vec<String> {
        let mut terms = Vec::new();
        self.visit(&mut |f| {
            if let FilterExpr::Text(term) = f {
                terms.push(term.clone());
            }
        });
        terms
    }

    /// Field paths the filter reads; `None` when it may read the whole document
    pub fn referenced_paths(&self) -> Option<Vec<FieldPath>> {
        let mut paths = Vec::new();
        let mut whole = false;
        self.visit(&mut |f| match f {
            FilterExpr::Field(path, _) => paths.push(path.clone()),
            FilterExpr::Expr(expr) => {
                if expr.reads_whole_document() {
                    whole = true;
                }
                for root in expr.referenced_fields() {
                    if let Ok(path) = FieldPath::parse(&root) {
                        paths.push(path);
                    }
                }
            }
            FilterExpr::Text(_) => whole = true,
            _ => {}
        });
        if whole {
            None
        } else {
            Some(paths)
        }
    }

    fn visit(&self, visit: &mut dyn FnMut(&FilterExpr)) {
        visit(self);
        match self {
            FilterExpr::And(items) | FilterExpr::Or(items) | FilterExpr::Nor(items) => {
                for item in items {
                    item.visit(visit);
                }
            }
            FilterExpr::Not(inner) => inner.visit(visit),
            FilterExpr::Field(..) | FilterExpr::Expr(_) | FilterExpr::Text(_) => {}
        }
    }

    // ---- interpreter ----

    /// Tests a document; `root` and `id` serve `$expr` and `$text`
    pub fn matches(
        &self,
        doc: &Value,
        root: &Value,
        id: i64,
        text: &TextMatches,
    ) -> AggregationResult<bool> {
        Ok(match self {
            FilterExpr::And(items) => {
                for item in items {
                    if !item.matches(doc, root, id, text)? {
                        return Ok(false);
                    }
                }
                true
            }
            FilterExpr::Or(items) => {
                for item in items {
                    if item.matches(doc, root, id, text)? {
                        return Ok(true);
                    }
                }
                false
            }
            FilterExpr::Nor(items) => {
                for item in items {
                    if item.matches(doc, root, id, text)? {
                        return Ok(false);
                    }
                }
                true
            }
            FilterExpr::Not(inner) => !inner.matches(doc, root, id, text)?,
            FilterExpr::Field(path, predicates) => {
                let value = path.resolve(doc);
                predicates.iter().all(|p| predicate_matches(p, value))
            }
            FilterExpr::Expr(expr) => evaluate_truthy(expr, &Scope::new(root, doc))?,
            FilterExpr::Text(term) => match text.ids(term) {
                Some(ids) => ids.contains(&id),
                None if text.is_available() => false,
                None => text_contains(doc, term),
            },
        })
    }

    // ---- SQL ----

    /// Translates the filter to a 0/1 condition over the translator's
    /// document column and `id_column`
    pub fn to_sql(
        &self,
        translator: &ExprTranslator<'_>,
        id_column: &str,
        text: &TextMatches,
    ) -> AggregationResult<SqlFragment> {
        Ok(match self {
            FilterExpr::And(items) | FilterExpr::Or(items) | FilterExpr::Nor(items) => {
                if items.is_empty() {
                    return Ok(SqlFragment::raw("1"));
                }
                let parts = items
                    .iter()
                    .map(|item| item.to_sql(translator, id_column, text))
                    .collect::<AggregationResult<Vec<_>>>()?;
                match self {
                    FilterExpr::And(_) => SqlFragment::join(&parts, " AND ").wrap("(", ")"),
                    FilterExpr::Or(_) => SqlFragment::join(&parts, " OR ").wrap("(", ")"),
                    _ => SqlFragment::join(&parts, " OR ").wrap("(NOT (", "))"),
                }
            }
            FilterExpr::Not(inner) => inner.to_sql(translator, id_column, text)?.wrap("(NOT ", ")"),
            FilterExpr::Field(path, predicates) => {
                let json_path = path.json_path().ok_or_else(|| {
                    AggregationError::unsupported_expression(format!("field path '{}'", path))
                })?;
                let mut x = SqlFragment::raw(translator.data_column());
                x.push(" -> ").bind(json_path);
                let x = x.wrap("(", ")");
                let caps = translator.capabilities();
                let parts = predicates
                    .iter()
                    .map(|p| predicate_sql(p, &x, caps.regexp))
                    .collect::<AggregationResult<Vec<_>>>()?;
                SqlFragment::join(&parts, " AND ").wrap("(", ")")
            }
            FilterExpr::Expr(expr) => translator.condition(expr)?,
            FilterExpr::Text(term) => match text.ids(term) {
                Some(ids) => {
                    let mut sorted: Vec<i64> = ids.iter().copied().collect();
                    sorted.sort_unstable();
                    let mut f = SqlFragment::raw("(");
                    f.push(id_column)
                        .push(" IN (SELECT value FROM json_each(")
                        .bind(Value::from(sorted).to_string())
                        .push(")))");
                    f
                }
                None if text.is_available() => SqlFragment::raw("0"),
                None => {
                    return Err(AggregationError::unsupported_expression(
                        "$text without a search collaborator",
                    ))
                }
            },
        })
    }
}

fn parse_predicates(value: &Value) -> AggregationResult<Vec<Predicate>> {
    let map = match value {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        Value::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            return Err(invalid("cannot mix operators and fields in a field predicate"))
        }
        other => return Ok(vec![Predicate::Eq(other.clone())]),
    };

    let mut predicates = Vec::with_capacity(map.len());
    for (op, arg) in map {
        let predicate = match op.as_str() {
            "$eq" => Predicate::Eq(arg.clone()),
            "$ne" => Predicate::Ne(arg.clone()),
            "$gt" => Predicate::Range(RangeOp::Gt, arg.clone()),
            "$gte" => Predicate::Range(RangeOp::Gte, arg.clone()),
            "$lt" => Predicate::Range(RangeOp::Lt, arg.clone()),
            "$lte" => Predicate::Range(RangeOp::Lte, arg.clone()),
            "$in" => Predicate::In(array_arg(op, arg)?),
            "$nin" => Predicate::Nin(array_arg(op, arg)?),
            "$all" => Predicate::All(array_arg(op, arg)?),
            "$exists" => Predicate::Exists(crate::value::is_truthy(arg)),
            "$regex" => {
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| invalid("$regex requires a string"))?
                    .to_string();
                let options = match map.get("$options") {
                    None => String::new(),
                    Some(Value::String(o)) => o.clone(),
                    Some(_) => return Err(invalid("$options must be a string")),
                };
                compile_pattern(&pattern, &options).map_err(|e| invalid(format!("$regex: {}", e)))?;
                Predicate::Regex { pattern, options }
            }
            "$options" if map.contains_key("$regex") => continue,
            "$options" => return Err(invalid("$options requires $regex")),
            "$size" => match arg.as_u64() {
                Some(n) => Predicate::Size(n as usize),
                None => return Err(invalid("$size requires a non-negative integer")),
            },
            "$mod" => match arg.as_array().map(|a| a.as_slice()) {
                Some([d, r]) => match (d.as_i64(), r.as_i64()) {
                    (Some(0), _) => return Err(invalid("$mod divisor cannot be 0")),
                    (Some(divisor), Some(remainder)) => Predicate::Mod { divisor, remainder },
                    _ => return Err(invalid("$mod requires integer [divisor, remainder]")),
                },
                _ => return Err(invalid("$mod requires [divisor, remainder]")),
            },
            "$type" => {
                let names: Vec<String> = match arg {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .map(|i| i.as_str().map(str::to_string))
                        .collect::<Option<_>>()
                        .ok_or_else(|| invalid("$type requires type names"))?,
                    _ => return Err(invalid("$type requires type names")),
                };
                if let Some(bad) = names.iter().find(|n| !TYPE_NAMES.contains(&n.as_str())) {
                    return Err(invalid(format!("unknown $type '{}'", bad)));
                }
                Predicate::Type(names)
            }
            "$not" => match arg {
                Value::Object(inner) if !inner.is_empty() && inner.keys().all(|k| k.starts_with('$')) => {
                    Predicate::Not(parse_predicates(arg)?)
                }
                _ => return Err(invalid("$not requires an operator object")),
            },
            other => return Err(invalid(format!("unknown query operator '{}'", other))),
        };
        predicates.push(predicate);
    }
    Ok(predicates)
}

fn array_arg(op: &str, arg: &Value) -> AggregationResult<Vec<Value>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| invalid(format!("{} requires an array", op)))
}

// ---- interpreter predicates ----

/// The field value plus, for arrays, each element
fn candidates(value: &Value) -> Vec<&Value> {
    let mut out = vec![value];
    if let Value::Array(items) = value {
        out.extend(items.iter());
    }
    out
}

fn equals(value: Option<&Value>, target: &Value) -> bool {
    match value {
        None => target.is_null(),
        Some(v) => candidates(v).into_iter().any(|c| values_equal(c, target)),
    }
}

fn predicate_matches(predicate: &Predicate, value: Option<&Value>) -> bool {
    match predicate {
        Predicate::Eq(target) => equals(value, target),
        Predicate::Ne(target) => !equals(value, target),
        Predicate::Range(op, bound) => {
            let null = Value::Null;
            candidates(value.unwrap_or(&null)).into_iter().any(|c| {
                type_rank(c) == type_rank(bound) && op.accepts(compare_values(c, bound))
            })
        }
        Predicate::In(targets) => targets.iter().any(|t| equals(value, t)),
        Predicate::Nin(targets) => !targets.iter().any(|t| equals(value, t)),
        Predicate::All(targets) => !targets.is_empty() && targets.iter().all(|t| equals(value, t)),
        Predicate::Exists(expected) => value.is_some() == *expected,
        Predicate::Regex { pattern, options } => match (value, compile_pattern(pattern, options)) {
            (Some(v), Ok(re)) => candidates(v)
                .into_iter()
                .any(|c| c.as_str().map(|s| re.is_match(s)).unwrap_or(false)),
            _ => false,
        },
        Predicate::Size(n) => matches!(value, Some(Value::Array(items)) if items.len() == *n),
        Predicate::Mod { divisor, remainder } => value
            .map(|v| {
                candidates(v).into_iter().any(|c| {
                    let truncated = match numeric(c) {
                        Some(Numeric::Int(i)) => i,
                        Some(Numeric::Float(f)) => f.trunc() as i64,
                        None => return false,
                    };
                    truncated.checked_rem(*divisor).unwrap_or(0) == *remainder
                })
            })
            .unwrap_or(false),
        Predicate::Type(names) => value
            .map(|v| {
                candidates(v).into_iter().any(|c| {
                    let name = type_name(c);
                    names
                        .iter()
                        .any(|n| n == name || (n == "number" && c.is_number()))
                })
            })
            .unwrap_or(false),
        Predicate::Not(inner) => !inner.iter().all(|p| predicate_matches(p, value)),
    }
}

/// Every whitespace-separated term occurs as a word in some string of the document
fn text_contains(doc: &Value, term: &str) -> bool {
    let mut words = HashSet::new();
    collect_words(doc, &mut words);
    let terms: Vec<String> = term.split_whitespace().map(str::to_lowercase).collect();
    !terms.is_empty() && terms.iter().all(|t| words.contains(t))
}

fn collect_words(value: &Value, words: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for word in s.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                words.insert(word.to_lowercase());
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_words(i, words)),
        Value::Object(map) => map.values().for_each(|v| collect_words(v, words)),
        _ => {}
    }
}

// ---- SQL predicates ----

fn unsupported(reason: &str) -> AggregationError {
    AggregationError::unsupported_expression(reason)
}

/// `COALESCE(x_clause OR element_clause, 0)` over the value and its elements
fn any_candidate(x: &SqlFragment, own: SqlFragment, element: &str, params: &[SqlValue]) -> SqlFragment {
    let mut f = SqlFragment::raw("COALESCE(");
    f.append(&own)
        .push(" OR (json_type(")
        .append(x)
        .push(") = 'array' AND EXISTS (SELECT 1 FROM json_each(")
        .append(x)
        .push(") AS e WHERE ");
    let mut parts = element.split('?');
    if let Some(first) = parts.next() {
        f.push(first);
    }
    for (part, param) in parts.zip(params) {
        f.bind(param.clone()).push(part);
    }
    f.push(")), 0)");
    f
}

fn equals_sql(x: &SqlFragment, target: &Value) -> SqlFragment {
    match sort_key_param(target) {
        None => {
            let mut own = SqlFragment::raw("(");
            own.append(x)
                .push(" IS NULL OR json_type(")
                .append(x)
                .push(") = 'null')");
            any_candidate(x, own, "e.type = 'null'", &[])
        }
        Some(key) => {
            let mut own = SqlExpr {
                fragment: x.clone(),
                kind: SqlKind::Json,
            }
            .sort_key()
            .wrap("(", " = ");
            own.bind(key.clone()).push(")");
            any_candidate(x, own, &format!("{} = ?", each_sort_key("e")), &[key])
        }
    }
}

fn type_filter(types: &[&str]) -> String {
    let quoted: Vec<String> = types.iter().map(|t| format!("'{}'", t)).collect();
    quoted.join(", ")
}

fn predicate_sql(predicate: &Predicate, x: &SqlFragment, regexp: bool) -> AggregationResult<SqlFragment> {
    Ok(match predicate {
        Predicate::Eq(target) => equals_sql(x, target),
        Predicate::Ne(target) => equals_sql(x, target).wrap("(NOT ", ")"),
        Predicate::In(targets) | Predicate::Nin(targets) => {
            let parts: Vec<SqlFragment> = targets.iter().map(|t| equals_sql(x, t)).collect();
            let any = if parts.is_empty() {
                SqlFragment::raw("0")
            } else {
                SqlFragment::join(&parts, " OR ").wrap("(", ")")
            };
            if matches!(predicate, Predicate::Nin(_)) {
                any.wrap("(NOT ", ")")
            } else {
                any
            }
        }
        Predicate::All(targets) => {
            if targets.is_empty() {
                return Ok(SqlFragment::raw("0"));
            }
            let parts: Vec<SqlFragment> = targets.iter().map(|t| equals_sql(x, t)).collect();
            SqlFragment::join(&parts, " AND ").wrap("(", ")")
        }
        Predicate::Range(op, bound) => {
            let types: &[&str] = match bound {
                Value::Null => {
                    return Ok(match op {
                        RangeOp::Gte | RangeOp::Lte => equals_sql(x, bound),
                        RangeOp::Gt | RangeOp::Lt => SqlFragment::raw("0"),
                    })
                }
                Value::Number(_) => &["integer", "real"],
                Value::String(_) => &["text"],
                Value::Bool(_) => &["true", "false"],
                Value::Object(_) | Value::Array(_) => {
                    return Err(unsupported("range over a document or array bound"))
                }
            };
            let key = sort_key_param(bound).unwrap_or(SqlValue::Null);
            let filter = type_filter(types);
            let mut own = SqlFragment::raw("(json_type(");
            own.append(x).push(&format!(") IN ({}) AND ", filter));
            own.append(
                &SqlExpr {
                    fragment: x.clone(),
                    kind: SqlKind::Json,
                }
                .sort_key(),
            )
            .push(&format!(" {} ", op.symbol()))
            .bind(key.clone())
            .push(")");
            let element = format!(
                "e.type IN ({}) AND {} {} ?",
                filter,
                each_sort_key("e"),
                op.symbol()
            );
            any_candidate(x, own, &element, &[key])
        }
        Predicate::Exists(true) => x.wrap("(", " IS NOT NULL)"),
        Predicate::Exists(false) => x.wrap("(", " IS NULL)"),
        Predicate::Regex { pattern, options } => {
            if !regexp {
                return Err(unsupported("engine has no regex function"));
            }
            let mut own = SqlFragment::raw("(json_type(");
            own.append(x)
                .push(") = 'text' AND aero_regexp(")
                .append(x)
                .push(" ->> '$', ")
                .bind(pattern.as_str())
                .push(", ")
                .bind(options.as_str())
                .push("))");
            any_candidate(
                x,
                own,
                "e.type = 'text' AND aero_regexp(e.value, ?, ?)",
                &[SqlValue::from(pattern.as_str()), SqlValue::from(options.as_str())],
            )
        }
        Predicate::Size(n) => {
            let mut f = SqlFragment::raw("COALESCE(json_type(");
            f.append(x)
                .push(") = 'array' AND json_array_length(")
                .append(x)
                .push(") = ")
                .bind(*n as i64)
                .push(", 0)");
            f
        }
        Predicate::Mod { divisor, remainder } => {
            let mut own = SqlFragment::raw("(json_type(");
            own.append(x)
                .push(") IN ('integer', 'real') AND CAST(")
                .append(x)
                .push(" ->> '$' AS INTEGER) % ")
                .bind(*divisor)
                .push(" = ")
                .bind(*remainder)
                .push(")");
            any_candidate(
                x,
                own,
                "e.type IN ('integer', 'real') AND CAST(e.value AS INTEGER) % ? = ?",
                &[SqlValue::Integer(*divisor), SqlValue::Integer(*remainder)],
            )
        }
        Predicate::Type(names) => {
            let mut types = Vec::new();
            for name in names {
                match name.as_str() {
                    "double" => types.push("real"),
                    "string" => types.push("text"),
                    "object" => types.push("object"),
                    "array" => types.push("array"),
                    "bool" => types.extend(["true", "false"]),
                    "null" => types.push("null"),
                    "number" => types.extend(["integer", "real"]),
                    _ => return Err(unsupported("$type int/long needs a range check")),
                }
            }
            let filter = type_filter(&types);
            let mut own = SqlFragment::raw("(json_type(");
            own.append(x).push(&format!(") IN ({}))", filter));
            any_candidate(x, own, &format!("e.type IN ({})", filter), &[])
        }
        Predicate::Not(inner) => {
            let parts = inner
                .iter()
                .map(|p| predicate_sql(p, x, regexp))
                .collect::<AggregationResult<Vec<_>>>()?;
            SqlFragment::join(&parts, " AND ").wrap("(NOT (", "))")
        }
    })
}
