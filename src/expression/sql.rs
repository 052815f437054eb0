//! Expression to SQL translation (SQL and staged tiers)
//!
//! Every translated expression carries a [`SqlKind`] describing how its SQL
//! value encodes the expression value:
//!
//! | kind   | SQL value                          | null / missing |
//! |--------|------------------------------------|----------------|
//! | Number | INTEGER or REAL                    | NULL           |
//! | Text   | TEXT                               | NULL           |
//! | Bool   | 0 or 1                             | NULL           |
//! | Json   | JSON text (never the text `null`)  | NULL           |
//!
//! Field values are read with `->`, which keeps the JSON encoding, so
//! objects, arrays and booleans survive intact. Constants are always bound
//! as parameters, never spliced into the SQL text.
//!
//! Whatever the translator cannot reproduce exactly is declined with
//! `AERO_EXPR_UNSUPPORTED` and left to the interpreter. Type errors that
//! depend on row data are raised at run time through `aero_raise`, with the
//! same code and message the interpreter uses.

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::{AggregationError, AggregationErrorCode, AggregationResult};
use crate::storage::{Capabilities, SqlValue};
use crate::value::{compile_pattern, FieldPath};

use super::ast::{Expression, Variable};
use super::date::DateUnit;
use super::eval::DEFAULT_TRIM_CHARS;
use super::operators::Operator;

/// Translations longer than this are declined
pub const MAX_FRAGMENT_LEN: usize = 64 * 1024;

/// Shape a string must have before it reaches the engine's date functions
const DATE_GLOB: &str = "[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]*";
/// Output format of date arithmetic, matching the interpreter
const DATE_SQL_FORMAT: &str = "%Y-%m-%dT%H:%M:%fZ";
/// A JSON path that never matches inside an object
pub const NO_PATH: &str = "$[0]";

/// A SQL snippet and its positional parameters, in textual order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    /// An empty fragment
    pub fn new() -> Self {
        Self::default()
    }

    /// SQL text without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// A single bound parameter
    pub fn param(value: impl Into<SqlValue>) -> Self {
        Self {
            sql: "?".to_string(),
            params: vec![value.into()],
        }
    }

    /// Appends SQL text
    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Appends a `?` placeholder bound to `value`
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        self.sql.push('?');
        self.params.push(value.into());
        self
    }

    /// Appends another fragment
    pub fn append(&mut self, other: &SqlFragment) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params.iter().cloned());
        self
    }

    /// Joins fragments with a separator
    pub fn join(parts: &[SqlFragment], separator: &str) -> SqlFragment {
        let mut out = SqlFragment::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push(separator);
            }
            out.append(part);
        }
        out
    }

    /// Wraps the fragment: `prefix || self || suffix`
    pub fn wrap(&self, prefix: &str, suffix: &str) -> SqlFragment {
        let mut out = SqlFragment::raw(prefix);
        out.append(self).push(suffix);
        out
    }

    /// Length of the SQL text
    pub fn len(&self) -> usize {
        self.sql.len()
    }

    /// True for an empty fragment
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// How a translated expression encodes its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlKind {
    Number,
    Text,
    Bool,
    Json,
}

/// A translated expression
#[derive(Debug, Clone, PartialEq)]
pub struct SqlExpr {
    pub fragment: SqlFragment,
    pub kind: SqlKind,
}

impl SqlExpr {
    fn new(fragment: SqlFragment, kind: SqlKind) -> Self {
        Self { fragment, kind }
    }

    /// Value usable as a `json_set`/`json_object` argument
    pub fn embed(&self) -> SqlFragment {
        match self.kind {
            SqlKind::Number => self.fragment.wrap("json(aero_number_json(", "))"),
            SqlKind::Text => self.fragment.clone(),
            SqlKind::Bool => self.bool_json().wrap("json(", ")"),
            SqlKind::Json => self.fragment.wrap("json(", ")"),
        }
    }

    /// JSON text of the value, NULL for null
    pub fn as_json(&self) -> SqlFragment {
        match self.kind {
            SqlKind::Number => self.fragment.wrap("aero_number_json(", ")"),
            SqlKind::Text => self.fragment.wrap("NULLIF(json_quote(", "), 'null')"),
            SqlKind::Bool => self.bool_json(),
            SqlKind::Json => self.fragment.clone(),
        }
    }

    fn bool_json(&self) -> SqlFragment {
        self.fragment
            .wrap("CASE ", " WHEN 1 THEN 'true' WHEN 0 THEN 'false' END")
    }

    /// Key whose SQL ordering is the canonical value ordering; NULL for null
    pub fn sort_key(&self) -> SqlFragment {
        let x = &self.fragment;
        match self.kind {
            SqlKind::Number | SqlKind::Text => x.clone(),
            SqlKind::Bool => x.wrap(
                "CAST(char(5) || CASE ",
                " WHEN 0 THEN 'false' WHEN 1 THEN 'true' END AS BLOB)",
            ),
            SqlKind::Json => {
                let mut f = SqlFragment::raw("CASE WHEN json_type(");
                f.append(x)
                    .push(") IN ('object', 'array', 'true', 'false') THEN CAST(char(CASE json_type(")
                    .append(x)
                    .push(") WHEN 'object' THEN 3 WHEN 'array' THEN 4 ELSE 5 END) || ")
                    .append(x)
                    .push(" AS BLOB) ELSE aero_json_scalar(")
                    .append(x)
                    .push(") END");
                f
            }
        }
    }

    /// Truthiness as 0 or 1, never NULL
    pub fn truthy(&self) -> SqlFragment {
        let x = &self.fragment;
        match self.kind {
            SqlKind::Bool => x.wrap("COALESCE(", ", 0)"),
            SqlKind::Number => x.wrap("COALESCE(", " <> 0, 0)"),
            SqlKind::Text => x.wrap("(", " IS NOT NULL)"),
            SqlKind::Json => {
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(x)
                    .push(" IS NULL THEN 0 WHEN json_type(")
                    .append(x)
                    .push(") IN ('false', 'null') THEN 0 WHEN json_type(")
                    .append(x)
                    .push(") IN ('integer', 'real') THEN (")
                    .append(x)
                    .push(" ->> '$') <> 0 ELSE 1 END");
                f
            }
        }
    }
}

/// Translation of a field value that may be `$$REMOVE`
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSql {
    /// Embeddable value (NULL when removed)
    pub value: SqlFragment,
    /// Condition (0/1) under which the field is removed instead of set
    pub remove_when: Option<SqlFragment>,
}

impl FieldSql {
    /// True when the field is removed for every row
    pub fn always_removed(&self) -> bool {
        self.remove_when.as_ref().map(|c| c.sql == "1").unwrap_or(false)
    }
}

fn unsupported(reason: impl Into<String>) -> AggregationError {
    AggregationError::unsupported_expression(reason)
}

/// Translates expressions against a row whose current document is the SQL
/// expression `data` and whose pipeline input is `root`
#[derive(Debug, Clone, Copy)]
pub struct ExprTranslator<'a> {
    data: &'a str,
    root: &'a str,
    caps: Capabilities,
    known: Option<&'a HashMap<String, SqlKind>>,
}

impl<'a> ExprTranslator<'a> {
    /// Creates a translator
    pub fn new(data: &'a str, root: &'a str, caps: Capabilities) -> Self {
        Self {
            data,
            root,
            caps,
            known: None,
        }
    }

    /// Reads top-level fields of a known scalar kind with `->>`
    pub fn with_known_fields(mut self, known: &'a HashMap<String, SqlKind>) -> Self {
        self.known = Some(known);
        self
    }

    /// SQL expression of the current document
    pub fn data_column(&self) -> &'a str {
        self.data
    }

    /// Engine capabilities the translation targets
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Translates an expression
    pub fn translate(&self, expr: &Expression) -> AggregationResult<SqlExpr> {
        let translated = self.translate_node(expr)?;
        if translated.fragment.len() > MAX_FRAGMENT_LEN {
            return Err(unsupported("translated expression is too large"));
        }
        Ok(translated)
    }

    /// Translates a predicate to a 0/1 condition
    pub fn condition(&self, expr: &Expression) -> AggregationResult<SqlFragment> {
        Ok(self.translate(expr)?.truthy())
    }

    /// Translates a field value, honouring a top-level `$$REMOVE`
    pub fn field_value(&self, expr: &Expression) -> AggregationResult<FieldSql> {
        if expr.is_remove() {
            return Ok(FieldSql {
                value: SqlFragment::raw("NULL"),
                remove_when: Some(SqlFragment::raw("1")),
            });
        }

        if let Expression::Operator(Operator::Cond, args) = expr {
            if args.len() == 3 && (args[1].is_remove() || args[2].is_remove()) {
                let (kept, removed_on_true) = if args[1].is_remove() {
                    (&args[2], true)
                } else {
                    (&args[1], false)
                };
                if yields_remove(kept) {
                    return Err(unsupported("nested $$REMOVE"));
                }
                let condition = self.condition(&args[0])?;
                let remove_when = if removed_on_true {
                    condition
                } else {
                    condition.wrap("(NOT ", ")")
                };
                let kept = self.translate(kept)?.embed();
                let mut value = SqlFragment::raw("CASE WHEN ");
                value
                    .append(&remove_when)
                    .push(" THEN NULL ELSE ")
                    .append(&kept)
                    .push(" END");
                return Ok(FieldSql {
                    value,
                    remove_when: Some(remove_when),
                });
            }
        }

        if yields_remove(expr) {
            return Err(unsupported("$$REMOVE is only translated as a field value or $cond branch"));
        }
        Ok(FieldSql {
            value: self.translate(expr)?.embed(),
            remove_when: None,
        })
    }

    fn translate_node(&self, expr: &Expression) -> AggregationResult<SqlExpr> {
        match expr {
            Expression::Literal(value) => literal(value),
            Expression::FieldRef(path) => self.current_field(path),
            Expression::Variable(variable, path) => {
                let column = match variable {
                    Variable::Root => self.root,
                    Variable::Current => self.data,
                    Variable::Remove => return Ok(SqlExpr::new(SqlFragment::raw("NULL"), SqlKind::Json)),
                    Variable::User(name) => {
                        return Err(unsupported(format!("variable $${}", name)))
                    }
                };
                match path {
                    Some(path) if *variable == Variable::Current => self.current_field(path),
                    Some(path) => self.field(column, path),
                    None => Ok(SqlExpr::new(SqlFragment::raw(column), SqlKind::Json)),
                }
            }
            Expression::Object(fields) => {
                let mut f = SqlFragment::raw("json_object(");
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.push(", ");
                    }
                    let value = self.translate_node(value)?;
                    f.bind(key.as_str()).push(", ").append(&value.embed());
                }
                f.push(")");
                Ok(SqlExpr::new(f, SqlKind::Json))
            }
            Expression::Array(items) => {
                let parts = items
                    .iter()
                    .map(|item| Ok(self.translate_node(item)?.embed()))
                    .collect::<AggregationResult<Vec<_>>>()?;
                Ok(SqlExpr::new(
                    SqlFragment::join(&parts, ", ").wrap("json_array(", ")"),
                    SqlKind::Json,
                ))
            }
            Expression::Operator(op, args) => {
                if !op.accepts(args.len()) {
                    // The interpreter reports the arity error when it evaluates
                    return Err(unsupported(format!("{} with {} argument(s)", op, args.len())));
                }
                self.operator(*op, args)
            }
        }
    }

    fn current_field(&self, path: &FieldPath) -> AggregationResult<SqlExpr> {
        let kind = match (self.known, path.segments()) {
            (Some(known), [name]) => known.get(name.as_str()).copied(),
            _ => None,
        };
        match (kind, path.json_path()) {
            (Some(kind), Some(json_path)) if kind != SqlKind::Json => {
                let mut f = SqlFragment::raw("(");
                f.push(self.data).push(" ->> ").bind(json_path).push(")");
                Ok(SqlExpr::new(f, kind))
            }
            _ => self.field(self.data, path),
        }
    }

    fn field(&self, column: &str, path: &FieldPath) -> AggregationResult<SqlExpr> {
        let json_path = path
            .json_path()
            .ok_or_else(|| unsupported(format!("field path '{}'", path)))?;
        let mut f = SqlFragment::raw("NULLIF(");
        f.push(column).push(" -> ").bind(json_path).push(", 'null')");
        Ok(SqlExpr::new(f, SqlKind::Json))
    }

    fn raise(&self, op: &str, message: &str) -> AggregationResult<SqlFragment> {
        if !self.caps.raise_function {
            return Err(unsupported("engine cannot raise type errors"));
        }
        let mut f = SqlFragment::raw("aero_raise(");
        f.bind(AggregationErrorCode::AeroExprTypeMismatch.code())
            .push(", ")
            .bind(format!("{}: {}", op, message))
            .push(")");
        Ok(f)
    }

    /// NULL stays NULL; any other value raises
    fn raise_unless_null(&self, x: &SqlFragment, op: &str, message: &str) -> AggregationResult<SqlFragment> {
        let raise = self.raise(op, message)?;
        let mut f = SqlFragment::raw("CASE WHEN ");
        f.append(x).push(" IS NULL THEN NULL ELSE ").append(&raise).push(" END");
        Ok(f)
    }

    /// Numeric SQL value; raises for non-numbers
    fn numeric(&self, e: &SqlExpr, op: &str) -> AggregationResult<SqlFragment> {
        let x = &e.fragment;
        match e.kind {
            SqlKind::Number => Ok(x.clone()),
            SqlKind::Text => self.raise_unless_null(x, op, "expected a number, got string"),
            SqlKind::Bool => self.raise_unless_null(x, op, "expected a number, got bool"),
            SqlKind::Json => {
                let raise = self.raise(op, "expected a number")?;
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(x)
                    .push(" IS NULL THEN NULL WHEN json_type(")
                    .append(x)
                    .push(") IN ('integer', 'real') THEN aero_json_scalar(")
                    .append(x)
                    .push(") ELSE ")
                    .append(&raise)
                    .push(" END");
                Ok(f)
            }
        }
    }

    /// Text SQL value; raises for non-strings
    fn text(&self, e: &SqlExpr, op: &str) -> AggregationResult<SqlFragment> {
        let x = &e.fragment;
        match e.kind {
            SqlKind::Text => Ok(x.clone()),
            SqlKind::Number => self.raise_unless_null(x, op, "expected a string, got number"),
            SqlKind::Bool => self.raise_unless_null(x, op, "expected a string, got bool"),
            SqlKind::Json => {
                let raise = self.raise(op, "expected a string")?;
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(x)
                    .push(" IS NULL THEN NULL WHEN json_type(")
                    .append(x)
                    .push(") = 'text' THEN ")
                    .append(x)
                    .push(" ->> '$' ELSE ")
                    .append(&raise)
                    .push(" END");
                Ok(f)
            }
        }
    }

    /// JSON array SQL value; raises for non-arrays
    fn array(&self, e: &SqlExpr, op: &str) -> AggregationResult<SqlFragment> {
        let x = &e.fragment;
        match e.kind {
            SqlKind::Json => {
                let raise = self.raise(op, "expected an array")?;
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(x)
                    .push(" IS NULL THEN NULL WHEN json_type(")
                    .append(x)
                    .push(") = 'array' THEN ")
                    .append(x)
                    .push(" ELSE ")
                    .append(&raise)
                    .push(" END");
                Ok(f)
            }
            _ => self.raise_unless_null(x, op, "expected an array"),
        }
    }

    fn args(&self, args: &[Expression]) -> AggregationResult<Vec<SqlExpr>> {
        args.iter().map(|a| self.translate_node(a)).collect()
    }

    fn numbers(&self, op: Operator, args: &[Expression]) -> AggregationResult<Vec<SqlFragment>> {
        self.args(args)?
            .iter()
            .map(|a| self.numeric(a, op.name()))
            .collect()
    }

    fn require_math(&self, op: Operator) -> AggregationResult<()> {
        if self.caps.math_functions {
            Ok(())
        } else {
            Err(unsupported(format!("{} needs engine math functions", op)))
        }
    }

    fn operator(&self, op: Operator, args: &[Expression]) -> AggregationResult<SqlExpr> {
        let name = op.name();
        let number = |f: SqlFragment| Ok(SqlExpr::new(f, SqlKind::Number));
        let text = |f: SqlFragment| Ok(SqlExpr::new(f, SqlKind::Text));
        let boolean = |f: SqlFragment| Ok(SqlExpr::new(f, SqlKind::Bool));
        let finite = |f: SqlFragment| Ok(SqlExpr::new(f.wrap("aero_finite(", ")"), SqlKind::Number));

        match op {
            // ---- arithmetic ----
            Operator::Add | Operator::Multiply => {
                let separator = if op == Operator::Add { " + " } else { " * " };
                let parts = self.numbers(op, args)?;
                finite(SqlFragment::join(&parts, separator).wrap("(", ")"))
            }
            Operator::Subtract => {
                let parts = self.numbers(op, args)?;
                finite(SqlFragment::join(&parts, " - ").wrap("(", ")"))
            }
            Operator::Divide => {
                let parts = self.numbers(op, args)?;
                let mut f = parts[0].wrap("(CAST(", " AS REAL) / ");
                f.append(&parts[1]).push(")");
                finite(f)
            }
            Operator::Mod => {
                self.require_math(op)?;
                let parts = self.numbers(op, args)?;
                let (a, b) = (&parts[0], &parts[1]);
                let mut f = SqlFragment::raw("CASE WHEN typeof(");
                f.append(a)
                    .push(") = 'integer' AND typeof(")
                    .append(b)
                    .push(") = 'integer' THEN ")
                    .append(a)
                    .push(" % ")
                    .append(b)
                    .push(" ELSE mod(")
                    .append(a)
                    .push(", ")
                    .append(b)
                    .push(") END");
                finite(f)
            }
            Operator::Abs => {
                let parts = self.numbers(op, args)?;
                number(parts[0].wrap("abs(", ")"))
            }
            Operator::Ceil | Operator::Floor => {
                self.require_math(op)?;
                let parts = self.numbers(op, args)?;
                let function = if op == Operator::Ceil { "ceil(" } else { "floor(" };
                number(parts[0].wrap(function, ")"))
            }
            Operator::Trunc => {
                self.require_math(op)?;
                if args.len() > 1 {
                    return Err(unsupported("$trunc with places"));
                }
                let parts = self.numbers(op, args)?;
                number(parts[0].wrap("trunc(", ")"))
            }
            Operator::Round => {
                let places = match args.get(1) {
                    None => 0,
                    Some(Expression::Literal(v)) => match v.as_i64() {
                        Some(p) if (0..=100).contains(&p) => p,
                        _ => return Err(unsupported("$round places must be a literal in 0..=100")),
                    },
                    Some(_) => return Err(unsupported("$round with computed places")),
                };
                let parts = self.numbers(op, &args[..1])?;
                let x = &parts[0];
                let mut f = SqlFragment::raw("CASE WHEN typeof(");
                f.append(x)
                    .push(") = 'integer' THEN ")
                    .append(x)
                    .push(" ELSE round(")
                    .append(x)
                    .push(", ")
                    .bind(places)
                    .push(") END");
                number(f)
            }
            Operator::Sqrt
            | Operator::Exp
            | Operator::Ln
            | Operator::Log10
            | Operator::Sin
            | Operator::Cos
            | Operator::Tan
            | Operator::Asin
            | Operator::Acos
            | Operator::Atan
            | Operator::DegreesToRadians
            | Operator::RadiansToDegrees => {
                self.require_math(op)?;
                let function = match op {
                    Operator::Sqrt => "sqrt(",
                    Operator::Exp => "exp(",
                    Operator::Ln => "ln(",
                    Operator::Log10 => "log10(",
                    Operator::Sin => "sin(",
                    Operator::Cos => "cos(",
                    Operator::Tan => "tan(",
                    Operator::Asin => "asin(",
                    Operator::Acos => "acos(",
                    Operator::Atan => "atan(",
                    Operator::DegreesToRadians => "radians(",
                    _ => "degrees(",
                };
                let parts = self.numbers(op, args)?;
                // Math functions return REAL even for integer input
                finite(parts[0].wrap(&format!("CAST({}", function), ") AS REAL)"))
            }
            Operator::Pow | Operator::Atan2 => {
                self.require_math(op)?;
                let parts = self.numbers(op, args)?;
                let function = if op == Operator::Pow { "pow(" } else { "atan2(" };
                let mut f = SqlFragment::raw(function);
                f.append(&parts[0]).push(", ").append(&parts[1]).push(")");
                finite(f)
            }
            Operator::Log => Err(unsupported("$log with a base")),

            // ---- comparison ----
            Operator::Eq
            | Operator::Ne
            | Operator::Gt
            | Operator::Gte
            | Operator::Lt
            | Operator::Lte => {
                let parts = self.args(args)?;
                let symbol = match op {
                    Operator::Eq => " = ",
                    Operator::Ne => " <> ",
                    Operator::Gt => " > ",
                    Operator::Gte => " >= ",
                    Operator::Lt => " < ",
                    _ => " <= ",
                };
                let mut f = parts[0].sort_key().wrap("(", symbol);
                f.append(&parts[1].sort_key()).push(")");
                boolean(f)
            }
            Operator::Cmp => {
                let parts = self.args(args)?;
                let (a, b) = (parts[0].sort_key(), parts[1].sort_key());
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&a)
                    .push(" IS NULL OR ")
                    .append(&b)
                    .push(" IS NULL THEN NULL WHEN ")
                    .append(&a)
                    .push(" < ")
                    .append(&b)
                    .push(" THEN -1 WHEN ")
                    .append(&a)
                    .push(" > ")
                    .append(&b)
                    .push(" THEN 1 ELSE 0 END");
                number(f)
            }

            // ---- logical ----
            Operator::And | Operator::Or => {
                if args.is_empty() {
                    return boolean(SqlFragment::raw(if op == Operator::And { "1" } else { "0" }));
                }
                let parts: Vec<SqlFragment> = self.args(args)?.iter().map(SqlExpr::truthy).collect();
                let separator = if op == Operator::And { " AND " } else { " OR " };
                boolean(SqlFragment::join(&parts, separator).wrap("(", ")"))
            }
            Operator::Not => {
                let parts = self.args(args)?;
                boolean(parts[0].truthy().wrap("(NOT ", ")"))
            }

            // ---- conditional ----
            Operator::Cond => {
                let condition = self.translate_node(&args[0])?.truthy();
                let branches = unify(self.args(&args[1..])?);
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&condition)
                    .push(" THEN ")
                    .append(&branches.0[0])
                    .push(" ELSE ")
                    .append(&branches.0[1])
                    .push(" END");
                Ok(SqlExpr::new(f, branches.1))
            }
            Operator::IfNull => {
                let (parts, kind) = unify(self.args(args)?);
                Ok(SqlExpr::new(
                    SqlFragment::join(&parts, ", ").wrap("COALESCE(", ")"),
                    kind,
                ))
            }
            Operator::Switch => {
                let has_default = args.len() % 2 == 1;
                let mut conditions = Vec::new();
                let mut results = Vec::new();
                for pair in args.chunks(2) {
                    match pair {
                        [case, then] => {
                            conditions.push(self.translate_node(case)?.truthy());
                            results.push(self.translate_node(then)?);
                        }
                        [default] => results.push(self.translate_node(default)?),
                        _ => {}
                    }
                }
                if results.is_empty() {
                    return Ok(SqlExpr::new(SqlFragment::raw("NULL"), SqlKind::Json));
                }
                let (results, kind) = unify(results);
                let mut f = SqlFragment::raw("CASE");
                for (condition, result) in conditions.iter().zip(results.iter()) {
                    f.push(" WHEN ").append(condition).push(" THEN ").append(result);
                }
                if has_default {
                    if let Some(default) = results.last() {
                        f.push(" ELSE ").append(default);
                    }
                }
                f.push(" END");
                Ok(SqlExpr::new(f, kind))
            }

            // ---- arrays ----
            Operator::Size => {
                let parts = self.args(args)?;
                let arr = self.array(&parts[0], name)?;
                number(arr.wrap("json_array_length(", ")"))
            }
            Operator::IsArray => {
                let parts = self.args(args)?;
                match parts[0].kind {
                    SqlKind::Json => boolean(parts[0].fragment.wrap("COALESCE(json_type(", ") = 'array', 0)")),
                    _ => boolean(SqlFragment::raw("0")),
                }
            }
            Operator::ArrayElemAt | Operator::First | Operator::Last => {
                let index = match op {
                    Operator::First => 0,
                    Operator::Last => -1,
                    _ => match &args[1] {
                        Expression::Literal(v) => v
                            .as_i64()
                            .ok_or_else(|| unsupported("$arrayElemAt index must be an integer literal"))?,
                        _ => return Err(unsupported("$arrayElemAt with a computed index")),
                    },
                };
                let path = if index >= 0 {
                    format!("$[{}]", index)
                } else {
                    format!("$[#-{}]", index.unsigned_abs())
                };
                let parts = self.args(&args[..1])?;
                let arr = self.array(&parts[0], name)?;
                let mut f = SqlFragment::raw("NULLIF(");
                f.append(&arr).push(" -> ").bind(path).push(", 'null')");
                Ok(SqlExpr::new(f, SqlKind::Json))
            }
            Operator::In => {
                let parts = self.args(args)?;
                let needle = parts[0].sort_key();
                let haystack = &parts[1];
                if haystack.kind != SqlKind::Json {
                    return Err(unsupported("$in over a non-array value"));
                }
                let x = &haystack.fragment;
                let raise = self.raise(name, "expected an array")?;
                let mut f = SqlFragment::raw("CASE WHEN json_type(");
                f.append(x)
                    .push(") = 'array' THEN EXISTS (SELECT 1 FROM json_each(")
                    .append(x)
                    .push(") AS e WHERE ")
                    .push(&each_sort_key("e"))
                    .push(" IS ")
                    .append(&needle)
                    .push(") ELSE ")
                    .append(&raise)
                    .push(" END");
                boolean(f)
            }

            // ---- strings ----
            Operator::Concat => {
                if args.is_empty() {
                    return text(SqlFragment::param(""));
                }
                let parts = self
                    .args(args)?
                    .iter()
                    .map(|a| self.text(a, name))
                    .collect::<AggregationResult<Vec<_>>>()?;
                text(SqlFragment::join(&parts, " || ").wrap("(", ")"))
            }
            Operator::ToUpper | Operator::ToLower => {
                let parts = self.args(args)?;
                let s = self.text(&parts[0], name)?;
                let function = if op == Operator::ToUpper { "upper(COALESCE(" } else { "lower(COALESCE(" };
                let mut f = s.wrap(function, ", ");
                f.bind("").push("))");
                text(f)
            }
            Operator::Substr | Operator::SubstrCP => {
                let literal_index = |e: &Expression| match e {
                    Expression::Literal(v) => v.as_i64().filter(|i| *i >= 0),
                    _ => None,
                };
                let (start, len) = match (literal_index(&args[1]), literal_index(&args[2])) {
                    (Some(start), Some(len)) => (start, len),
                    _ => return Err(unsupported(format!("{} needs literal non-negative bounds", name))),
                };
                let parts = self.args(&args[..1])?;
                let s = self.text(&parts[0], name)?;
                let mut f = s.wrap("substr(COALESCE(", ", ");
                f.bind("").push("), ").bind(start + 1).push(", ").bind(len).push(")");
                text(f)
            }
            Operator::StrLenCP => {
                let parts = self.args(args)?;
                number(self.text(&parts[0], name)?.wrap("length(", ")"))
            }
            Operator::Trim | Operator::Ltrim | Operator::Rtrim => {
                let chars = match args.get(1) {
                    None => DEFAULT_TRIM_CHARS.to_string(),
                    Some(Expression::Literal(Value::String(c))) => c.clone(),
                    Some(_) => return Err(unsupported(format!("{} with computed chars", name))),
                };
                let function = match op {
                    Operator::Trim => "trim(",
                    Operator::Ltrim => "ltrim(",
                    _ => "rtrim(",
                };
                let parts = self.args(&args[..1])?;
                let mut f = self.text(&parts[0], name)?.wrap(function, ", ");
                f.bind(chars).push(")");
                text(f)
            }
            Operator::IndexOfCP => {
                if args.len() > 2 {
                    return Err(unsupported("$indexOfCP with bounds"));
                }
                let parts = self.args(args)?;
                let s = self.text(&parts[0], name)?;
                let sub = self.text(&parts[1], name)?;
                let raise = self.raise(name, "expected a string, got null")?;
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&s)
                    .push(" IS NULL THEN NULL WHEN ")
                    .append(&sub)
                    .push(" IS NULL THEN ")
                    .append(&raise)
                    .push(" ELSE instr(")
                    .append(&s)
                    .push(", ")
                    .append(&sub)
                    .push(") - 1 END");
                number(f)
            }
            Operator::Strcasecmp => {
                let parts = self.args(args)?;
                let lowered = |e: &SqlExpr| -> AggregationResult<SqlFragment> {
                    let mut f = self.text(e, name)?.wrap("lower(COALESCE(", ", ");
                    f.bind("").push("))");
                    Ok(f)
                };
                let (a, b) = (lowered(&parts[0])?, lowered(&parts[1])?);
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&a)
                    .push(" < ")
                    .append(&b)
                    .push(" THEN -1 WHEN ")
                    .append(&a)
                    .push(" > ")
                    .append(&b)
                    .push(" THEN 1 ELSE 0 END");
                number(f)
            }
            Operator::RegexMatch => {
                if !self.caps.regexp {
                    return Err(unsupported("engine has no regex function"));
                }
                let pattern = match &args[1] {
                    Expression::Literal(Value::String(p)) => p.clone(),
                    _ => return Err(unsupported("$regexMatch with a computed pattern")),
                };
                let options = match args.get(2) {
                    None | Some(Expression::Literal(Value::Null)) => String::new(),
                    Some(Expression::Literal(Value::String(o))) => o.clone(),
                    Some(_) => return Err(unsupported("$regexMatch with computed options")),
                };
                // Invalid patterns are reported by the interpreter
                compile_pattern(&pattern, &options).map_err(unsupported)?;
                let parts = self.args(&args[..1])?;
                let mut f = self.text(&parts[0], name)?.wrap("COALESCE(aero_regexp(", ", ");
                f.bind(pattern).push(", ").bind(options).push("), 0)");
                boolean(f)
            }
            Operator::ReplaceAll => {
                let parts = self
                    .args(args)?
                    .iter()
                    .map(|a| self.text(a, name))
                    .collect::<AggregationResult<Vec<_>>>()?;
                text(SqlFragment::join(&parts, ", ").wrap("replace(", ")"))
            }

            // ---- dates ----
            Operator::Year
            | Operator::Month
            | Operator::DayOfMonth
            | Operator::Hour
            | Operator::Minute
            | Operator::Second
            | Operator::DayOfWeek
            | Operator::DayOfYear => {
                let format = match op {
                    Operator::Year => "%Y",
                    Operator::Month => "%m",
                    Operator::DayOfMonth => "%d",
                    Operator::Hour => "%H",
                    Operator::Minute => "%M",
                    Operator::Second => "%S",
                    Operator::DayOfWeek => "%w",
                    _ => "%j",
                };
                let parts = self.args(args)?;
                let d = self.text(&parts[0], name)?;
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&d)
                    .push(" GLOB ")
                    .bind(DATE_GLOB)
                    .push(" THEN CAST(strftime(")
                    .bind(format)
                    .push(", ")
                    .append(&d)
                    .push(") AS INTEGER)");
                if op == Operator::DayOfWeek {
                    f.push(" + 1");
                }
                f.push(" END");
                number(f)
            }
            Operator::DateAdd | Operator::DateSubtract => {
                let unit = match &args[1] {
                    Expression::Literal(Value::String(u)) => DateUnit::parse(u)
                        .and_then(|u| u.sql_modifier())
                        .ok_or_else(|| unsupported(format!("{} unit '{}'", name, u)))?,
                    _ => return Err(unsupported(format!("{} with a computed unit", name))),
                };
                let amount = match &args[2] {
                    Expression::Literal(v) => v
                        .as_i64()
                        .ok_or_else(|| unsupported(format!("{} needs an integer amount", name)))?,
                    _ => return Err(unsupported(format!("{} with a computed amount", name))),
                };
                let amount = if op == Operator::DateSubtract {
                    amount
                        .checked_neg()
                        .ok_or_else(|| unsupported(format!("{} amount out of range", name)))?
                } else {
                    amount
                };
                let parts = self.args(&args[..1])?;
                let d = self.text(&parts[0], name)?;
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&d)
                    .push(" GLOB ")
                    .bind(DATE_GLOB)
                    .push(" THEN strftime(")
                    .bind(DATE_SQL_FORMAT)
                    .push(", ")
                    .append(&d)
                    .push(", ")
                    .bind(format!("{:+} {}", amount, unit))
                    .push(") END");
                text(f)
            }

            // ---- objects ----
            Operator::GetField => {
                if args.len() > 1 {
                    return Err(unsupported("$getField with an input"));
                }
                let field = match &args[0] {
                    Expression::Literal(Value::String(f)) if !f.contains('"') => f.clone(),
                    _ => return Err(unsupported("$getField with a computed field")),
                };
                let mut f = SqlFragment::raw("NULLIF(");
                f.push(self.data)
                    .push(" -> ")
                    .bind(format!("$.\"{}\"", field))
                    .push(", 'null')");
                Ok(SqlExpr::new(f, SqlKind::Json))
            }

            // ---- type conversion ----
            Operator::ToString => {
                let parts = self.args(args)?;
                let e = &parts[0];
                match e.kind {
                    SqlKind::Text => text(e.fragment.clone()),
                    SqlKind::Bool => text(e.bool_json()),
                    _ => Err(unsupported("$toString of a number or document value")),
                }
            }
            Operator::ToInt | Operator::ToLong => {
                let parts = self.args(args)?;
                let e = &parts[0];
                match e.kind {
                    SqlKind::Number => number(e.fragment.wrap("CAST(", " AS INTEGER)")),
                    SqlKind::Bool => number(e.fragment.clone()),
                    _ => Err(unsupported(format!("{} of a string or document value", name))),
                }
            }
            Operator::ToDouble => {
                let parts = self.args(args)?;
                let e = &parts[0];
                match e.kind {
                    SqlKind::Number | SqlKind::Bool => number(e.fragment.wrap("CAST(", " AS REAL)")),
                    _ => Err(unsupported("$toDouble of a string or document value")),
                }
            }
            Operator::ToBool => {
                let parts = self.args(args)?;
                let e = &parts[0];
                let mut f = SqlFragment::raw("CASE WHEN ");
                f.append(&e.fragment)
                    .push(" IS NULL THEN NULL ELSE ")
                    .append(&e.truthy())
                    .push(" END");
                boolean(f)
            }
            Operator::Type => {
                let parts = self.args(args)?;
                let x = &parts[0].fragment;
                let mut f = SqlFragment::new();
                match parts[0].kind {
                    SqlKind::Number => {
                        f.push("CASE typeof(")
                            .append(x)
                            .push(") WHEN 'integer' THEN CASE WHEN ")
                            .append(x)
                            .push(" BETWEEN -2147483648 AND 2147483647 THEN 'int' ELSE 'long' END WHEN 'real' THEN 'double' ELSE 'null' END");
                    }
                    SqlKind::Text => {
                        f.push("CASE WHEN ").append(x).push(" IS NULL THEN 'null' ELSE 'string' END");
                    }
                    SqlKind::Bool => {
                        f.push("CASE WHEN ").append(x).push(" IS NULL THEN 'null' ELSE 'bool' END");
                    }
                    SqlKind::Json => {
                        f.push("CASE json_type(")
                            .append(x)
                            .push(") WHEN 'integer' THEN CASE WHEN ")
                            .append(x)
                            .push(" ->> '$' BETWEEN -2147483648 AND 2147483647 THEN 'int' ELSE 'long' END")
                            .push(" WHEN 'real' THEN 'double' WHEN 'text' THEN 'string'")
                            .push(" WHEN 'true' THEN 'bool' WHEN 'false' THEN 'bool'")
                            .push(" WHEN 'object' THEN 'object' WHEN 'array' THEN 'array' ELSE 'null' END");
                    }
                }
                text(f)
            }
            Operator::IsNumber => {
                let parts = self.args(args)?;
                let x = &parts[0].fragment;
                match parts[0].kind {
                    SqlKind::Number => boolean(x.wrap("(", " IS NOT NULL)")),
                    SqlKind::Json => boolean(x.wrap("COALESCE(json_type(", ") IN ('integer', 'real'), 0)")),
                    _ => boolean(SqlFragment::raw("0")),
                }
            }

            Operator::Let
            | Operator::ConcatArrays
            | Operator::Slice
            | Operator::ReverseArray
            | Operator::Range
            | Operator::IndexOfArray
            | Operator::Filter
            | Operator::Map
            | Operator::Reduce
            | Operator::Sum
            | Operator::Avg
            | Operator::Min
            | Operator::Max
            | Operator::Split
            | Operator::DateDiff
            | Operator::DateToString
            | Operator::MergeObjects
            | Operator::ObjectToArray => Err(unsupported(format!("{} is interpreter-only", name))),
        }
    }
}

/// Sort key of a `json_each` row, equivalent to [`SqlExpr::sort_key`]
pub fn each_sort_key(alias: &str) -> String {
    format!(
        "CASE {a}.type WHEN 'object' THEN CAST(char(3) || {a}.value AS BLOB) \
         WHEN 'array' THEN CAST(char(4) || {a}.value AS BLOB) \
         WHEN 'true' THEN CAST(char(5) || 'true' AS BLOB) \
         WHEN 'false' THEN CAST(char(5) || 'false' AS BLOB) \
         WHEN 'null' THEN NULL ELSE {a}.value END",
        a = alias
    )
}

/// Bound parameter equal to [`SqlExpr::sort_key`] of a constant; `None` for null
pub fn sort_key_param(value: &Value) -> Option<SqlValue> {
    let ranked = |rank: u8, text: &str| {
        let mut bytes = vec![rank];
        bytes.extend_from_slice(text.as_bytes());
        SqlValue::Blob(bytes)
    };
    match value {
        Value::Null => None,
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        Value::Bool(b) => Some(ranked(5, if *b { "true" } else { "false" })),
        Value::Object(_) => Some(ranked(3, &value.to_string())),
        Value::Array(_) => Some(ranked(4, &value.to_string())),
    }
}

/// Recovers the JSON text of a value from its sort key column
pub fn sort_key_json(key: &str) -> String {
    format!(
        "json(CASE typeof({k}) WHEN 'blob' THEN substr(CAST({k} AS TEXT), 2) \
         WHEN 'text' THEN json_quote({k}) ELSE aero_number_json({k}) END)",
        k = key
    )
}

fn literal(value: &Value) -> AggregationResult<SqlExpr> {
    Ok(match value {
        Value::Null => SqlExpr::new(SqlFragment::raw("NULL"), SqlKind::Json),
        Value::Bool(b) => SqlExpr::new(SqlFragment::param(*b as i64), SqlKind::Bool),
        Value::Number(n) => {
            let param = match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => SqlValue::Integer(i),
                (None, Some(f)) if !n.is_u64() => SqlValue::Real(f),
                _ => return Err(unsupported(format!("numeric literal {}", n))),
            };
            SqlExpr::new(SqlFragment::param(param), SqlKind::Number)
        }
        Value::String(s) => SqlExpr::new(SqlFragment::param(s.as_str()), SqlKind::Text),
        Value::Array(_) | Value::Object(_) => SqlExpr::new(
            SqlFragment::param(value.to_string()).wrap("json(", ")"),
            SqlKind::Json,
        ),
    })
}

/// Brings branch values to one kind; mixed kinds become JSON
fn unify(parts: Vec<SqlExpr>) -> (Vec<SqlFragment>, SqlKind) {
    let first = parts.first().map(|p| p.kind).unwrap_or(SqlKind::Json);
    if parts.iter().all(|p| p.kind == first) {
        return (parts.into_iter().map(|p| p.fragment).collect(), first);
    }
    (parts.iter().map(SqlExpr::as_json).collect(), SqlKind::Json)
}

/// True when `expr` can evaluate to `$$REMOVE` at field level
pub fn yields_remove(expr: &Expression) -> bool {
    match expr {
        Expression::Variable(Variable::Remove, None) => true,
        Expression::Operator(Operator::Cond, args) => args.iter().skip(1).any(yields_remove),
        Expression::Operator(Operator::IfNull, args) => args.last().map(yields_remove).unwrap_or(false),
        Expression::Operator(Operator::Switch, args) => args
            .chunks(2)
            .any(|pair| pair.last().map(yields_remove).unwrap_or(false)),
        Expression::Operator(Operator::Let, args) => args.get(1).map(yields_remove).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::parse_expression;
    use serde_json::json;

    fn translator() -> ExprTranslator<'static> {
        ExprTranslator::new("s.data", "s.root_payload", Capabilities::full())
    }

    fn translate(expr: Value) -> AggregationResult<SqlExpr> {
        translator().translate(&parse_expression(&expr)?)
    }

    #[test]
    fn test_placeholders_match_params() {
        let e = translate(json!({"$add": ["$a", 5, {"$multiply": ["$b", 2]}]})).unwrap();
        let placeholders = e.fragment.sql.matches('?').count();
        assert_eq!(placeholders, e.fragment.params.len());
    }

    #[test]
    fn test_constants_are_bound() {
        let e = translate(json!({"$eq": ["$name", "Alice"]})).unwrap();
        assert!(!e.fragment.sql.contains("Alice"));
        assert!(e.fragment.params.contains(&SqlValue::from("Alice")));
        assert_eq!(e.kind, SqlKind::Bool);
    }

    #[test]
    fn test_field_reference() {
        let e = translate(json!("$a.b")).unwrap();
        assert_eq!(e.kind, SqlKind::Json);
        assert_eq!(e.fragment.sql, "NULLIF(s.data -> ?, 'null')");
        assert_eq!(e.fragment.params, vec![SqlValue::from("$.a.b")]);
    }

    #[test]
    fn test_interpreter_only_operators_decline() {
        for expr in [
            json!({"$map": {"input": "$xs", "in": "$$this"}}),
            json!({"$split": ["$a", ","]}),
            json!({"$log": [8, 2]}),
            json!({"$substrCP": ["$a", "$start", 2]}),
            json!("$$custom"),
        ] {
            let err = translate(expr.clone()).unwrap_err();
            assert!(err.is_fallback(), "{} should decline", expr);
        }
    }

    #[test]
    fn test_arity_errors_decline() {
        let err = translate(json!({"$divide": [1, 2, 3]})).unwrap_err();
        assert!(err.is_fallback());
    }

    #[test]
    fn test_math_requires_capability() {
        let caps = Capabilities {
            math_functions: false,
            ..Capabilities::full()
        };
        let t = ExprTranslator::new("data", "data", caps);
        let expr = parse_expression(&json!({"$sqrt": "$a"})).unwrap();
        assert!(t.translate(&expr).unwrap_err().is_fallback());
    }

    #[test]
    fn test_type_checks_need_raise() {
        let caps = Capabilities {
            raise_function: false,
            ..Capabilities::full()
        };
        let t = ExprTranslator::new("data", "data", caps);
        let expr = parse_expression(&json!({"$add": ["$a", 1]})).unwrap();
        assert!(t.translate(&expr).unwrap_err().is_fallback());
    }

    #[test]
    fn test_known_fields_read_as_scalars() {
        let mut known = HashMap::new();
        known.insert("revenue".to_string(), SqlKind::Number);
        let t = translator().with_known_fields(&known);
        let e = t.translate(&parse_expression(&json!("$revenue")).unwrap()).unwrap();
        assert_eq!(e.kind, SqlKind::Number);
        assert_eq!(e.fragment.sql, "(s.data ->> ?)");

        let e = t.translate(&parse_expression(&json!("$other")).unwrap()).unwrap();
        assert_eq!(e.kind, SqlKind::Json);
    }

    #[test]
    fn test_remove_field_value() {
        let t = translator();
        let remove = t.field_value(&parse_expression(&json!("$$REMOVE")).unwrap()).unwrap();
        assert!(remove.always_removed());

        let conditional = t
            .field_value(&parse_expression(&json!({"$cond": [{"$gt": ["$a", 1]}, "$$REMOVE", "$a"]})).unwrap())
            .unwrap();
        assert!(conditional.remove_when.is_some());
        assert!(!conditional.always_removed());

        let plain = t.field_value(&parse_expression(&json!({"$add": ["$a", 1]})).unwrap()).unwrap();
        assert!(plain.remove_when.is_none());
    }

    #[test]
    fn test_nested_remove_declines() {
        let expr = parse_expression(&json!({"$ifNull": ["$a", {"$cond": [true, "$$REMOVE", 1]}]})).unwrap();
        assert!(translator().field_value(&expr).unwrap_err().is_fallback());
    }

    #[test]
    fn test_unify_mixed_kinds() {
        let e = translate(json!({"$cond": [true, 1, "$a"]})).unwrap();
        assert_eq!(e.kind, SqlKind::Json);
        let e = translate(json!({"$cond": [true, 1, 2]})).unwrap();
        assert_eq!(e.kind, SqlKind::Number);
    }

    #[test]
    fn test_oversized_translation_declines() {
        let mut expr = json!("$a");
        for _ in 0..200 {
            expr = json!({"$cmp": [expr, "$b"]});
        }
        let err = translate(expr).unwrap_err();
        assert!(err.is_fallback());
    }
}
