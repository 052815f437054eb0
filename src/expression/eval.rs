//! In-memory expression evaluation (interpreter tier)
//!
//! Rules shared with the SQL translation:
//!
//! - missing fields evaluate to null
//! - arithmetic, comparison, date and most string operators return null when
//!   an operand is null; a non-null operand of the wrong type is a
//!   `AERO_EXPR_TYPE_MISMATCH` error
//! - `$$REMOVE` only removes a field when it is the field's value (directly or
//!   through a conditional branch); anywhere else it is null
//! - results that are not finite numbers become null

use std::cell::RefCell;
use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::errors::{AggregationError, AggregationResult};
use crate::value::{
    compare_values, compile_pattern, float_value, is_truthy, numeric, type_name, values_equal,
    Numeric, NumericSum,
};

use super::ast::{Expression, Variable};
use super::date::{self, DateUnit};
use super::operators::Operator;

/// Characters removed by `$trim` when no `chars` argument is given
pub const DEFAULT_TRIM_CHARS: &str = " \t\n\r\u{0b}\u{0c}";
/// Most elements a single `$range` may produce
pub const MAX_RANGE_LEN: usize = 1 << 20;

/// Variable bindings introduced by `$let`, `$map`, `$filter` and `$reduce`
struct Frame<'a> {
    bindings: &'a [(String, Value)],
    parent: Option<&'a Frame<'a>>,
}

/// Evaluation context for one document
pub struct Scope<'a> {
    root: &'a Value,
    current: &'a Value,
    frame: Option<&'a Frame<'a>>,
}

impl<'a> Scope<'a> {
    /// Scope for a stage whose input document is `current`
    pub fn new(root: &'a Value, current: &'a Value) -> Self {
        Self {
            root,
            current,
            frame: None,
        }
    }

    /// Scope where `$$ROOT` and `$$CURRENT` are the same document
    pub fn for_document(doc: &'a Value) -> Self {
        Self::new(doc, doc)
    }

    /// The document entering the current stage
    pub fn current(&self) -> &'a Value {
        self.current
    }

    fn lookup(&self, name: &str) -> Option<&'a Value> {
        let mut frame = self.frame;
        while let Some(f) = frame {
            if let Some((_, value)) = f.bindings.iter().rev().find(|(n, _)| n == name) {
                return Some(value);
            }
            frame = f.parent;
        }
        None
    }
}

/// Evaluates an expression; `$$REMOVE` evaluates to null
pub fn evaluate(expr: &Expression, scope: &Scope<'_>) -> AggregationResult<Value> {
    Ok(eval(expr, scope)?.unwrap_or(Value::Null))
}

/// Evaluates a field value; `None` means the field must be removed
pub fn evaluate_field(expr: &Expression, scope: &Scope<'_>) -> AggregationResult<Option<Value>> {
    eval(expr, scope)
}

/// Evaluates an expression to a boolean
pub fn evaluate_truthy(expr: &Expression, scope: &Scope<'_>) -> AggregationResult<bool> {
    Ok(is_truthy(&evaluate(expr, scope)?))
}

fn eval(expr: &Expression, scope: &Scope<'_>) -> AggregationResult<Option<Value>> {
    match expr {
        Expression::Literal(v) => Ok(Some(v.clone())),
        Expression::FieldRef(path) => Ok(Some(path.resolve(scope.current).cloned().unwrap_or(Value::Null))),
        Expression::Variable(variable, path) => {
            let base = match variable {
                Variable::Remove => return Ok(None),
                Variable::Root => scope.root,
                Variable::Current => scope.current,
                Variable::User(name) => scope.lookup(name).ok_or_else(|| {
                    AggregationError::invalid_expression(format!("undefined variable '$${}'", name))
                })?,
            };
            let value = match path {
                Some(path) => path.resolve(base).cloned().unwrap_or(Value::Null),
                None => base.clone(),
            };
            Ok(Some(value))
        }
        Expression::Object(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (key, value) in fields {
                map.insert(key.clone(), evaluate(value, scope)?);
            }
            Ok(Some(Value::Object(map)))
        }
        Expression::Array(items) => {
            let values = items
                .iter()
                .map(|item| evaluate(item, scope))
                .collect::<AggregationResult<Vec<_>>>()?;
            Ok(Some(Value::Array(values)))
        }
        Expression::Operator(op, args) => {
            if !op.accepts(args.len()) {
                return Err(AggregationError::arity(op.name(), op.arity_label(), args.len()));
            }
            match op {
                Operator::Cond => {
                    if evaluate_truthy(&args[0], scope)? {
                        eval(&args[1], scope)
                    } else {
                        eval(&args[2], scope)
                    }
                }
                Operator::IfNull => {
                    let (last, candidates) = match args.split_last() {
                        Some(split) => split,
                        None => return Ok(Some(Value::Null)),
                    };
                    for candidate in candidates {
                        let value = evaluate(candidate, scope)?;
                        if !value.is_null() {
                            return Ok(Some(value));
                        }
                    }
                    eval(last, scope)
                }
                Operator::Switch => {
                    for pair in args.chunks(2) {
                        match pair {
                            [case, then] => {
                                if evaluate_truthy(case, scope)? {
                                    return eval(then, scope);
                                }
                            }
                            [default] => return eval(default, scope),
                            _ => {}
                        }
                    }
                    Ok(Some(Value::Null))
                }
                Operator::Let => eval_let(args, scope),
                _ => eval_operator(*op, args, scope).map(Some),
            }
        }
    }
}

fn values(args: &[Expression], scope: &Scope<'_>) -> AggregationResult<Vec<Value>> {
    args.iter().map(|arg| evaluate(arg, scope)).collect()
}

fn eval_let(args: &[Expression], scope: &Scope<'_>) -> AggregationResult<Option<Value>> {
    let vars = match &args[0] {
        Expression::Object(vars) => vars,
        _ => return Err(AggregationError::invalid_expression("$let requires a 'vars' object")),
    };
    let bindings = vars
        .iter()
        .map(|(name, expr)| Ok((name.clone(), evaluate(expr, scope)?)))
        .collect::<AggregationResult<Vec<_>>>()?;
    let frame = Frame {
        bindings: &bindings,
        parent: scope.frame,
    };
    let inner = Scope {
        root: scope.root,
        current: scope.current,
        frame: Some(&frame),
    };
    eval(&args[1], &inner)
}

fn eval_operator(op: Operator, args: &[Expression], scope: &Scope<'_>) -> AggregationResult<Value> {
    let name = op.name();
    match op {
        // ---- arithmetic ----
        Operator::Add | Operator::Multiply => {
            let nums = match numbers(name, &values(args, scope)?)? {
                Some(nums) => nums,
                None => return Ok(Value::Null),
            };
            let combine = if op == Operator::Add { add_numeric } else { multiply_numeric };
            let mut iter = nums.into_iter();
            let first = iter.next().unwrap_or(Numeric::Int(0));
            Ok(iter.fold(first, combine).into_value())
        }
        Operator::Subtract => binary_numeric(name, args, scope, |a, b| match (a, b) {
            (Numeric::Int(x), Numeric::Int(y)) => x
                .checked_sub(y)
                .map(Numeric::Int)
                .unwrap_or(Numeric::Float(x as f64 - y as f64)),
            _ => Numeric::Float(a.as_f64() - b.as_f64()),
        }),
        Operator::Divide => binary_numeric(name, args, scope, |a, b| {
            if b.is_zero() {
                Numeric::Float(f64::NAN)
            } else {
                Numeric::Float(a.as_f64() / b.as_f64())
            }
        }),
        Operator::Mod => binary_numeric(name, args, scope, |a, b| match (a, b) {
            (_, b) if b.is_zero() => Numeric::Float(f64::NAN),
            (Numeric::Int(x), Numeric::Int(y)) => Numeric::Int(x.wrapping_rem(y)),
            _ => Numeric::Float(a.as_f64() % b.as_f64()),
        }),
        Operator::Abs => unary_numeric(name, args, scope, |n| match n {
            Numeric::Int(i) => i
                .checked_abs()
                .map(Numeric::Int)
                .unwrap_or(Numeric::Float((i as f64).abs())),
            Numeric::Float(f) => Numeric::Float(f.abs()),
        }),
        Operator::Ceil => unary_numeric(name, args, scope, |n| map_float(n, f64::ceil)),
        Operator::Floor => unary_numeric(name, args, scope, |n| map_float(n, f64::floor)),
        Operator::Round | Operator::Trunc => {
            let vals = values(args, scope)?;
            let places = match vals.get(1) {
                None => 0,
                Some(Value::Null) => return Ok(Value::Null),
                Some(v) => match integer(v) {
                    Some(p) if (-20..=100).contains(&p) => p as i32,
                    _ => {
                        return Err(AggregationError::type_mismatch(
                            name,
                            "places must be an integer between -20 and 100",
                        ))
                    }
                },
            };
            match numbers(name, &vals[..1])? {
                Some(nums) => Ok(if op == Operator::Round {
                    round_numeric(nums[0], places)
                } else {
                    trunc_numeric(nums[0], places)
                }
                .into_value()),
                None => Ok(Value::Null),
            }
        }
        Operator::Sqrt => float_fn(name, args, scope, |x| if x < 0.0 { f64::NAN } else { x.sqrt() }),
        Operator::Exp => float_fn(name, args, scope, f64::exp),
        Operator::Ln => float_fn(name, args, scope, |x| if x <= 0.0 { f64::NAN } else { x.ln() }),
        Operator::Log10 => float_fn(name, args, scope, |x| if x <= 0.0 { f64::NAN } else { x.log10() }),
        Operator::Pow => binary_numeric(name, args, scope, |a, b| {
            Numeric::Float(a.as_f64().powf(b.as_f64()))
        }),
        Operator::Log => binary_numeric(name, args, scope, |x, base| {
            let (x, base) = (x.as_f64(), base.as_f64());
            if x <= 0.0 || base <= 0.0 || base == 1.0 {
                Numeric::Float(f64::NAN)
            } else {
                Numeric::Float(x.ln() / base.ln())
            }
        }),

        // ---- trigonometric ----
        Operator::Sin => float_fn(name, args, scope, f64::sin),
        Operator::Cos => float_fn(name, args, scope, f64::cos),
        Operator::Tan => float_fn(name, args, scope, f64::tan),
        Operator::Asin => float_fn(name, args, scope, f64::asin),
        Operator::Acos => float_fn(name, args, scope, f64::acos),
        Operator::Atan => float_fn(name, args, scope, f64::atan),
        Operator::Atan2 => binary_numeric(name, args, scope, |y, x| {
            Numeric::Float(y.as_f64().atan2(x.as_f64()))
        }),
        Operator::DegreesToRadians => float_fn(name, args, scope, f64::to_radians),
        Operator::RadiansToDegrees => float_fn(name, args, scope, f64::to_degrees),

        // ---- comparison ----
        Operator::Eq
        | Operator::Ne
        | Operator::Gt
        | Operator::Gte
        | Operator::Lt
        | Operator::Lte
        | Operator::Cmp => {
            let a = evaluate(&args[0], scope)?;
            let b = evaluate(&args[1], scope)?;
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let ord = compare_values(&a, &b);
            Ok(match op {
                Operator::Eq => Value::Bool(ord.is_eq()),
                Operator::Ne => Value::Bool(ord.is_ne()),
                Operator::Gt => Value::Bool(ord.is_gt()),
                Operator::Gte => Value::Bool(ord.is_ge()),
                Operator::Lt => Value::Bool(ord.is_lt()),
                Operator::Lte => Value::Bool(ord.is_le()),
                _ => Value::from(ord as i64),
            })
        }

        // ---- logical ----
        Operator::And => {
            for arg in args {
                if !evaluate_truthy(arg, scope)? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Operator::Or => {
            for arg in args {
                if evaluate_truthy(arg, scope)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Operator::Not => Ok(Value::Bool(!evaluate_truthy(&args[0], scope)?)),

        // ---- arrays ----
        Operator::Size => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            Value::Array(items) => Ok(Value::from(items.len() as i64)),
            other => Err(expected(name, "an array", &other)),
        },
        Operator::IsArray => Ok(Value::Bool(evaluate(&args[0], scope)?.is_array())),
        Operator::ArrayElemAt => {
            let items = match array_arg(name, evaluate(&args[0], scope)?)? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let index = match evaluate(&args[1], scope)? {
                Value::Null => return Ok(Value::Null),
                v => integer(&v).ok_or_else(|| expected(name, "an integer index", &v))?,
            };
            Ok(element_at(items, index).unwrap_or(Value::Null))
        }
        Operator::First | Operator::Last => {
            let items = match array_arg(name, evaluate(&args[0], scope)?)? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let index = if op == Operator::First { 0 } else { -1 };
            Ok(element_at(items, index).unwrap_or(Value::Null))
        }
        Operator::In => {
            let needle = evaluate(&args[0], scope)?;
            match evaluate(&args[1], scope)? {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| values_equal(i, &needle)))),
                other => Err(expected(name, "an array", &other)),
            }
        }
        Operator::ConcatArrays => {
            let mut out = Vec::new();
            for value in values(args, scope)? {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::Array(items) => out.extend(items),
                    other => return Err(expected(name, "an array", &other)),
                }
            }
            Ok(Value::Array(out))
        }
        Operator::Slice => {
            let vals = values(args, scope)?;
            let items = match array_arg(name, vals[0].clone())? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let mut ints = Vec::with_capacity(2);
            for v in &vals[1..] {
                match v {
                    Value::Null => return Ok(Value::Null),
                    v => ints.push(integer(v).ok_or_else(|| expected(name, "an integer", v))?),
                }
            }
            let len = items.len() as i64;
            let (start, count) = match ints.as_slice() {
                [n] if *n >= 0 => (0, *n),
                [n] => ((len + n).max(0), -n),
                [pos, n] => {
                    if *n <= 0 {
                        return Err(AggregationError::type_mismatch(name, "count must be positive"));
                    }
                    let start = if *pos < 0 { (len + pos).max(0) } else { (*pos).min(len) };
                    (start, *n)
                }
                _ => return Err(AggregationError::arity(name, op.arity_label(), args.len())),
            };
            Ok(Value::Array(
                items.into_iter().skip(start as usize).take(count as usize).collect(),
            ))
        }
        Operator::ReverseArray => match array_arg(name, evaluate(&args[0], scope)?)? {
            Some(mut items) => {
                items.reverse();
                Ok(Value::Array(items))
            }
            None => Ok(Value::Null),
        },
        Operator::Range => {
            let vals = values(args, scope)?;
            let mut ints = Vec::with_capacity(3);
            for v in &vals {
                ints.push(integer(v).ok_or_else(|| expected(name, "an integer", v))?);
            }
            let (start, end) = (ints[0], ints[1]);
            let step = ints.get(2).copied().unwrap_or(1);
            if step == 0 {
                return Err(AggregationError::type_mismatch(name, "step must not be zero"));
            }
            let span = if step > 0 {
                (end as i128 - start as i128).max(0)
            } else {
                (start as i128 - end as i128).max(0)
            };
            let len = (span + step.unsigned_abs() as i128 - 1) / step.unsigned_abs() as i128;
            if len > MAX_RANGE_LEN as i128 {
                return Err(AggregationError::type_mismatch(
                    name,
                    format!("range of {} elements exceeds the limit of {}", len, MAX_RANGE_LEN),
                ));
            }
            let mut out = Vec::with_capacity(len as usize);
            let mut i = start;
            while (step > 0 && i < end) || (step < 0 && i > end) {
                out.push(Value::from(i));
                i = match i.checked_add(step) {
                    Some(next) => next,
                    None => break,
                };
            }
            Ok(Value::Array(out))
        }
        Operator::IndexOfArray => {
            let vals = values(args, scope)?;
            let items = match array_arg(name, vals[0].clone())? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let (start, end) = bounds(name, &vals[2..], items.len())?;
            let found = items
                .iter()
                .enumerate()
                .skip(start)
                .take(end.saturating_sub(start))
                .find(|(_, item)| values_equal(item, &vals[1]))
                .map(|(i, _)| i as i64)
                .unwrap_or(-1);
            Ok(Value::from(found))
        }
        Operator::Filter => {
            let items = match array_arg(name, evaluate(&args[0], scope)?)? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let var = variable_name(name, &args[1])?;
            let limit = match args.get(3).map(|l| evaluate(l, scope)).transpose()? {
                None | Some(Value::Null) => usize::MAX,
                Some(v) => match integer(&v) {
                    Some(n) if n >= 1 => n as usize,
                    _ => return Err(expected(name, "a positive integer limit", &v)),
                },
            };
            let mut out = Vec::new();
            for item in items {
                if out.len() >= limit {
                    break;
                }
                let bindings = [(var.clone(), item)];
                if with_bindings(scope, &bindings, |inner| evaluate_truthy(&args[2], inner))? {
                    let [(_, item)] = bindings;
                    out.push(item);
                }
            }
            Ok(Value::Array(out))
        }
        Operator::Map => {
            let items = match array_arg(name, evaluate(&args[0], scope)?)? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let var = variable_name(name, &args[1])?;
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let bindings = [(var.clone(), item)];
                out.push(with_bindings(scope, &bindings, |inner| evaluate(&args[2], inner))?);
            }
            Ok(Value::Array(out))
        }
        Operator::Reduce => {
            let items = match array_arg(name, evaluate(&args[0], scope)?)? {
                Some(items) => items,
                None => return Ok(Value::Null),
            };
            let mut acc = evaluate(&args[1], scope)?;
            for item in items {
                let bindings = [("value".to_string(), acc), ("this".to_string(), item)];
                acc = with_bindings(scope, &bindings, |inner| evaluate(&args[2], inner))?;
            }
            Ok(acc)
        }
        Operator::Sum | Operator::Avg | Operator::Min | Operator::Max => {
            let mut vals = values(args, scope)?;
            if vals.len() == 1 && vals[0].is_array() {
                if let Value::Array(items) = vals.remove(0) {
                    vals = items;
                }
            }
            Ok(match op {
                Operator::Sum => {
                    let mut sum = NumericSum::new();
                    vals.iter().for_each(|v| sum.add_value(v));
                    sum.total().into_value()
                }
                Operator::Avg => {
                    let mut sum = NumericSum::new();
                    vals.iter().for_each(|v| sum.add_value(v));
                    sum.average().map(float_value).unwrap_or(Value::Null)
                }
                Operator::Min => vals
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .min_by(compare_values)
                    .unwrap_or(Value::Null),
                _ => vals
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .max_by(compare_values)
                    .unwrap_or(Value::Null),
            })
        }

        // ---- strings ----
        Operator::Concat => {
            let mut out = String::new();
            for value in values(args, scope)? {
                match value {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => return Err(expected(name, "a string", &other)),
                }
            }
            Ok(Value::String(out))
        }
        Operator::ToUpper | Operator::ToLower => {
            let s = string_or_empty(name, evaluate(&args[0], scope)?)?;
            Ok(Value::String(if op == Operator::ToUpper {
                s.to_ascii_uppercase()
            } else {
                s.to_ascii_lowercase()
            }))
        }
        Operator::Substr | Operator::SubstrCP => {
            let vals = values(args, scope)?;
            let s = string_or_empty(name, vals[0].clone())?;
            let start = non_negative(name, &vals[1])?;
            let len = non_negative(name, &vals[2])?;
            Ok(Value::String(s.chars().skip(start).take(len).collect()))
        }
        Operator::StrLenCP => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            other => Err(expected(name, "a string", &other)),
        },
        Operator::Trim | Operator::Ltrim | Operator::Rtrim => {
            let vals = values(args, scope)?;
            let s = match &vals[0] {
                Value::Null => return Ok(Value::Null),
                Value::String(s) => s,
                other => return Err(expected(name, "a string", other)),
            };
            let chars: Vec<char> = match vals.get(1) {
                None => DEFAULT_TRIM_CHARS.chars().collect(),
                Some(Value::Null) => return Ok(Value::Null),
                Some(Value::String(c)) => c.chars().collect(),
                Some(other) => return Err(expected(name, "a string of characters", other)),
            };
            let trimmed = match op {
                Operator::Trim => s.trim_matches(chars.as_slice()),
                Operator::Ltrim => s.trim_start_matches(chars.as_slice()),
                _ => s.trim_end_matches(chars.as_slice()),
            };
            Ok(Value::String(trimmed.to_string()))
        }
        Operator::Split => {
            let vals = values(args, scope)?;
            match (&vals[0], &vals[1]) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::String(s), Value::String(d)) => {
                    if d.is_empty() {
                        return Err(AggregationError::type_mismatch(name, "delimiter must not be empty"));
                    }
                    Ok(Value::Array(s.split(d.as_str()).map(Value::from).collect()))
                }
                (Value::String(_), other) | (other, _) => Err(expected(name, "a string", other)),
            }
        }
        Operator::IndexOfCP => {
            let vals = values(args, scope)?;
            let (s, sub) = match (&vals[0], &vals[1]) {
                (Value::Null, _) => return Ok(Value::Null),
                (Value::String(s), Value::String(sub)) => (s, sub),
                (Value::String(_), other) | (other, _) => return Err(expected(name, "a string", other)),
            };
            let chars: Vec<char> = s.chars().collect();
            let needle: Vec<char> = sub.chars().collect();
            let (start, end) = bounds(name, &vals[2..], chars.len())?;
            if start > end {
                return Ok(Value::from(-1));
            }
            let window = &chars[start..end];
            let found = if needle.is_empty() {
                Some(0)
            } else {
                window.windows(needle.len()).position(|w| w == needle.as_slice())
            };
            Ok(Value::from(found.map(|i| (i + start) as i64).unwrap_or(-1)))
        }
        Operator::Strcasecmp => {
            let a = string_or_empty(name, evaluate(&args[0], scope)?)?.to_ascii_lowercase();
            let b = string_or_empty(name, evaluate(&args[1], scope)?)?.to_ascii_lowercase();
            Ok(Value::from(a.as_bytes().cmp(b.as_bytes()) as i64))
        }
        Operator::RegexMatch => {
            let vals = values(args, scope)?;
            let input = match &vals[0] {
                Value::Null => return Ok(Value::Bool(false)),
                Value::String(s) => s,
                other => return Err(expected(name, "a string", other)),
            };
            let pattern = match &vals[1] {
                Value::String(p) => p,
                other => return Err(expected(name, "a string pattern", other)),
            };
            let options = match vals.get(2) {
                None | Some(Value::Null) => "",
                Some(Value::String(o)) => o.as_str(),
                Some(other) => return Err(expected(name, "a string of options", other)),
            };
            Ok(Value::Bool(regex_is_match(pattern, options, input)?))
        }
        Operator::ReplaceAll => {
            let vals = values(args, scope)?;
            let mut strings = Vec::with_capacity(3);
            for v in &vals {
                match v {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => strings.push(s.as_str()),
                    other => return Err(expected(name, "a string", other)),
                }
            }
            if strings[1].is_empty() {
                return Ok(Value::String(strings[0].to_string()));
            }
            Ok(Value::String(strings[0].replace(strings[1], strings[2])))
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
            use chrono::{Datelike, Timelike};
            let d = match date_arg(name, evaluate(&args[0], scope)?)? {
                Some(d) => d,
                None => return Ok(Value::Null),
            };
            let part = match op {
                Operator::Year => d.year() as i64,
                Operator::Month => d.month() as i64,
                Operator::DayOfMonth => d.day() as i64,
                Operator::Hour => d.hour() as i64,
                Operator::Minute => d.minute() as i64,
                Operator::Second => d.second() as i64,
                Operator::DayOfWeek => date::day_of_week(&d) as i64,
                _ => d.ordinal() as i64,
            };
            Ok(Value::from(part))
        }
        Operator::DateAdd | Operator::DateSubtract => {
            let vals = values(args, scope)?;
            let unit = unit_arg(name, &vals[1])?;
            let start = match date_arg(name, vals[0].clone())? {
                Some(d) => d,
                None => return Ok(Value::Null),
            };
            let amount = match &vals[2] {
                Value::Null => return Ok(Value::Null),
                v => integer(v).ok_or_else(|| expected(name, "an integer amount", v))?,
            };
            let amount = if op == Operator::DateSubtract {
                match amount.checked_neg() {
                    Some(a) => a,
                    None => return Ok(Value::Null),
                }
            } else {
                amount
            };
            Ok(date::add_to_date(&start, unit, amount)
                .map(|d| Value::String(date::format_date(&d)))
                .unwrap_or(Value::Null))
        }
        Operator::DateDiff => {
            let vals = values(args, scope)?;
            let unit = unit_arg(name, &vals[2])?;
            let start = date_arg(name, vals[0].clone())?;
            let end = date_arg(name, vals[1].clone())?;
            match (start, end) {
                (Some(start), Some(end)) => Ok(Value::from(date::date_diff(&start, &end, unit))),
                _ => Ok(Value::Null),
            }
        }
        Operator::DateToString => {
            let vals = values(args, scope)?;
            let format = match vals.get(1) {
                None | Some(Value::Null) => "%Y-%m-%dT%H:%M:%S.%LZ",
                Some(Value::String(f)) => f.as_str(),
                Some(other) => return Err(expected(name, "a format string", other)),
            };
            match date_arg(name, vals[0].clone())? {
                Some(d) => date::format_with(&d, format).map(Value::String).map_err(|spec| {
                    AggregationError::invalid_expression(format!(
                        "{}: unsupported format specifier '{}'",
                        name, spec
                    ))
                }),
                None => Ok(Value::Null),
            }
        }

        // ---- objects ----
        Operator::MergeObjects => {
            let mut vals = values(args, scope)?;
            if vals.len() == 1 && vals[0].is_array() {
                if let Value::Array(items) = vals.remove(0) {
                    vals = items;
                }
            }
            let mut out = Map::new();
            for value in vals {
                match value {
                    Value::Null => {}
                    Value::Object(map) => {
                        for (k, v) in map {
                            out.insert(k, v);
                        }
                    }
                    other => return Err(expected(name, "an object", &other)),
                }
            }
            Ok(Value::Object(out))
        }
        Operator::GetField => {
            let field = match evaluate(&args[0], scope)? {
                Value::String(f) => f,
                other => return Err(expected(name, "a field name string", &other)),
            };
            let input = match args.get(1) {
                Some(expr) => evaluate(expr, scope)?,
                None => scope.current.clone(),
            };
            match input {
                Value::Null => Ok(Value::Null),
                Value::Object(map) => Ok(map.get(&field).cloned().unwrap_or(Value::Null)),
                other => Err(expected(name, "an object", &other)),
            }
        }
        Operator::ObjectToArray => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            Value::Object(map) => Ok(Value::Array(
                map.into_iter()
                    .map(|(k, v)| {
                        let mut pair = Map::new();
                        pair.insert("k".to_string(), Value::String(k));
                        pair.insert("v".to_string(), v);
                        Value::Object(pair)
                    })
                    .collect(),
            )),
            other => Err(expected(name, "an object", &other)),
        },

        // ---- type conversion ----
        Operator::ToString => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::String(s)),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            n @ Value::Number(_) => Ok(Value::String(n.to_string())),
            other => Err(expected(name, "a scalar", &other)),
        },
        Operator::ToInt | Operator::ToLong => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(Value::from(b as i64)),
            v @ Value::Number(_) => match numeric(&v) {
                Some(Numeric::Int(i)) => Ok(Value::from(i)),
                Some(Numeric::Float(f)) => Ok(Value::from(f.trunc() as i64)),
                None => Ok(Value::Null),
            },
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| AggregationError::type_mismatch(name, format!("cannot convert '{}'", s))),
            other => Err(expected(name, "a convertible value", &other)),
        },
        Operator::ToDouble => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            Value::Bool(b) => Ok(float_value(if b { 1.0 } else { 0.0 })),
            v @ Value::Number(_) => Ok(numeric(&v).map(|n| float_value(n.as_f64())).unwrap_or(Value::Null)),
            Value::String(s) => match s.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(float_value(f)),
                _ => Err(AggregationError::type_mismatch(name, format!("cannot convert '{}'", s))),
            },
            other => Err(expected(name, "a convertible value", &other)),
        },
        Operator::ToBool => match evaluate(&args[0], scope)? {
            Value::Null => Ok(Value::Null),
            v => Ok(Value::Bool(is_truthy(&v))),
        },
        Operator::Type => Ok(Value::from(type_name(&evaluate(&args[0], scope)?))),
        Operator::IsNumber => Ok(Value::Bool(evaluate(&args[0], scope)?.is_number())),

        // Handled in `eval`
        Operator::Cond | Operator::IfNull | Operator::Switch | Operator::Let => {
            evaluate(&Expression::Operator(op, args.to_vec()), scope)
        }
    }
}

// ---- helpers ----

fn expected(op: &str, what: &str, got: &Value) -> AggregationError {
    AggregationError::type_mismatch(op, format!("expected {}, got {}", what, type_name(got)))
}

/// Numeric operands; `Ok(None)` when any is null, an error for non-numbers
fn numbers(op: &str, vals: &[Value]) -> AggregationResult<Option<Vec<Numeric>>> {
    let mut out = Vec::with_capacity(vals.len());
    let mut saw_null = false;
    for v in vals {
        match v {
            Value::Null => saw_null = true,
            other => out.push(numeric(other).ok_or_else(|| expected(op, "a number", other))?),
        }
    }
    Ok(if saw_null { None } else { Some(out) })
}

fn add_numeric(a: Numeric, b: Numeric) -> Numeric {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x
            .checked_add(y)
            .map(Numeric::Int)
            .unwrap_or(Numeric::Float(x as f64 + y as f64)),
        _ => Numeric::Float(a.as_f64() + b.as_f64()),
    }
}

fn multiply_numeric(a: Numeric, b: Numeric) -> Numeric {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => x
            .checked_mul(y)
            .map(Numeric::Int)
            .unwrap_or(Numeric::Float(x as f64 * y as f64)),
        _ => Numeric::Float(a.as_f64() * b.as_f64()),
    }
}

fn map_float(n: Numeric, f: fn(f64) -> f64) -> Numeric {
    match n {
        Numeric::Int(i) => Numeric::Int(i),
        Numeric::Float(x) => Numeric::Float(f(x)),
    }
}

/// Rounds half away from zero, keeping integers integral
fn round_numeric(n: Numeric, places: i32) -> Numeric {
    match n {
        Numeric::Int(i) if places >= 0 => Numeric::Int(i),
        Numeric::Int(i) => {
            let factor = 10i64.checked_pow((-places) as u32);
            match factor {
                Some(f) => {
                    let rem = i % f;
                    let base = i - rem;
                    let rounded = if rem.abs() * 2 >= f {
                        base.checked_add(f * i.signum())
                    } else {
                        Some(base)
                    };
                    rounded.map(Numeric::Int).unwrap_or(Numeric::Float(i as f64))
                }
                None => Numeric::Int(0),
            }
        }
        Numeric::Float(x) => Numeric::Float(round_float(x, places)),
    }
}

/// Float rounding as the embedded engine's `round()` does it
pub fn round_float(x: f64, places: i32) -> f64 {
    const LIMIT: f64 = 9.223_372_036_854_775e18;
    if places == 0 {
        if x >= 0.0 && x < LIMIT {
            return ((x + 0.5) as i64) as f64;
        }
        if x < 0.0 && -x < LIMIT {
            return -(((-x + 0.5) as i64) as f64);
        }
        return x;
    }
    if places < 0 {
        let factor = 10f64.powi(-places);
        return round_float(x / factor, 0) * factor;
    }
    format!("{:.*}", places as usize, x).parse().unwrap_or(x)
}

fn trunc_numeric(n: Numeric, places: i32) -> Numeric {
    match n {
        Numeric::Int(i) if places >= 0 => Numeric::Int(i),
        Numeric::Int(i) => match 10i64.checked_pow((-places) as u32) {
            Some(f) => Numeric::Int(i - i % f),
            None => Numeric::Int(0),
        },
        Numeric::Float(x) => {
            let factor = 10f64.powi(places);
            Numeric::Float((x * factor).trunc() / factor)
        }
    }
}

fn unary_numeric(
    op: &str,
    args: &[Expression],
    scope: &Scope<'_>,
    f: impl Fn(Numeric) -> Numeric,
) -> AggregationResult<Value> {
    match numbers(op, &values(args, scope)?)? {
        Some(nums) => Ok(f(nums[0]).into_value()),
        None => Ok(Value::Null),
    }
}

fn binary_numeric(
    op: &str,
    args: &[Expression],
    scope: &Scope<'_>,
    f: impl Fn(Numeric, Numeric) -> Numeric,
) -> AggregationResult<Value> {
    match numbers(op, &values(args, scope)?)? {
        Some(nums) => Ok(f(nums[0], nums[1]).into_value()),
        None => Ok(Value::Null),
    }
}

fn float_fn(
    op: &str,
    args: &[Expression],
    scope: &Scope<'_>,
    f: impl Fn(f64) -> f64,
) -> AggregationResult<Value> {
    unary_numeric(op, args, scope, |n| Numeric::Float(f(n.as_f64())))
}

/// Integer value of a number with no fractional part
fn integer(v: &Value) -> Option<i64> {
    match numeric(v)? {
        Numeric::Int(i) => Some(i),
        Numeric::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => Some(f as i64),
        Numeric::Float(_) => None,
    }
}

fn non_negative(op: &str, v: &Value) -> AggregationResult<usize> {
    match integer(v) {
        Some(i) if i >= 0 => Ok(i as usize),
        _ => Err(expected(op, "a non-negative integer", v)),
    }
}

/// Optional `[start, end)` bounds for index searches
fn bounds(op: &str, vals: &[Value], len: usize) -> AggregationResult<(usize, usize)> {
    let start = match vals.first() {
        Some(v) => non_negative(op, v)?.min(len),
        None => 0,
    };
    let end = match vals.get(1) {
        Some(v) => non_negative(op, v)?.min(len),
        None => len,
    };
    Ok((start, end))
}

fn array_arg(op: &str, value: Value) -> AggregationResult<Option<Vec<Value>>> {
    match value {
        Value::Null => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        other => Err(expected(op, "an array", &other)),
    }
}

fn element_at(mut items: Vec<Value>, index: i64) -> Option<Value> {
    let len = items.len() as i64;
    let i = if index < 0 { len + index } else { index };
    if i < 0 || i >= len {
        return None;
    }
    Some(items.swap_remove(i as usize))
}

fn string_or_empty(op: &str, value: Value) -> AggregationResult<String> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        other => Err(expected(op, "a string", &other)),
    }
}

fn date_arg(op: &str, value: Value) -> AggregationResult<Option<chrono::DateTime<chrono::Utc>>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(date::parse_date(&s)),
        other => Err(expected(op, "a date string", &other)),
    }
}

fn unit_arg(op: &str, value: &Value) -> AggregationResult<DateUnit> {
    match value {
        Value::String(s) => DateUnit::parse(s).ok_or_else(|| {
            AggregationError::invalid_expression(format!("{}: unknown unit '{}'", op, s))
        }),
        other => Err(expected(op, "a unit string", other)),
    }
}

fn variable_name(op: &str, expr: &Expression) -> AggregationResult<String> {
    match expr {
        Expression::Literal(Value::String(name)) if !name.is_empty() => Ok(name.clone()),
        _ => Err(AggregationError::invalid_expression(format!(
            "{}: 'as' must be a variable name",
            op
        ))),
    }
}

fn with_bindings<T>(
    scope: &Scope<'_>,
    bindings: &[(String, Value)],
    f: impl FnOnce(&Scope<'_>) -> AggregationResult<T>,
) -> AggregationResult<T> {
    let frame = Frame {
        bindings,
        parent: scope.frame,
    };
    let inner = Scope {
        root: scope.root,
        current: scope.current,
        frame: Some(&frame),
    };
    f(&inner)
}

thread_local! {
    static REGEX_CACHE: RefCell<HashMap<(String, String), Regex>> = RefCell::new(HashMap::new());
}

/// Matches with a per-thread cache of compiled patterns
pub fn regex_is_match(pattern: &str, options: &str, input: &str) -> AggregationResult<bool> {
    REGEX_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let key = (pattern.to_string(), options.to_string());
        if !cache.contains_key(&key) {
            let regex = compile_pattern(pattern, options).map_err(|e| {
                AggregationError::invalid_expression(format!("invalid regex '{}': {}", pattern, e))
            })?;
            cache.insert(key.clone(), regex);
        }
        Ok(cache.get(&key).map(|re| re.is_match(input)).unwrap_or(false))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AggregationErrorCode;
    use crate::expression::parse_expression;
    use serde_json::json;

    fn eval_on(expr: Value, doc: Value) -> AggregationResult<Value> {
        let expr = parse_expression(&expr)?;
        evaluate(&expr, &Scope::for_document(&doc))
    }

    fn ok(expr: Value, doc: Value) -> Value {
        eval_on(expr, doc).unwrap()
    }

    fn code(expr: Value, doc: Value) -> AggregationErrorCode {
        eval_on(expr, doc).unwrap_err().code()
    }

    #[test]
    fn test_arithmetic_keeps_integers() {
        assert_eq!(ok(json!({"$add": ["$a", 2]}), json!({"a": 3})), json!(5));
        assert_eq!(ok(json!({"$multiply": ["$a", 1.5]}), json!({"a": 2})), json!(3.0));
        assert_eq!(ok(json!({"$subtract": [10, "$a"]}), json!({"a": 4})), json!(6));
    }

    #[test]
    fn test_arithmetic_null_propagation() {
        assert_eq!(ok(json!({"$add": ["$missing", 1]}), json!({})), json!(null));
        assert_eq!(ok(json!({"$multiply": [null, 2]}), json!({})), json!(null));
    }

    #[test]
    fn test_arithmetic_type_mismatch() {
        assert_eq!(
            code(json!({"$add": ["$a", 1]}), json!({"a": "x"})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
        // A null operand does not hide a type error
        assert_eq!(
            code(json!({"$add": [null, "x"]}), json!({})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
    }

    #[test]
    fn test_divide_and_mod_by_zero_are_null() {
        assert_eq!(ok(json!({"$divide": [1, 0]}), json!({})), json!(null));
        assert_eq!(ok(json!({"$divide": [1, 4]}), json!({})), json!(0.25));
        assert_eq!(ok(json!({"$mod": [7, 0]}), json!({})), json!(null));
        assert_eq!(ok(json!({"$mod": [-7, 3]}), json!({})), json!(-1));
    }

    #[test]
    fn test_overflow_and_infinity() {
        assert_eq!(
            ok(json!({"$add": [i64::MAX, 1]}), json!({})),
            json!(i64::MAX as f64 + 1.0)
        );
        assert_eq!(ok(json!({"$multiply": [1e308, 10]}), json!({})), json!(null));
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(ok(json!({"$round": [2.5]}), json!({})), json!(3.0));
        assert_eq!(ok(json!({"$round": [-2.5]}), json!({})), json!(-3.0));
        assert_eq!(ok(json!({"$round": [2.456, 2]}), json!({})), json!(2.46));
        assert_eq!(ok(json!({"$round": [7]}), json!({})), json!(7));
        assert_eq!(ok(json!({"$round": [1250, -2]}), json!({})), json!(1300));
    }

    #[test]
    fn test_arity_is_checked_lazily() {
        assert_eq!(
            code(json!({"$divide": [1, 2, 3]}), json!({})),
            AggregationErrorCode::AeroExprArity
        );
        // Not evaluated: no error
        assert_eq!(
            ok(json!({"$cond": [true, 1, {"$divide": [1]}]}), json!({})),
            json!(1)
        );
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(ok(json!({"$gt": ["$a", 1]}), json!({"a": 2})), json!(true));
        assert_eq!(ok(json!({"$eq": [1, 1.0]}), json!({})), json!(true));
        assert_eq!(ok(json!({"$lt": ["$a", 5]}), json!({})), json!(null));
        assert_eq!(ok(json!({"$cmp": ["b", "a"]}), json!({})), json!(1));
        // Numbers sort before strings
        assert_eq!(ok(json!({"$lt": [100, "a"]}), json!({})), json!(true));
    }

    #[test]
    fn test_logic_truthiness() {
        assert_eq!(ok(json!({"$and": []}), json!({})), json!(true));
        assert_eq!(ok(json!({"$or": []}), json!({})), json!(false));
        assert_eq!(ok(json!({"$and": [1, "$missing"]}), json!({})), json!(false));
        assert_eq!(ok(json!({"$not": [0]}), json!({})), json!(true));
    }

    #[test]
    fn test_conditionals() {
        assert_eq!(
            ok(json!({"$cond": {"if": {"$gte": ["$a", 10]}, "then": "hi", "else": "lo"}}), json!({"a": 12})),
            json!("hi")
        );
        assert_eq!(ok(json!({"$ifNull": ["$a", "$b", 0]}), json!({"b": 2})), json!(2));
        assert_eq!(
            ok(
                json!({"$switch": {"branches": [{"case": {"$eq": ["$a", 1]}, "then": "one"}], "default": "other"}}),
                json!({"a": 2})
            ),
            json!("other")
        );
    }

    #[test]
    fn test_remove_only_at_field_level() {
        let doc = json!({"a": 1});
        let expr = parse_expression(&json!({"$cond": [true, "$$REMOVE", 1]})).unwrap();
        assert_eq!(evaluate_field(&expr, &Scope::for_document(&doc)).unwrap(), None);

        let expr = parse_expression(&json!({"$ifNull": ["$$REMOVE", 5]})).unwrap();
        assert_eq!(evaluate(&expr, &Scope::for_document(&doc)).unwrap(), json!(5));
    }

    #[test]
    fn test_array_operators() {
        let doc = json!({"xs": [3, 1, 2]});
        assert_eq!(ok(json!({"$size": "$xs"}), doc.clone()), json!(3));
        assert_eq!(ok(json!({"$arrayElemAt": ["$xs", -1]}), doc.clone()), json!(2));
        assert_eq!(ok(json!({"$arrayElemAt": ["$xs", 9]}), doc.clone()), json!(null));
        assert_eq!(ok(json!({"$in": [1, "$xs"]}), doc.clone()), json!(true));
        assert_eq!(ok(json!({"$slice": ["$xs", -2]}), doc.clone()), json!([1, 2]));
        assert_eq!(ok(json!({"$sum": "$xs"}), doc.clone()), json!(6));
        assert_eq!(ok(json!({"$max": "$xs"}), doc.clone()), json!(3));
        assert_eq!(ok(json!({"$range": [0, 5, 2]}), doc.clone()), json!([0, 2, 4]));
        assert_eq!(
            code(json!({"$size": "$xs.0"}), json!({"xs": {"0": 5}})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
    }

    #[test]
    fn test_range_is_bounded() {
        assert_eq!(ok(json!({"$range": [5, 0, -2]}), json!({})), json!([5, 3, 1]));
        assert_eq!(ok(json!({"$range": [3, 3]}), json!({})), json!([]));

        let limit = MAX_RANGE_LEN as i64;
        assert_eq!(
            ok(json!({"$size": {"$range": [0, limit]}}), json!({})),
            json!(limit)
        );
        assert_eq!(
            code(json!({"$range": [0, limit + 1]}), json!({})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
        assert_eq!(
            code(json!({"$range": [0, 1_000_000_000_000i64]}), json!({})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
        assert_eq!(
            code(json!({"$range": [i64::MAX, i64::MIN, -1]}), json!({})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
    }

    #[test]
    fn test_binding_operators() {
        let doc = json!({"xs": [1, 2, 3, 4]});
        assert_eq!(
            ok(json!({"$map": {"input": "$xs", "as": "x", "in": {"$multiply": ["$$x", 10]}}}), doc.clone()),
            json!([10, 20, 30, 40])
        );
        assert_eq!(
            ok(json!({"$filter": {"input": "$xs", "cond": {"$gt": ["$$this", 2]}}}), doc.clone()),
            json!([3, 4])
        );
        assert_eq!(
            ok(
                json!({"$reduce": {"input": "$xs", "initialValue": 0, "in": {"$add": ["$$value", "$$this"]}}}),
                doc.clone()
            ),
            json!(10)
        );
        assert_eq!(
            ok(json!({"$let": {"vars": {"k": 5}, "in": {"$add": ["$$k", 1]}}}), doc),
            json!(6)
        );
    }

    #[test]
    fn test_undefined_variable() {
        assert_eq!(code(json!("$$nope"), json!({})), AggregationErrorCode::AeroExprInvalid);
    }

    #[test]
    fn test_string_operators() {
        assert_eq!(ok(json!({"$concat": ["a", "$b"]}), json!({"b": "c"})), json!("ac"));
        assert_eq!(ok(json!({"$concat": ["a", "$missing"]}), json!({})), json!(null));
        assert_eq!(ok(json!({"$toUpper": "$missing"}), json!({})), json!(""));
        assert_eq!(ok(json!({"$substrCP": ["héllo", 1, 3]}), json!({})), json!("éll"));
        assert_eq!(ok(json!({"$strLenCP": "héllo"}), json!({})), json!(5));
        assert_eq!(ok(json!({"$trim": {"input": "  x \n"}}), json!({})), json!("x"));
        assert_eq!(ok(json!({"$split": ["a,b", ","]}), json!({})), json!(["a", "b"]));
        assert_eq!(ok(json!({"$indexOfCP": ["hello", "l"]}), json!({})), json!(2));
        assert_eq!(ok(json!({"$strcasecmp": ["ABC", "abc"]}), json!({})), json!(0));
        assert_eq!(
            ok(json!({"$regexMatch": {"input": "Hello", "regex": "^h", "options": "i"}}), json!({})),
            json!(true)
        );
        assert_eq!(ok(json!({"$regexMatch": {"input": "$missing", "regex": "x"}}), json!({})), json!(false));
        assert_eq!(
            ok(json!({"$replaceAll": {"input": "a-b-c", "find": "-", "replacement": "+"}}), json!({})),
            json!("a+b+c")
        );
    }

    #[test]
    fn test_date_operators() {
        let doc = json!({"d": "2024-03-15T10:20:30Z"});
        assert_eq!(ok(json!({"$year": "$d"}), doc.clone()), json!(2024));
        assert_eq!(ok(json!({"$month": "$d"}), doc.clone()), json!(3));
        assert_eq!(ok(json!({"$dayOfWeek": "$d"}), doc.clone()), json!(6));
        assert_eq!(ok(json!({"$dayOfYear": "$d"}), doc.clone()), json!(75));
        assert_eq!(
            ok(json!({"$dateAdd": {"startDate": "$d", "unit": "day", "amount": 20}}), doc.clone()),
            json!("2024-04-04T10:20:30.000Z")
        );
        assert_eq!(ok(json!({"$year": "garbage"}), doc.clone()), json!(null));
        assert_eq!(
            code(json!({"$year": 5}), doc),
            AggregationErrorCode::AeroExprTypeMismatch
        );
    }

    #[test]
    fn test_type_operators() {
        assert_eq!(ok(json!({"$type": "$missing"}), json!({})), json!("null"));
        assert_eq!(ok(json!({"$type": 1.5}), json!({})), json!("double"));
        assert_eq!(ok(json!({"$toInt": "42"}), json!({})), json!(42));
        assert_eq!(ok(json!({"$toInt": 4.9}), json!({})), json!(4));
        assert_eq!(ok(json!({"$toDouble": true}), json!({})), json!(1.0));
        assert_eq!(ok(json!({"$toString": 12}), json!({})), json!("12"));
        assert_eq!(ok(json!({"$toBool": 0}), json!({})), json!(false));
        assert_eq!(
            code(json!({"$toInt": "4x"}), json!({})),
            AggregationErrorCode::AeroExprTypeMismatch
        );
    }

    #[test]
    fn test_object_operators() {
        assert_eq!(
            ok(json!({"$mergeObjects": ["$a", {"y": 2}, null]}), json!({"a": {"x": 1}})),
            json!({"x": 1, "y": 2})
        );
        assert_eq!(ok(json!({"$getField": "a.b"}), json!({"a.b": 7})), json!(7));
        assert_eq!(
            ok(json!({"$objectToArray": {"k": 1}}), json!({})),
            json!([{"k": "k", "v": 1}])
        );
    }

    #[test]
    fn test_root_and_current() {
        let root = json!({"a": 1});
        let current = json!({"a": 2});
        let expr = parse_expression(&json!({"$add": ["$$ROOT.a", "$a"]})).unwrap();
        assert_eq!(evaluate(&expr, &Scope::new(&root, &current)).unwrap(), json!(3));
    }

    #[test]
    fn test_object_literal_missing_is_null() {
        assert_eq!(ok(json!({"x": "$missing"}), json!({})), json!({"x": null}));
    }
}
