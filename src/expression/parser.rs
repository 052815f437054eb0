//! JSON to [`Expression`] parsing
//!
//! - `"$a.b"` is a field reference, `"$$NAME.a"` a variable reference
//! - `{"$op": ...}` is an operator; a non-array argument is a single argument
//! - object-form arguments (`{"$cond": {"if": .., "then": .., "else": ..}}`)
//!   are normalized to positional order
//! - `{"$literal": v}` becomes a constant without further parsing
//! - any other object is an object literal; mixing `$` keys with plain keys
//!   is invalid

use serde_json::{Map, Value};

use crate::errors::{AggregationError, AggregationResult};
use crate::value::FieldPath;

use super::ast::{Expression, Variable};
use super::operators::Operator;

/// Parses an aggregation expression
pub fn parse_expression(value: &Value) -> AggregationResult<Expression> {
    match value {
        Value::String(s) => parse_string(s),
        Value::Array(items) => Ok(Expression::Array(
            items
                .iter()
                .map(parse_expression)
                .collect::<AggregationResult<_>>()?,
        )),
        Value::Object(map) => parse_object(map),
        other => Ok(Expression::Literal(other.clone())),
    }
}

fn parse_string(s: &str) -> AggregationResult<Expression> {
    if let Some(rest) = s.strip_prefix("$$") {
        let (name, path) = match rest.split_once('.') {
            Some((name, path)) => (name, Some(FieldPath::parse(path)?)),
            None => (rest, None),
        };
        let variable = match name {
            "ROOT" => Variable::Root,
            "CURRENT" => Variable::Current,
            "REMOVE" if path.is_none() => Variable::Remove,
            "REMOVE" => {
                return Err(AggregationError::invalid_expression(
                    "$$REMOVE does not take a path",
                ))
            }
            "" => return Err(AggregationError::invalid_expression("empty variable name")),
            other => {
                if !other.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    return Err(AggregationError::invalid_expression(format!(
                        "invalid variable name '{}'",
                        other
                    )));
                }
                Variable::User(other.to_string())
            }
        };
        return Ok(Expression::Variable(variable, path));
    }

    if let Some(path) = s.strip_prefix('$') {
        return Ok(Expression::FieldRef(FieldPath::parse(path)?));
    }

    Ok(Expression::Literal(Value::String(s.to_string())))
}

fn parse_object(map: &Map<String, Value>) -> AggregationResult<Expression> {
    let operator_keys = map.keys().filter(|k| k.starts_with('$')).count();

    if operator_keys == 0 {
        let fields = map
            .iter()
            .map(|(k, v)| Ok((k.clone(), parse_expression(v)?)))
            .collect::<AggregationResult<_>>()?;
        return Ok(Expression::Object(fields));
    }

    if map.len() != 1 {
        return Err(AggregationError::invalid_expression(
            "an operator object must have exactly one key",
        ));
    }

    // Exactly one key, and it is an operator
    let (name, argument) = match map.iter().next() {
        Some(entry) => entry,
        None => return Err(AggregationError::invalid_expression("empty operator object")),
    };

    if name == "$literal" {
        return Ok(Expression::Literal(argument.clone()));
    }

    let operator = Operator::from_name(name).ok_or_else(|| {
        AggregationError::invalid_expression(format!("unknown operator '{}'", name))
    })?;

    let args = parse_arguments(operator, argument)?;
    Ok(Expression::Operator(operator, args))
}

fn parse_arguments(operator: Operator, argument: &Value) -> AggregationResult<Vec<Expression>> {
    match (operator, argument) {
        (Operator::Switch, Value::Object(spec)) => parse_switch(spec),
        (Operator::Let, Value::Object(spec)) => parse_let(spec),
        (Operator::GetField, Value::String(field)) => {
            Ok(vec![Expression::Literal(Value::String(field.clone()))])
        }
        (op, Value::Object(spec)) if op.named_params().is_some() && !is_expression_object(spec) => {
            parse_named(op, spec)
        }
        (_, Value::Array(items)) => items.iter().map(parse_expression).collect(),
        (_, single) => Ok(vec![parse_expression(single)?]),
    }
}

/// An object argument is an expression (not named parameters) when it is
/// itself an operator, e.g. `{"$year": {"$toDate": ..}}`
fn is_expression_object(spec: &Map<String, Value>) -> bool {
    spec.len() == 1 && spec.keys().all(|k| k.starts_with('$'))
}

fn parse_named(operator: Operator, spec: &Map<String, Value>) -> AggregationResult<Vec<Expression>> {
    let params = operator.named_params().unwrap_or(&[]);

    for key in spec.keys() {
        // `timezone` is accepted and ignored: dates are always UTC
        if !params.contains(&key.as_str()) && key != "timezone" {
            return Err(AggregationError::invalid_expression(format!(
                "{}: unknown parameter '{}'",
                operator, key
            )));
        }
    }

    let mut args = Vec::with_capacity(params.len());
    for (position, param) in params.iter().enumerate() {
        match spec.get(*param) {
            Some(value) => {
                // `as` names a variable; keep it as a literal
                if *param == "as" {
                    args.push(Expression::Literal(value.clone()));
                } else {
                    args.push(parse_expression(value)?);
                }
            }
            None if *param == "as" => args.push(Expression::Literal(Value::from("this"))),
            None => {
                // Trailing optional parameters may be omitted; gaps may not
                if params[position..].iter().any(|p| spec.contains_key(*p)) {
                    return Err(AggregationError::invalid_expression(format!(
                        "{}: missing parameter '{}'",
                        operator, param
                    )));
                }
                break;
            }
        }
    }
    Ok(args)
}

fn parse_switch(spec: &Map<String, Value>) -> AggregationResult<Vec<Expression>> {
    let branches = match spec.get("branches") {
        Some(Value::Array(branches)) => branches,
        _ => {
            return Err(AggregationError::invalid_expression(
                "$switch requires a 'branches' array",
            ))
        }
    };

    let mut args = Vec::with_capacity(branches.len() * 2 + 1);
    for branch in branches {
        let (case, then) = match branch {
            Value::Object(b) => match (b.get("case"), b.get("then")) {
                (Some(case), Some(then)) if b.len() == 2 => (case, then),
                _ => {
                    return Err(AggregationError::invalid_expression(
                        "$switch branch requires exactly 'case' and 'then'",
                    ))
                }
            },
            _ => {
                return Err(AggregationError::invalid_expression(
                    "$switch branch must be an object",
                ))
            }
        };
        args.push(parse_expression(case)?);
        args.push(parse_expression(then)?);
    }

    if let Some(default) = spec.get("default") {
        args.push(parse_expression(default)?);
    }
    Ok(args)
}

fn parse_let(spec: &Map<String, Value>) -> AggregationResult<Vec<Expression>> {
    let vars = match spec.get("vars") {
        Some(Value::Object(vars)) => vars,
        _ => return Err(AggregationError::invalid_expression("$let requires a 'vars' object")),
    };
    let body = spec
        .get("in")
        .ok_or_else(|| AggregationError::invalid_expression("$let requires 'in'"))?;

    let mut bindings = Vec::with_capacity(vars.len());
    for (name, value) in vars {
        if name.starts_with('$') || name == "ROOT" || name == "CURRENT" || name == "REMOVE" {
            return Err(AggregationError::invalid_expression(format!(
                "$let: cannot bind variable '{}'",
                name
            )));
        }
        bindings.push((name.clone(), parse_expression(value)?));
    }

    Ok(vec![Expression::Object(bindings), parse_expression(body)?])
}
