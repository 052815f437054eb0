//! JSON to [`Pipeline`] parsing
//!
//! Every structural problem is reported as `AERO_PIPELINE_INVALID`; nothing
//! here depends on which tier will run the pipeline.

use serde_json::{Map, Value};

use crate::errors::{AggregationError, AggregationResult};
use crate::expression::{parse_expression, Expression};
use crate::value::{FieldPath, ID_FIELD};

use super::filter::FilterExpr;
use super::stage::{
    Accumulator, AccumulatorOp, GroupSpec, LookupSpec, ProjectField, ProjectMode, ProjectSpec,
    SortDirection, Stage, StageKind, UnwindSpec,
};
use super::Pipeline;

fn invalid(reason: impl Into<String>) -> AggregationError {
    AggregationError::invalid_pipeline(reason)
}

/// Parses a pipeline given as a JSON array of single-key stage objects
pub fn parse_pipeline(value: &Value) -> AggregationResult<Pipeline> {
    let pipeline = parse_stages(value, false)?;
    for (i, stage) in pipeline.stages().iter().enumerate() {
        if i > 0 {
            if let StageKind::Match(filter) = &stage.kind {
                if filter.has_text() {
                    return Err(invalid("$text is only allowed in the first $match stage"));
                }
            }
        }
    }
    Ok(pipeline)
}

fn parse_stages(value: &Value, in_facet: bool) -> AggregationResult<Pipeline> {
    let items = value
        .as_array()
        .ok_or_else(|| invalid("pipeline must be an array of stages"))?;
    let stages = items
        .iter()
        .map(|item| parse_stage(item, in_facet))
        .collect::<AggregationResult<Vec<_>>>()?;
    Ok(Pipeline::new(stages))
}

/// Parses one `{"$stage": spec}` object
pub fn parse_stage(value: &Value, in_facet: bool) -> AggregationResult<Stage> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid("stage must be an object"))?;
    if map.len() != 1 {
        return Err(invalid(format!(
            "stage must have exactly one key, found {}",
            map.len()
        )));
    }
    let (name, spec) = match map.iter().next() {
        Some(entry) => entry,
        None => return Err(invalid("empty stage")),
    };

    let kind = match name.as_str() {
        "$match" => {
            if !spec.is_object() {
                return Err(invalid("$match requires an object"));
            }
            let filter = FilterExpr::parse(spec)?;
            if in_facet && filter.has_text() {
                return Err(invalid("$text is not allowed inside $facet"));
            }
            StageKind::Match(filter)
        }
        "$addFields" | "$set" => StageKind::AddFields(parse_add_fields(name, spec)?),
        "$project" => StageKind::Project(parse_project(spec)?),
        "$group" => StageKind::Group(parse_group(spec)?),
        "$sort" => StageKind::Sort(parse_sort(spec)?),
        "$skip" => StageKind::Skip(parse_count_value("$skip", spec)?),
        "$limit" => StageKind::Limit(parse_count_value("$limit", spec)?),
        "$unwind" => StageKind::Unwind(parse_unwind(spec)?),
        "$lookup" => StageKind::Lookup(parse_lookup(spec)?),
        "$facet" => {
            if in_facet {
                return Err(invalid("$facet cannot be nested inside $facet"));
            }
            StageKind::Facet(parse_facet(spec)?)
        }
        "$unset" => StageKind::Unset(parse_unset(spec)?),
        "$count" => StageKind::Count(parse_count_field(spec)?),
        "$sample" => {
            let size = spec
                .as_object()
                .and_then(|m| m.get("size"))
                .ok_or_else(|| invalid("$sample requires {size: n}"))?;
            StageKind::Sample(parse_count_value("$sample.size", size)?)
        }
        other => return Err(invalid(format!("unknown stage '{}'", other))),
    };

    Ok(Stage::new(kind, value.clone()))
}

fn object<'a>(stage: &str, spec: &'a Value) -> AggregationResult<&'a Map<String, Value>> {
    spec.as_object()
        .ok_or_else(|| invalid(format!("{} requires an object", stage)))
}

fn path(stage: &str, raw: &str) -> AggregationResult<FieldPath> {
    FieldPath::parse(raw).map_err(|e| invalid(format!("{}: {}", stage, e.message())))
}

/// Non-negative integer; integral floats are accepted
fn parse_count_value(stage: &str, spec: &Value) -> AggregationResult<u64> {
    if let Some(n) = spec.as_u64() {
        return Ok(n);
    }
    match spec.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f < u64::MAX as f64 => Ok(f as u64),
        _ => Err(invalid(format!(
            "{} requires a non-negative integer, got {}",
            stage, spec
        ))),
    }
}

fn parse_add_fields(stage: &str, spec: &Value) -> AggregationResult<Vec<(FieldPath, Expression)>> {
    let fields = object(stage, spec)?
        .iter()
        .map(|(k, v)| Ok((path(stage, k)?, parse_expression(v)?)))
        .collect::<AggregationResult<Vec<_>>>()?;
    for (i, (a, _)) in fields.iter().enumerate() {
        if fields[..i].iter().any(|(b, _)| a.overlaps(b)) {
            return Err(invalid(format!("{} path collision at '{}'", stage, a)));
        }
    }
    Ok(fields)
}

fn parse_project(spec: &Value) -> AggregationResult<ProjectSpec> {
    let map = object("$project", spec)?;
    if map.is_empty() {
        return Err(invalid("$project requires at least one field"));
    }

    let mut fields = Vec::new();
    let mut id = None;
    for (key, value) in map {
        let field = match value {
            Value::Bool(true) => ProjectField::Include,
            Value::Bool(false) => ProjectField::Exclude,
            Value::Number(n) if n.as_f64() == Some(0.0) => ProjectField::Exclude,
            Value::Number(_) => ProjectField::Include,
            other => ProjectField::Computed(parse_expression(other)?),
        };
        if key == ID_FIELD {
            id = Some(field);
        } else {
            fields.push((path("$project", key)?, field));
        }
    }

    let includes = fields
        .iter()
        .any(|(_, f)| !matches!(f, ProjectField::Exclude));
    let excludes = fields.iter().any(|(_, f)| matches!(f, ProjectField::Exclude));
    if includes && excludes {
        return Err(invalid(
            "$project cannot mix inclusion and exclusion (other than _id)",
        ));
    }
    let id_computed = matches!(id, Some(ProjectField::Computed(_)));
    if excludes && id_computed {
        return Err(invalid("$project cannot compute _id in exclusion mode"));
    }

    let mode = if excludes || (fields.is_empty() && matches!(id, Some(ProjectField::Exclude))) {
        ProjectMode::Exclusion
    } else {
        ProjectMode::Inclusion
    };

    for (i, (a, _)) in fields.iter().enumerate() {
        if fields[..i].iter().any(|(b, _)| a.overlaps(b)) {
            return Err(invalid(format!("$project path collision at '{}'", a)));
        }
    }

    Ok(ProjectSpec { mode, fields, id })
}

fn parse_group(spec: &Value) -> AggregationResult<GroupSpec> {
    let map = object("$group", spec)?;
    let key = map
        .get(ID_FIELD)
        .ok_or_else(|| invalid("$group requires an _id"))?;
    let key = parse_expression(key)?;

    let mut accumulators = Vec::new();
    for (name, value) in map {
        if name == ID_FIELD {
            continue;
        }
        if name.contains('.') || name.starts_with('$') {
            return Err(invalid(format!("$group field '{}' must be a plain name", name)));
        }
        let acc = value
            .as_object()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| invalid(format!("$group field '{}' must be {{$accumulator: expr}}", name)))?;
        let (op_name, arg) = match acc.iter().next() {
            Some(entry) => entry,
            None => return Err(invalid(format!("$group field '{}' is empty", name))),
        };
        let op = AccumulatorOp::from_name(op_name)
            .ok_or_else(|| invalid(format!("unknown accumulator '{}'", op_name)))?;
        let argument = match op {
            // {$count: {}} counts rows
            AccumulatorOp::Count => Expression::Literal(Value::from(1)),
            _ => parse_expression(arg)?,
        };
        accumulators.push(Accumulator {
            name: name.clone(),
            op,
            argument,
        });
    }

    Ok(GroupSpec { key, accumulators })
}

fn parse_sort(spec: &Value) -> AggregationResult<Vec<(FieldPath, SortDirection)>> {
    let map = object("$sort", spec)?;
    if map.is_empty() {
        return Err(invalid("$sort requires at least one key"));
    }
    map.iter()
        .map(|(k, v)| {
            let direction = match v.as_f64() {
                Some(d) if d == 1.0 => SortDirection::Ascending,
                Some(d) if d == -1.0 => SortDirection::Descending,
                _ => return Err(invalid(format!("$sort direction for '{}' must be 1 or -1", k))),
            };
            Ok((path("$sort", k)?, direction))
        })
        .collect()
}

fn field_reference(stage: &str, raw: &Value) -> AggregationResult<FieldPath> {
    let s = raw
        .as_str()
        .and_then(|s| s.strip_prefix('$'))
        .ok_or_else(|| invalid(format!("{} path must be a '$field' string", stage)))?;
    path(stage, s)
}

fn parse_unwind(spec: &Value) -> AggregationResult<UnwindSpec> {
    if spec.is_string() {
        return Ok(UnwindSpec {
            path: field_reference("$unwind", spec)?,
            include_array_index: None,
            preserve_null_and_empty: false,
        });
    }
    let map = object("$unwind", spec)?;
    let unwind_path = field_reference(
        "$unwind",
        map.get("path").unwrap_or(&Value::Null),
    )?;
    let include_array_index = match map.get("includeArrayIndex") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.starts_with('$') => Some(path("$unwind", s)?),
        Some(_) => return Err(invalid("includeArrayIndex must be a field name")),
    };
    let preserve_null_and_empty = match map.get("preserveNullAndEmptyArrays") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(invalid("preserveNullAndEmptyArrays must be a boolean")),
    };
    for key in map.keys() {
        if !matches!(key.as_str(), "path" | "includeArrayIndex" | "preserveNullAndEmptyArrays") {
            return Err(invalid(format!("unknown $unwind option '{}'", key)));
        }
    }
    Ok(UnwindSpec {
        path: unwind_path,
        include_array_index,
        preserve_null_and_empty,
    })
}

fn parse_lookup(spec: &Value) -> AggregationResult<LookupSpec> {
    let map = object("$lookup", spec)?;
    let text = |key: &str| -> AggregationResult<&str> {
        map.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(format!("$lookup requires a string '{}'", key)))
    };
    Ok(LookupSpec {
        from: text("from")?.to_string(),
        local_field: path("$lookup", text("localField")?)?,
        foreign_field: path("$lookup", text("foreignField")?)?,
        as_field: path("$lookup", text("as")?)?,
    })
}

fn parse_facet(spec: &Value) -> AggregationResult<Vec<(String, Pipeline)>> {
    let map = object("$facet", spec)?;
    if map.is_empty() {
        return Err(invalid("$facet requires at least one branch"));
    }
    map.iter()
        .map(|(name, branch)| {
            if name.is_empty() || name.starts_with('$') || name.contains('.') {
                return Err(invalid(format!("invalid $facet output name '{}'", name)));
            }
            Ok((name.clone(), parse_stages(branch, true)?))
        })
        .collect()
}

fn parse_unset(spec: &Value) -> AggregationResult<Vec<FieldPath>> {
    let names: Vec<&Value> = match spec {
        Value::String(_) => vec![spec],
        Value::Array(items) if !items.is_empty() => items.iter().collect(),
        _ => return Err(invalid("$unset requires a field name or a non-empty list")),
    };
    names
        .into_iter()
        .map(|v| {
            let s = v
                .as_str()
                .ok_or_else(|| invalid("$unset field names must be strings"))?;
            path("$unset", s)
        })
        .collect()
}

fn parse_count_field(spec: &Value) -> AggregationResult<String> {
    match spec.as_str() {
        Some(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('.') => Ok(s.to_string()),
        _ => Err(invalid("$count requires a non-empty field name without '$' or '.'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code(value: Value) -> &'static str {
        parse_pipeline(&value).unwrap_err().code().code()
    }

    #[test]
    fn test_parse_every_stage() {
        let pipeline = parse_pipeline(&json!([
            {"$match": {"status": "A"}},
            {"$set": {"total": {"$add": ["$a", "$b"]}}},
            {"$project": {"total": 1, "_id": 0}},
            {"$unwind": {"path": "$items", "includeArrayIndex": "idx"}},
            {"$group": {"_id": "$k", "n": {"$sum": 1}, "c": {"$count": {}}}},
            {"$sort": {"n": -1}},
            {"$skip": 1},
            {"$limit": 2.0},
            {"$lookup": {"from": "b", "localField": "x", "foreignField": "y", "as": "j"}},
            {"$facet": {"all": [{"$count": "n"}]}},
            {"$unset": ["j", "x.y"]},
            {"$count": "total"},
            {"$sample": {"size": 3}}
        ]))
        .unwrap();

        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "$match", "$addFields", "$project", "$unwind", "$group", "$sort", "$skip",
                "$limit", "$lookup", "$facet", "$unset", "$count", "$sample"
            ]
        );
        assert_eq!(pipeline.stages()[7].kind, StageKind::Limit(2));
        match &pipeline.stages()[2].kind {
            StageKind::Project(spec) => {
                assert_eq!(spec.mode, ProjectMode::Inclusion);
                assert!(!spec.keeps_id());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_shapes() {
        assert_eq!(code(json!({"$match": {}})), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$match": {}, "$limit": 1}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$bogus": {}}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$limit": -1}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$sort": {"a": 2}}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$group": {"n": {"$sum": 1}}}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$group": {"_id": null, "n": {"$median": 1}}}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$count": "$x"}])), "AERO_PIPELINE_INVALID");
        assert_eq!(code(json!([{"$unwind": "items"}])), "AERO_PIPELINE_INVALID");
    }

    #[test]
    fn test_project_mixing_is_invalid() {
        assert_eq!(
            code(json!([{"$project": {"a": 1, "b": 0}}])),
            "AERO_PIPELINE_INVALID"
        );
        // _id may be excluded alongside inclusions
        assert!(parse_pipeline(&json!([{"$project": {"a": 1, "_id": 0}}])).is_ok());

        let pipeline = parse_pipeline(&json!([{"$project": {"_id": 0}}])).unwrap();
        match &pipeline.stages()[0].kind {
            StageKind::Project(spec) => assert_eq!(spec.mode, ProjectMode::Exclusion),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_text_placement() {
        assert!(parse_pipeline(&json!([{"$match": {"$text": {"$search": "rust"}}}])).is_ok());
        assert_eq!(
            code(json!([{"$limit": 1}, {"$match": {"$text": {"$search": "rust"}}}])),
            "AERO_PIPELINE_INVALID"
        );
        assert_eq!(
            code(json!([{"$facet": {"a": [{"$match": {"$text": {"$search": "x"}}}]}}])),
            "AERO_PIPELINE_INVALID"
        );
    }

    #[test]
    fn test_nested_facet_is_invalid() {
        assert_eq!(
            code(json!([{"$facet": {"a": [{"$facet": {"b": []}}]}}])),
            "AERO_PIPELINE_INVALID"
        );
    }

    #[test]
    fn test_unwind_forms() {
        let pipeline = parse_pipeline(&json!([
            {"$unwind": "$tags"},
            {"$unwind": {"path": "$a.b", "preserveNullAndEmptyArrays": true}}
        ]))
        .unwrap();
        match (&pipeline.stages()[0].kind, &pipeline.stages()[1].kind) {
            (StageKind::Unwind(a), StageKind::Unwind(b)) => {
                assert_eq!(a.path.dotted(), "tags");
                assert!(!a.preserve_null_and_empty);
                assert_eq!(b.path.dotted(), "a.b");
                assert!(b.preserve_null_and_empty);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
