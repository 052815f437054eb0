//! `$addFields` / `$set`, `$project`, `$unset`
//!
//! All field values are computed against the stage's input document, then
//! written. Paths within one stage never overlap (enforced by the parser),
//! so the write order does not change the result.

use serde_json::{Map, Value};

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::{evaluate_field, yields_remove, Expression, Scope, SqlFragment, NO_PATH};
use crate::pipeline::{PipelineContext, ProjectField, ProjectMode, ProjectSpec, Row};
use crate::value::{FieldPath, ID_FIELD};

use super::{decline, json_path, row_translator, select_with_data, StageHandler};

/// `json_set` / `json_remove` calls over `base`.
///
/// A remove with a condition only applies to rows where it holds; other
/// rows remove a path that cannot match anything.
fn write_fields(
    base: SqlFragment,
    sets: &[(String, SqlFragment)],
    removes: &[(String, Option<SqlFragment>)],
) -> SqlFragment {
    let mut data = base;
    if !sets.is_empty() {
        let mut f = SqlFragment::raw("json_set(");
        f.append(&data);
        for (path, value) in sets {
            f.push(", ").bind(path.as_str()).push(", ").append(value);
        }
        f.push(")");
        data = f;
    }
    if !removes.is_empty() {
        let mut f = SqlFragment::raw("json_remove(");
        f.append(&data);
        for (path, condition) in removes {
            f.push(", ");
            match condition {
                None => {
                    f.bind(path.as_str());
                }
                Some(condition) => {
                    f.push("CASE WHEN ")
                        .append(condition)
                        .push(" THEN ")
                        .bind(path.as_str())
                        .push(" ELSE ")
                        .bind(NO_PATH)
                        .push(" END");
                }
            }
        }
        f.push(")");
        data = f;
    }
    data
}

type FieldWrites = (Vec<(String, SqlFragment)>, Vec<(String, Option<SqlFragment>)>);

/// Translates computed fields into `json_set` pairs and removals
fn computed_writes<'e>(
    fields: impl Iterator<Item = (&'e FieldPath, &'e Expression)>,
    ctx: &PipelineContext<'_>,
) -> AggregationResult<FieldWrites> {
    let known = ctx.known_kinds();
    let translator = row_translator(ctx.capabilities, &known);
    let mut sets = Vec::new();
    let mut removes = Vec::new();
    for (path, expr) in fields {
        let json_path = json_path(path)?;
        let field = translator.field_value(expr)?;
        if field.always_removed() {
            removes.push((json_path, None));
            continue;
        }
        sets.push((json_path.clone(), field.value));
        if let Some(condition) = field.remove_when {
            removes.push((json_path, Some(condition)));
        }
    }
    Ok((sets, removes))
}

/// Evaluates every field against `row`, then applies them to `target`
fn apply_computed<'e>(
    row: &Row,
    target: &mut Value,
    fields: impl Iterator<Item = (&'e FieldPath, &'e Expression)>,
) -> AggregationResult<()> {
    let scope = Scope::new(&row.root, &row.current);
    let mut values = Vec::new();
    for (path, expr) in fields {
        values.push((path, evaluate_field(expr, &scope)?));
    }
    for (path, value) in values {
        match value {
            Some(value) => path.set(target, value),
            None => {
                path.remove(target);
            }
        }
    }
    Ok(())
}

// ---- $addFields ----

/// Adds or replaces fields
pub struct AddFieldsStage<'s> {
    fields: &'s [(FieldPath, Expression)],
}

impl<'s> AddFieldsStage<'s> {
    pub fn new(fields: &'s [(FieldPath, Expression)]) -> Self {
        Self { fields }
    }

    fn pairs(&self) -> impl Iterator<Item = (&'s FieldPath, &'s Expression)> {
        self.fields.iter().map(|(p, e)| (p, e))
    }
}

impl StageHandler for AddFieldsStage<'_> {
    fn name(&self) -> &'static str {
        "$addFields"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let (sets, removes) = computed_writes(self.pairs(), ctx)?;
        let data = write_fields(SqlFragment::raw("s.data"), &sets, &removes);
        Ok(select_with_data(input, &data))
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        rows.into_iter()
            .map(|row| {
                let mut doc = row.current.clone();
                apply_computed(&row, &mut doc, self.pairs())?;
                Ok(row.with_current(doc))
            })
            .collect()
    }

    fn streams(&self) -> bool {
        true
    }

    fn update_context(&self, ctx: &mut PipelineContext<'_>) {
        // Kinds are inferred against the fields known before this stage
        let known = ctx.known_kinds();
        let translator = row_translator(ctx.capabilities, &known);
        let updates: Vec<(String, Option<(Expression, Option<_>)>)> = self
            .fields
            .iter()
            .map(|(path, expr)| {
                let root = path.root().to_string();
                if path.segments().len() == 1 && !yields_remove(expr) {
                    let kind = translator.translate(expr).ok().map(|t| t.kind);
                    (root, Some((expr.clone(), kind)))
                } else {
                    (root, None)
                }
            })
            .collect();

        for (name, introduced) in updates {
            match introduced {
                Some((expr, kind)) => ctx.introduce_field(&name, expr, kind),
                None => ctx.forget_field(&name),
            }
        }
    }
}

// ---- $project ----

/// Reshapes documents by inclusion or exclusion
pub struct ProjectStage<'s> {
    spec: &'s ProjectSpec,
}

impl<'s> ProjectStage<'s> {
    pub fn new(spec: &'s ProjectSpec) -> Self {
        Self { spec }
    }

    fn computed(&self) -> impl Iterator<Item = (&'s FieldPath, &'s Expression)> {
        self.spec.fields.iter().filter_map(|(path, field)| match field {
            ProjectField::Computed(expr) => Some((path, expr)),
            _ => None,
        })
    }

    fn included(&self) -> Vec<&'s FieldPath> {
        self.spec
            .fields
            .iter()
            .filter(|(_, field)| matches!(field, ProjectField::Include))
            .map(|(path, _)| path)
            .collect()
    }

    fn computed_id(&self) -> Option<&'s Expression> {
        match &self.spec.id {
            Some(ProjectField::Computed(expr)) => Some(expr),
            _ => None,
        }
    }

    fn compile_exclusion(&self) -> AggregationResult<SqlFragment> {
        let mut removes = Vec::new();
        for (path, _) in &self.spec.fields {
            removes.push((json_path(path)?, None));
        }
        if !self.spec.keeps_id() {
            removes.push((format!("$.{}", ID_FIELD), None));
        }
        Ok(write_fields(SqlFragment::raw("s.data"), &[], &removes))
    }

    fn compile_inclusion(&self, ctx: &PipelineContext<'_>) -> AggregationResult<SqlFragment> {
        if self.computed_id().is_some() {
            return Err(decline("$project", "computed _id"));
        }
        if !ctx.capabilities.ordered_aggregates {
            return Err(decline("$project", "engine lacks ordered aggregates"));
        }
        let included = self.included();
        if included.iter().any(|p| p.segments().len() > 1) {
            return Err(decline("$project", "nested inclusion"));
        }

        let mut keys: Vec<&str> = included.iter().map(|p| p.root()).collect();
        if self.spec.keeps_id() {
            keys.push(ID_FIELD);
        }
        let placeholders = vec!["?"; keys.len()].join(", ");

        let mut base = SqlFragment::raw(
            "json((SELECT json_group_object(e.key, json(s.data -> e.fullkey) ORDER BY e.id) \
             FROM json_each(s.data) e WHERE e.key IN (",
        );
        base.push(&placeholders);
        base.params.extend(keys.into_iter().map(Into::into));
        base.push(")))");

        let (sets, removes) = computed_writes(self.computed(), ctx)?;
        Ok(write_fields(base, &sets, &removes))
    }

    fn project_inclusion(&self, row: &Row) -> AggregationResult<Value> {
        let mut out = Map::new();
        let scope = Scope::new(&row.root, &row.current);
        if let Some(expr) = self.computed_id() {
            if let Some(id) = evaluate_field(expr, &scope)? {
                out.insert(ID_FIELD.to_string(), id);
            }
        }

        let keep_id = self.spec.keeps_id() && self.computed_id().is_none();
        let included: Vec<&[String]> = self.included().iter().map(|p| p.segments()).collect();
        if let Value::Object(map) = &row.current {
            for (key, value) in map {
                if key == ID_FIELD {
                    if keep_id {
                        out.insert(key.clone(), value.clone());
                    }
                    continue;
                }
                if let Some(projected) = include_nested(key, value, &included) {
                    out.insert(key.clone(), projected);
                }
            }
        }

        let mut doc = Value::Object(out);
        apply_computed(row, &mut doc, self.computed())?;
        Ok(doc)
    }

    fn project_exclusion(&self, row: &Row) -> Value {
        let mut doc = row.current.clone();
        for (path, _) in &self.spec.fields {
            path.remove(&mut doc);
        }
        if !self.spec.keeps_id() {
            if let Value::Object(map) = &mut doc {
                map.shift_remove(ID_FIELD);
            }
        }
        doc
    }
}

/// Value of top-level `key` restricted to the included paths; `None` when
/// nothing under it is included
fn include_nested(key: &str, value: &Value, included: &[&[String]]) -> Option<Value> {
    let rests: Vec<&[String]> = included
        .iter()
        .filter(|segments| segments.first().map(String::as_str) == Some(key))
        .map(|segments| &segments[1..])
        .collect();
    if rests.is_empty() {
        return None;
    }
    if rests.iter().any(|rest| rest.is_empty()) {
        return Some(value.clone());
    }
    match value {
        Value::Object(map) => Some(restrict_object(map, &rests)),
        // Arrays apply the sub-paths to each embedded document
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| item.as_object().map(|map| restrict_object(map, &rests)))
                .collect(),
        )),
        _ => None,
    }
}

fn restrict_object(map: &Map<String, Value>, rests: &[&[String]]) -> Value {
    let mut out = Map::new();
    for (k, v) in map {
        if let Some(projected) = include_nested(k, v, rests) {
            out.insert(k.clone(), projected);
        }
    }
    Value::Object(out)
}

impl StageHandler for ProjectStage<'_> {
    fn name(&self) -> &'static str {
        "$project"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let data = match self.spec.mode {
            ProjectMode::Exclusion => self.compile_exclusion()?,
            ProjectMode::Inclusion => self.compile_inclusion(ctx)?,
        };
        Ok(select_with_data(input, &data))
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        rows.into_iter()
            .map(|row| {
                let doc = match self.spec.mode {
                    ProjectMode::Exclusion => self.project_exclusion(&row),
                    ProjectMode::Inclusion => self.project_inclusion(&row)?,
                };
                Ok(row.with_current(doc))
            })
            .collect()
    }

    fn streams(&self) -> bool {
        true
    }
}

// ---- $unset ----

/// Removes fields
pub struct UnsetStage<'s> {
    paths: &'s [FieldPath],
}

impl<'s> UnsetStage<'s> {
    pub fn new(paths: &'s [FieldPath]) -> Self {
        Self { paths }
    }
}

impl StageHandler for UnsetStage<'_> {
    fn name(&self) -> &'static str {
        "$unset"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        _ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let removes = self
            .paths
            .iter()
            .map(|p| Ok((json_path(p)?, None)))
            .collect::<AggregationResult<Vec<_>>>()?;
        let data = write_fields(SqlFragment::raw("s.data"), &[], &removes);
        Ok(select_with_data(input, &data))
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut doc = row.current.clone();
                for path in self.paths {
                    path.remove(&mut doc);
                }
                row.with_current(doc)
            })
            .collect())
    }

    fn streams(&self) -> bool {
        true
    }

    fn update_context(&self, ctx: &mut PipelineContext<'_>) {
        for path in self.paths {
            ctx.forget_field(path.root());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::expression::{parse_expression, SqlKind};
    use crate::pipeline::Pipeline;
    use crate::storage::Capabilities;
    use crate::value::Document;
    use serde_json::json;
    use std::collections::HashMap;

    fn run(stage_json: serde_json::Value, doc: serde_json::Value) -> serde_json::Value {
        let pipeline = Pipeline::from_json(&json!([stage_json])).unwrap();
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let ctx = PipelineContext::new("c", &source, &options);
        let handler = super::super::handler_for(&pipeline.stages()[0]);
        let rows = handler.interpret(vec![Row::new(7, doc)], &ctx).unwrap();
        rows[0].current.clone()
    }

    #[test]
    fn test_add_fields_reads_input_document() {
        let out = run(
            json!({"$set": {"a": 10, "b": "$a", "c.d": {"$add": ["$a", 1]}}}),
            json!({"a": 1}),
        );
        assert_eq!(out, json!({"a": 10, "b": 1, "c": {"d": 2}}));
    }

    #[test]
    fn test_add_fields_remove() {
        let out = run(
            json!({"$addFields": {"a": "$$REMOVE", "b": {"$cond": [true, "$$REMOVE", 1]}}}),
            json!({"a": 1, "b": 2, "c": 3}),
        );
        assert_eq!(out, json!({"c": 3}));
    }

    #[test]
    fn test_project_inclusion_keeps_document_order() {
        let out = run(
            json!({"$project": {"b": 1, "a": true, "sum": {"$add": ["$a", "$b"]}}}),
            json!({"_id": 7, "a": 1, "b": 2, "c": 3}),
        );
        assert_eq!(out, json!({"_id": 7, "a": 1, "b": 2, "sum": 3}));
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["_id", "a", "b", "sum"]);
    }

    #[test]
    fn test_project_nested_and_excluded_id() {
        let out = run(
            json!({"$project": {"addr.city": 1, "_id": 0}}),
            json!({"_id": 7, "addr": {"city": "Oslo", "zip": "0150"}, "name": "x"}),
        );
        assert_eq!(out, json!({"addr": {"city": "Oslo"}}));
    }

    #[test]
    fn test_project_exclusion() {
        let out = run(
            json!({"$project": {"secret": 0, "nested.x": 0}}),
            json!({"_id": 7, "secret": 1, "nested": {"x": 1, "y": 2}}),
        );
        assert_eq!(out, json!({"_id": 7, "nested": {"y": 2}}));
    }

    #[test]
    fn test_unset() {
        let out = run(json!({"$unset": ["a", "b.c"]}), json!({"a": 1, "b": {"c": 2, "d": 3}}));
        assert_eq!(out, json!({"b": {"d": 3}}));
    }

    #[test]
    fn test_add_fields_sql_and_context() {
        let fields = vec![
            (FieldPath::parse("total").unwrap(), parse_expression(&json!({"$add": ["$a", 1]})).unwrap()),
            (FieldPath::parse("gone").unwrap(), parse_expression(&json!("$$REMOVE")).unwrap()),
        ];
        let stage = AddFieldsStage::new(&fields);
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("c", &source, &options);
        ctx.capabilities = Capabilities::full();

        let sql = stage.compile_sql("stage_0", &mut CteBuilder::new(), &mut ctx).unwrap();
        assert!(sql.sql.contains("json_remove(json_set(s.data, ?, "));
        assert!(sql.params.contains(&"$.total".into()));

        stage.update_context(&mut ctx);
        assert_eq!(ctx.field_origin("total").and_then(|o| o.kind), Some(SqlKind::Number));
        assert!(ctx.field_origin("gone").is_none());
    }

    #[test]
    fn test_project_inclusion_sql_declines_nested() {
        let pipeline = Pipeline::from_json(&json!([{"$project": {"a.b": 1}}])).unwrap();
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("c", &source, &options);
        ctx.capabilities = Capabilities::full();
        let handler = super::super::handler_for(&pipeline.stages()[0]);
        let err = handler
            .compile_sql("stage_0", &mut CteBuilder::new(), &mut ctx)
            .unwrap_err();
        assert!(err.is_fallback());
    }
}
