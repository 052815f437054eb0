//! `$unwind`
//!
//! One output row per array element. A non-array, non-null value passes
//! through as a single row. With `preserveNullAndEmptyArrays`, explicit null
//! and `[]` are kept once with the field set to null; a missing field still
//! drops the row.

use serde_json::Value;

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::SqlFragment;
use crate::pipeline::{PipelineContext, Row, UnwindSpec};

use super::{json_path, StageHandler};

/// Flattens an array field
pub struct UnwindStage<'s> {
    spec: &'s UnwindSpec,
}

impl<'s> UnwindStage<'s> {
    pub fn new(spec: &'s UnwindSpec) -> Self {
        Self { spec }
    }
}

impl StageHandler for UnwindStage<'_> {
    fn name(&self) -> &'static str {
        "$unwind"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        _ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let path = json_path(&self.spec.path)?;
        let index = match &self.spec.include_array_index {
            Some(index) => Some(json_path(index)?),
            None => None,
        };

        // Every input row gets the array to iterate and whether it was one
        let mut elements = SqlFragment::raw("SELECT t.seq, t.id, t.root_payload, t.data, CASE json_type(t.data, ");
        elements
            .bind(path.as_str())
            .push(") WHEN 'array' THEN t.data -> ")
            .bind(path.as_str())
            .push(" WHEN 'null' THEN json_array() ELSE CASE WHEN json_type(t.data, ")
            .bind(path.as_str())
            .push(") IS NULL THEN json_array() ELSE json_array(json(t.data -> ")
            .bind(path.as_str())
            .push(")) END END AS arr, COALESCE(json_type(t.data, ")
            .bind(path.as_str())
            .push(") = 'array', 0) AS is_array FROM ")
            .push(input)
            .push(" t");

        let mut data = SqlFragment::raw("json_set(s.data, ");
        data.bind(path.as_str()).push(", json(s.arr -> e.fullkey)");
        if let Some(index) = &index {
            data.push(", ")
                .bind(index.as_str())
                .push(", CASE WHEN s.is_array THEN e.key END");
        }
        data.push(")");

        let join = if self.spec.preserve_null_and_empty {
            " s LEFT JOIN json_each(s.arr) e"
        } else {
            " s JOIN json_each(s.arr) e"
        };

        let mut f = SqlFragment::raw("SELECT ROW_NUMBER() OVER (ORDER BY s.seq, e.key) AS seq, s.id, s.root_payload, ");
        f.append(&data).push(" AS data FROM (").append(&elements).push(")").push(join);
        if self.spec.preserve_null_and_empty {
            f.push(" WHERE json_type(s.data, ").bind(path.as_str()).push(") IS NOT NULL");
        }
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value = match self.spec.path.resolve(&row.current) {
                Some(value) => value.clone(),
                None => continue,
            };
            match value {
                Value::Array(items) if !items.is_empty() => {
                    for (i, item) in items.into_iter().enumerate() {
                        out.push(self.emit(&row, item, Value::from(i as u64)));
                    }
                }
                Value::Array(_) | Value::Null => {
                    if self.spec.preserve_null_and_empty {
                        out.push(self.emit(&row, Value::Null, Value::Null));
                    }
                }
                other => out.push(self.emit(&row, other, Value::Null)),
            }
        }
        Ok(out)
    }

    fn streams(&self) -> bool {
        true
    }

    fn update_context(&self, ctx: &mut PipelineContext<'_>) {
        ctx.forget_field(self.spec.path.root());
        if let Some(index) = &self.spec.include_array_index {
            ctx.forget_field(index.root());
        }
    }
}

impl UnwindStage<'_> {
    fn emit(&self, row: &Row, element: Value, index: Value) -> Row {
        let mut doc = row.current.clone();
        self.spec.path.set(&mut doc, element);
        if let Some(index_path) = &self.spec.include_array_index {
            index_path.set(&mut doc, index);
        }
        row.with_current(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::pipeline::{Pipeline, StageKind};
    use crate::storage::Capabilities;
    use crate::value::Document;
    use serde_json::json;
    use std::collections::HashMap;

    fn unwind(spec: serde_json::Value) -> UnwindSpec {
        let pipeline = Pipeline::from_json(&json!([{ "$unwind": spec }])).unwrap();
        match &pipeline.stages()[0].kind {
            StageKind::Unwind(spec) => spec.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn run(spec: &UnwindSpec, docs: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let ctx = PipelineContext::new("c", &source, &options);
        let rows = docs.into_iter().map(|d| Row::new(1, d)).collect();
        UnwindStage::new(spec)
            .interpret(rows, &ctx)
            .unwrap()
            .into_iter()
            .map(|r| r.current)
            .collect()
    }

    fn inputs() -> Vec<serde_json::Value> {
        vec![
            json!({"n": 1, "xs": [1, 2]}),
            json!({"n": 2, "xs": []}),
            json!({"n": 3, "xs": null}),
            json!({"n": 4}),
            json!({"n": 5, "xs": "solo"}),
        ]
    }

    #[test]
    fn test_unwind_default() {
        let out = run(&unwind(json!("$xs")), inputs());
        assert_eq!(
            out,
            vec![
                json!({"n": 1, "xs": 1}),
                json!({"n": 1, "xs": 2}),
                json!({"n": 5, "xs": "solo"}),
            ]
        );
    }

    #[test]
    fn test_preserve_keeps_null_and_empty_but_not_missing() {
        let spec = unwind(json!({
            "path": "$xs",
            "includeArrayIndex": "i",
            "preserveNullAndEmptyArrays": true
        }));
        let out = run(&spec, inputs());
        assert_eq!(
            out,
            vec![
                json!({"n": 1, "xs": 1, "i": 0}),
                json!({"n": 1, "xs": 2, "i": 1}),
                json!({"n": 2, "xs": null, "i": null}),
                json!({"n": 3, "xs": null, "i": null}),
                json!({"n": 5, "xs": "solo", "i": null}),
            ]
        );
    }

    #[test]
    fn test_sql_uses_left_join_when_preserving() {
        let spec = unwind(json!({"path": "$xs", "preserveNullAndEmptyArrays": true}));
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("c", &source, &options);
        ctx.capabilities = Capabilities::full();
        let sql = UnwindStage::new(&spec)
            .compile_sql("stage_0", &mut CteBuilder::new(), &mut ctx)
            .unwrap();
        assert!(sql.sql.contains("LEFT JOIN json_each(s.arr) e"));
        assert!(sql.sql.ends_with("IS NOT NULL"));
        assert_eq!(sql.params.iter().filter(|p| p.as_str() == Some("$.xs")).count(), sql.params.len());
    }
}
