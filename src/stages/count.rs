//! `$count`

use serde_json::{Map, Value};

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::SqlFragment;
use crate::pipeline::{PipelineContext, Row};

use super::StageHandler;

/// One `{field: n}` document, or nothing for empty input
pub struct CountStage<'s> {
    field: &'s str,
}

impl<'s> CountStage<'s> {
    pub fn new(field: &'s str) -> Self {
        Self { field }
    }
}

impl StageHandler for CountStage<'_> {
    fn name(&self) -> &'static str {
        "$count"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        _ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let mut f = SqlFragment::raw("SELECT 1 AS seq, 1 AS id, d AS root_payload, d AS data FROM (SELECT json_object(");
        f.bind(self.field)
            .push(", COUNT(*)) AS d, COUNT(*) AS n FROM ")
            .push(input)
            .push(") WHERE n > 0");
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut doc = Map::new();
        doc.insert(self.field.to_string(), Value::from(rows.len() as u64));
        Ok(vec![Row::new(1, Value::Object(doc))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::value::Document;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_count_rows() {
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let ctx = PipelineContext::new("c", &source, &options);
        let stage = CountStage::new("total");

        let out = stage
            .interpret(vec![Row::new(1, json!({})), Row::new(2, json!({}))], &ctx)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].current, json!({"total": 2}));
        assert!(stage.interpret(Vec::new(), &ctx).unwrap().is_empty());
    }
}
