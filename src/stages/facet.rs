//! `$facet`
//!
//! Every branch runs over the same input rows. The results are merged into
//! one document `{name: [docs...]}`, which becomes the only output row and
//! the new `$$ROOT`.

use serde_json::{Map, Value};

use crate::compiler::{compile_chain, CteBuilder};
use crate::errors::AggregationResult;
use crate::expression::SqlFragment;
use crate::interpreter;
use crate::pipeline::{Pipeline, PipelineContext, Row};

use super::{decline, StageHandler};

/// Runs named sub-pipelines and merges their output
pub struct FacetStage<'s> {
    branches: &'s [(String, Pipeline)],
}

impl<'s> FacetStage<'s> {
    pub fn new(branches: &'s [(String, Pipeline)]) -> Self {
        Self { branches }
    }
}

impl StageHandler for FacetStage<'_> {
    fn name(&self) -> &'static str {
        "$facet"
    }

    fn compile_sql(
        &self,
        input: &str,
        builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        if !ctx.capabilities.ordered_aggregates {
            return Err(decline("$facet", "engine lacks ordered aggregates"));
        }

        let mut merged = SqlFragment::raw("json_object(");
        for (i, (name, pipeline)) in self.branches.iter().enumerate() {
            let mut branch = ctx.facet_branch(i);
            let last = compile_chain(pipeline.stages(), input, builder, &mut branch)?;
            if i > 0 {
                merged.push(", ");
            }
            merged
                .bind(name.as_str())
                .push(", json((SELECT json_group_array(json(data) ORDER BY seq) FROM ")
                .push(&last)
                .push("))");
        }
        merged.push(")");

        let mut f = SqlFragment::raw("SELECT 1 AS seq, 1 AS id, d AS root_payload, d AS data FROM (SELECT ");
        f.append(&merged).push(" AS d)");
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let mut doc = Map::new();
        for (i, (name, pipeline)) in self.branches.iter().enumerate() {
            let mut branch = ctx.facet_branch(i);
            let out = interpreter::run_stages(pipeline.stages(), rows.clone(), &mut branch)?;
            doc.insert(
                name.clone(),
                Value::Array(out.into_iter().map(|row| row.current).collect()),
            );
        }
        Ok(vec![Row::new(1, Value::Object(doc))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::pipeline::StageKind;
    use crate::storage::Capabilities;
    use crate::value::Document;
    use serde_json::json;
    use std::collections::HashMap;

    fn branches(spec: Value) -> Vec<(String, Pipeline)> {
        let pipeline = Pipeline::from_json(&json!([{ "$facet": spec }])).unwrap();
        match &pipeline.stages()[0].kind {
            StageKind::Facet(branches) => branches.clone(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_branches_see_the_same_input() {
        let spec = branches(json!({
            "small": [{"$match": {"n": {"$lt": 2}}}],
            "count": [{"$count": "n"}],
            "all": []
        }));
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let ctx = PipelineContext::new("c", &source, &options);

        let rows = vec![Row::new(1, json!({"n": 1})), Row::new(2, json!({"n": 2}))];
        let out = FacetStage::new(&spec).interpret(rows, &ctx).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].current,
            json!({
                "small": [{"n": 1}],
                "count": [{"n": 2}],
                "all": [{"n": 1}, {"n": 2}]
            })
        );
        assert_eq!(*out[0].root, out[0].current);
    }

    #[test]
    fn test_empty_input_gives_empty_branches() {
        let spec = branches(json!({"count": [{"$count": "n"}]}));
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let ctx = PipelineContext::new("c", &source, &options);
        let out = FacetStage::new(&spec).interpret(Vec::new(), &ctx).unwrap();
        assert_eq!(out[0].current, json!({"count": []}));
    }

    #[test]
    fn test_sql_compiles_branch_chains() {
        let spec = branches(json!({"a": [{"$limit": 1}], "b": []}));
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("c", &source, &options);
        ctx.capabilities = Capabilities::full();
        ctx.stage_index = 3;

        let mut builder = CteBuilder::new();
        let sql = FacetStage::new(&spec)
            .compile_sql("stage_2", &mut builder, &mut ctx)
            .unwrap();
        assert_eq!(builder.names(), vec!["stage_3_f0_0"]);
        assert!(sql.sql.contains("FROM stage_3_f0_0"));
        assert!(sql.sql.contains("FROM stage_2)"));
        assert_eq!(sql.params[0], crate::storage::SqlValue::from("a"));
    }
}
