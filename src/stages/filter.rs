//! `$match`

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::SqlFragment;
use crate::pipeline::{FilterExpr, PipelineContext, Row};

use super::{row_translator, StageHandler};

/// Keeps the rows the filter accepts
pub struct FilterStage<'s> {
    filter: &'s FilterExpr,
}

impl<'s> FilterStage<'s> {
    pub fn new(filter: &'s FilterExpr) -> Self {
        Self { filter }
    }
}

impl StageHandler for FilterStage<'_> {
    fn name(&self) -> &'static str {
        "$match"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let known = ctx.known_kinds();
        let translator = row_translator(ctx.capabilities, &known);
        let condition = self.filter.to_sql(&translator, "s.id", &ctx.text)?;

        let mut f = SqlFragment::raw("SELECT s.seq, s.id, s.root_payload, s.data FROM ");
        f.push(input).push(" s WHERE ").append(&condition);
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let mut kept = Vec::with_capacity(rows.len());
        for row in rows {
            if self.filter.matches(&row.current, &row.root, row.id, &ctx.text)? {
                kept.push(row);
            }
        }
        Ok(kept)
    }

    fn streams(&self) -> bool {
        true
    }

    fn update_context(&self, _ctx: &mut PipelineContext<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::storage::Capabilities;
    use crate::value::Document;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_filters_rows_and_binds_constants() {
        let filter = FilterExpr::parse(&json!({"status": "shipped", "qty": {"$gt": 5}})).unwrap();
        let stage = FilterStage::new(&filter);
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("orders", &source, &options);
        ctx.capabilities = Capabilities::full();

        let rows = vec![
            Row::new(1, json!({"status": "shipped", "qty": 10})),
            Row::new(2, json!({"status": "shipped", "qty": 1})),
            Row::new(3, json!({"status": "open", "qty": 10})),
        ];
        let kept = stage.interpret(rows, &ctx).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, 1);

        let sql = stage
            .compile_sql("stage_0", &mut CteBuilder::new(), &mut ctx)
            .unwrap();
        assert!(sql.sql.starts_with("SELECT s.seq, s.id, s.root_payload, s.data FROM stage_0 s WHERE "));
        assert!(!sql.sql.contains("shipped"));
    }
}
