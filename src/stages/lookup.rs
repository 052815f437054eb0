//! `$lookup`
//!
//! Left-outer equality join against another collection. Array values on
//! either side match element-wise. Null and missing local values match
//! nothing, so they never pick up foreign documents that lack the field.

use serde_json::Value;

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::{each_sort_key, SqlFragment};
use crate::pipeline::{LookupSpec, PipelineContext, Row};
use crate::value::{values_equal, ID_FIELD};

use super::{decline, json_path, select_with_data, StageHandler};

/// Joins matching foreign documents into an array field
pub struct LookupStage<'s> {
    spec: &'s LookupSpec,
}

impl<'s> LookupStage<'s> {
    pub fn new(spec: &'s LookupSpec) -> Self {
        Self { spec }
    }
}

/// `json_each` source over the elements of `column` at `path`, or over the
/// single value when it is not an array
fn elements(column: &str, path: &str) -> SqlFragment {
    let mut f = SqlFragment::raw("json_each(CASE json_type(");
    f.push(column)
        .push(", ")
        .bind(path)
        .push(") WHEN 'array' THEN ")
        .push(column)
        .push(" -> ")
        .bind(path)
        .push(" ELSE json_array(json(")
        .push(column)
        .push(" -> ")
        .bind(path)
        .push(")) END)");
    f
}

/// Values compared by the join: the elements of an array, or the value itself
fn candidates(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(value) => vec![value],
        None => Vec::new(),
    }
}

impl StageHandler for LookupStage<'_> {
    fn name(&self) -> &'static str {
        "$lookup"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        if !ctx.capabilities.ordered_aggregates {
            return Err(decline("$lookup", "engine lacks ordered aggregates"));
        }
        let store = ctx
            .store
            .ok_or_else(|| decline("$lookup", "no SQL store"))?;
        let as_path = json_path(&self.spec.as_field)?;
        let local = json_path(&self.spec.local_field)?;
        let foreign = json_path(&self.spec.foreign_field)?;

        let matches = match store.collection_table(&self.spec.from)? {
            // A missing collection joins nothing
            None => SqlFragment::raw("json_array()"),
            Some(table) => {
                let mut f = SqlFragment::raw(
                    "json(COALESCE((SELECT json_group_array(json(f.doc) ORDER BY f.id) FROM \
                     (SELECT id, json_set(data, ",
                );
                f.bind(format!("$.{}", ID_FIELD))
                    .push(", id) AS doc FROM ")
                    .push(&table)
                    .push(") f WHERE EXISTS (SELECT 1 FROM ")
                    .append(&elements("s.data", &local))
                    .push(" le, ")
                    .append(&elements("f.doc", &foreign))
                    .push(" fe WHERE le.type <> 'null' AND ")
                    .push(&each_sort_key("le"))
                    .push(" = ")
                    .push(&each_sort_key("fe"))
                    .push(")), json_array()))");
                f
            }
        };

        let mut data = SqlFragment::raw("json_set(s.data, ");
        data.bind(as_path).push(", ").append(&matches).push(")");
        Ok(select_with_data(input, &data))
    }

    fn interpret(&self, rows: Vec<Row>, ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let foreign: Vec<Value> = ctx
            .source
            .get_all(&self.spec.from)?
            .iter()
            .map(|doc| doc.pipeline_view())
            .collect();

        Ok(rows
            .into_iter()
            .map(|row| {
                let local: Vec<&Value> = candidates(self.spec.local_field.resolve(&row.current))
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .collect();
                let joined: Vec<Value> = foreign
                    .iter()
                    .filter(|doc| {
                        let theirs = candidates(self.spec.foreign_field.resolve(doc));
                        local
                            .iter()
                            .any(|l| theirs.iter().any(|f| values_equal(l, f)))
                    })
                    .cloned()
                    .collect();
                let mut doc = row.current.clone();
                self.spec.as_field.set(&mut doc, Value::Array(joined));
                row.with_current(doc)
            })
            .collect())
    }

    fn streams(&self) -> bool {
        true
    }

    fn update_context(&self, ctx: &mut PipelineContext<'_>) {
        ctx.forget_field(self.spec.as_field.root());
    }
}
