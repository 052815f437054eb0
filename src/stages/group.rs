//! `$group`
//!
//! Groups are emitted in ascending canonical order of their key. In SQL the
//! key is reduced to its sort key, grouped on, and decoded back into JSON for
//! the `_id` field.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::{evaluate, sort_key_json, Scope, SqlExpr, SqlFragment, SqlKind};
use crate::pipeline::{AccumulatorOp, GroupSpec, PipelineContext, Row};
use crate::value::{compare_values, float_value, NumericSum, SortKey, ID_FIELD};

use super::{decline, row_translator, StageHandler};

/// Groups rows by key and folds accumulators over each group
pub struct GroupStage<'s> {
    spec: &'s GroupSpec,
}

impl<'s> GroupStage<'s> {
    pub fn new(spec: &'s GroupSpec) -> Self {
        Self { spec }
    }
}

/// Per-row input of an accumulator
fn row_input(op: AccumulatorOp, value: &SqlExpr) -> SqlFragment {
    let x = &value.fragment;
    match op {
        AccumulatorOp::Sum | AccumulatorOp::Avg => match value.kind {
            SqlKind::Number => x.clone(),
            SqlKind::Json => {
                let mut f = SqlFragment::raw("CASE WHEN json_type(");
                f.append(x)
                    .push(") IN ('integer', 'real') THEN aero_json_scalar(")
                    .append(x)
                    .push(") END");
                f
            }
            // Still evaluated, so run-time errors surface
            SqlKind::Text | SqlKind::Bool => x.wrap("CASE WHEN ", " IS NOT NULL THEN NULL END"),
        },
        AccumulatorOp::Count => SqlFragment::raw("NULL"),
        AccumulatorOp::Min | AccumulatorOp::Max => value.sort_key(),
        AccumulatorOp::Push | AccumulatorOp::AddToSet | AccumulatorOp::First | AccumulatorOp::Last => {
            value.as_json()
        }
    }
}

/// Aggregate over the per-row input column `a`
fn aggregate(op: AccumulatorOp, a: &str) -> String {
    match op {
        AccumulatorOp::Sum => format!("COALESCE(SUM({}), 0)", a),
        AccumulatorOp::Avg => format!("AVG({})", a),
        AccumulatorOp::Count => "COUNT(*)".to_string(),
        AccumulatorOp::Min => format!("MIN({})", a),
        AccumulatorOp::Max => format!("MAX({})", a),
        AccumulatorOp::Push | AccumulatorOp::AddToSet | AccumulatorOp::First | AccumulatorOp::Last => {
            format!("json_group_array(json(COALESCE({}, json_quote(NULL))) ORDER BY seq)", a)
        }
    }
}

/// Output value built from the aggregate column `r` of group row `g`
fn output(op: AccumulatorOp, r: &str) -> SqlFragment {
    match op {
        AccumulatorOp::Sum | AccumulatorOp::Avg => {
            SqlFragment::raw(format!("json(aero_number_json({}))", r))
        }
        AccumulatorOp::Count => SqlFragment::raw(r),
        AccumulatorOp::Min | AccumulatorOp::Max => SqlFragment::raw(sort_key_json(r)),
        AccumulatorOp::Push => SqlFragment::raw(format!("json({})", r)),
        AccumulatorOp::First | AccumulatorOp::Last => {
            let mut f = SqlFragment::raw(format!("json({} -> ", r));
            f.bind(if op == AccumulatorOp::First { "$[0]" } else { "$[#-1]" })
                .push(")");
            f
        }
        // Distinct elements by JSON text, in order of first occurrence
        AccumulatorOp::AddToSet => SqlFragment::raw(format!(
            "json((SELECT json_group_array(json(v) ORDER BY k) FROM \
             (SELECT MIN(e.id) AS k, {r} -> e.fullkey AS v FROM json_each({r}) e GROUP BY v)))",
            r = r
        )),
    }
}

/// `_id` of group row `g`: equal int and float keys share a group, which
/// keeps the representation of its first row
fn group_id_json(g: &str) -> String {
    format!(
        "CASE WHEN typeof({g}.gk) IN ('integer', 'real') THEN json(aero_number_json(\
         CASE {g}.rep % 2 WHEN 1 THEN CAST({g}.gk AS REAL) ELSE CAST({g}.gk AS INTEGER) END)) \
         ELSE {key} END",
        g = g,
        key = sort_key_json(&format!("{}.gk", g))
    )
}

impl StageHandler for GroupStage<'_> {
    fn name(&self) -> &'static str {
        "$group"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let ordered = self.spec.accumulators.iter().any(|a| {
            a.op.is_ordered() || a.op == AccumulatorOp::AddToSet
        });
        if ordered && !ctx.capabilities.ordered_aggregates {
            return Err(decline("$group", "engine lacks ordered aggregates"));
        }

        let known = ctx.known_kinds();
        let translator = row_translator(ctx.capabilities, &known);
        let key = translator.translate(&self.spec.key)?;

        // Per-row inputs
        let mut rows = SqlFragment::raw("SELECT s.seq AS seq, ");
        rows.append(&key.sort_key()).push(" AS gk");
        for (i, acc) in self.spec.accumulators.iter().enumerate() {
            let value = translator.translate(&acc.argument)?;
            rows.push(", ").append(&row_input(acc.op, &value));
            rows.push(&format!(" AS a{}", i));
        }
        rows.push(" FROM ").push(input).push(" s");

        // One row per group; `rep` is odd when the first key seen was a float
        let mut groups = SqlFragment::raw("SELECT gk, MIN(seq * 2 + (typeof(gk) = 'real')) AS rep");
        for (i, acc) in self.spec.accumulators.iter().enumerate() {
            groups.push(&format!(", {} AS r{}", aggregate(acc.op, &format!("a{}", i)), i));
        }
        groups.push(" FROM (").append(&rows).push(") GROUP BY gk");

        // Output documents
        let mut doc = SqlFragment::raw("json_object(");
        doc.bind(ID_FIELD).push(", ").push(&group_id_json("g"));
        for (i, acc) in self.spec.accumulators.iter().enumerate() {
            doc.push(", ")
                .bind(acc.name.as_str())
                .push(", ")
                .append(&output(acc.op, &format!("g.r{}", i)));
        }
        doc.push(")");

        let mut f = SqlFragment::raw(
            "SELECT ROW_NUMBER() OVER (ORDER BY gk) AS seq, ROW_NUMBER() OVER (ORDER BY gk) AS id, \
             d AS root_payload, d AS data FROM (SELECT g.gk AS gk, ",
        );
        f.append(&doc).push(" AS d FROM (").append(&groups).push(") g)");
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let mut groups: BTreeMap<SortKey, Vec<AccumulatorState>> = BTreeMap::new();
        for row in &rows {
            let scope = Scope::new(&row.root, &row.current);
            let key = evaluate(&self.spec.key, &scope)?;
            let mut values = Vec::with_capacity(self.spec.accumulators.len());
            for acc in &self.spec.accumulators {
                values.push(evaluate(&acc.argument, &scope)?);
            }
            let states = groups.entry(SortKey(key)).or_insert_with(|| {
                self.spec
                    .accumulators
                    .iter()
                    .map(|a| AccumulatorState::new(a.op))
                    .collect()
            });
            for (state, value) in states.iter_mut().zip(values) {
                state.add(value);
            }
        }

        Ok(groups
            .into_iter()
            .enumerate()
            .map(|(i, (key, states))| {
                let mut doc = Map::new();
                doc.insert(ID_FIELD.to_string(), key.0);
                for (acc, state) in self.spec.accumulators.iter().zip(states) {
                    doc.insert(acc.name.clone(), state.finish());
                }
                Row::new(i as i64 + 1, Value::Object(doc))
            })
            .collect())
    }
}

/// Running state of one accumulator within one group
#[derive(Debug)]
enum AccumulatorState {
    Sum(NumericSum),
    Avg(NumericSum),
    Count(u64),
    Min(Option<Value>),
    Max(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    First(Option<Value>),
    Last(Option<Value>),
}

impl AccumulatorState {
    fn new(op: AccumulatorOp) -> Self {
        match op {
            AccumulatorOp::Sum => AccumulatorState::Sum(NumericSum::new()),
            AccumulatorOp::Avg => AccumulatorState::Avg(NumericSum::new()),
            AccumulatorOp::Count => AccumulatorState::Count(0),
            AccumulatorOp::Min => AccumulatorState::Min(None),
            AccumulatorOp::Max => AccumulatorState::Max(None),
            AccumulatorOp::Push => AccumulatorState::Push(Vec::new()),
            AccumulatorOp::AddToSet => AccumulatorState::AddToSet(Vec::new()),
            AccumulatorOp::First => AccumulatorState::First(None),
            AccumulatorOp::Last => AccumulatorState::Last(None),
        }
    }

    fn add(&mut self, value: Value) {
        match self {
            AccumulatorState::Sum(sum) | AccumulatorState::Avg(sum) => sum.add_value(&value),
            AccumulatorState::Count(n) => *n += 1,
            AccumulatorState::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map(|c| compare_values(&value, c).is_lt())
                        .unwrap_or(true)
                {
                    *current = Some(value);
                }
            }
            AccumulatorState::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .map(|c| compare_values(&value, c).is_gt())
                        .unwrap_or(true)
                {
                    *current = Some(value);
                }
            }
            AccumulatorState::Push(items) => items.push(value),
            AccumulatorState::AddToSet(items) => {
                // Same notion of "distinct" as the SQL form: identical JSON text
                let text = value.to_string();
                if !items.iter().any(|item| item.to_string() == text) {
                    items.push(value);
                }
            }
            AccumulatorState::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            AccumulatorState::Last(last) => *last = Some(value),
        }
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Sum(sum) => sum.total().into_value(),
            AccumulatorState::Avg(sum) => sum.average().map(float_value).unwrap_or(Value::Null),
            AccumulatorState::Count(n) => Value::from(n),
            AccumulatorState::Min(v)
            | AccumulatorState::Max(v)
            | AccumulatorState::First(v)
            | AccumulatorState::Last(v) => v.unwrap_or(Value::Null),
            AccumulatorState::Push(items) | AccumulatorState::AddToSet(items) => Value::Array(items),
        }
    }
}
