//! `$sort`, `$skip`, `$limit`, `$sample`

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::compiler::CteBuilder;
use crate::errors::AggregationResult;
use crate::expression::{Expression, SqlFragment};
use crate::pipeline::{PipelineContext, Row, SortDirection};
use crate::value::{compare_optional, FieldPath};

use super::{count_param, decline, row_translator, StageHandler};

const PASSTHROUGH: &str = "SELECT s.seq, s.id, s.root_payload, s.data FROM ";

// ---- $sort ----

/// Stable sort in canonical value order
pub struct SortStage<'s> {
    keys: &'s [(FieldPath, SortDirection)],
}

impl<'s> SortStage<'s> {
    pub fn new(keys: &'s [(FieldPath, SortDirection)]) -> Self {
        Self { keys }
    }
}

impl StageHandler for SortStage<'_> {
    fn name(&self) -> &'static str {
        "$sort"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let known = ctx.known_kinds();
        let translator = row_translator(ctx.capabilities, &known);

        let mut order = Vec::with_capacity(self.keys.len() + 1);
        for (path, direction) in self.keys {
            let key = translator
                .translate(&Expression::field(path.clone()))?
                .sort_key();
            // NULL sorts first ascending and last descending, as null does
            order.push(match direction {
                SortDirection::Ascending => key.wrap("", " ASC"),
                SortDirection::Descending => key.wrap("", " DESC"),
            });
        }
        order.push(SqlFragment::raw("s.seq"));

        let mut f = SqlFragment::raw("SELECT ROW_NUMBER() OVER (ORDER BY ");
        f.append(&SqlFragment::join(&order, ", "))
            .push(") AS seq, s.id, s.root_payload, s.data FROM ")
            .push(input)
            .push(" s");
        Ok(f)
    }

    fn interpret(&self, mut rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        rows.sort_by(|a, b| {
            for (path, direction) in self.keys {
                let ord = compare_optional(path.resolve(&a.current), path.resolve(&b.current));
                let ord = match direction {
                    SortDirection::Ascending => ord,
                    SortDirection::Descending => ord.reverse(),
                };
                if ord.is_ne() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(rows)
    }

    fn update_context(&self, _ctx: &mut PipelineContext<'_>) {}
}

// ---- $skip / $limit ----

/// Drops the first `n` rows
pub struct SkipStage {
    n: u64,
}

impl SkipStage {
    pub fn new(n: u64) -> Self {
        Self { n }
    }
}

impl StageHandler for SkipStage {
    fn name(&self) -> &'static str {
        "$skip"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        _ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let mut f = SqlFragment::raw(PASSTHROUGH);
        f.push(input)
            .push(" s ORDER BY s.seq LIMIT -1 OFFSET ")
            .bind(count_param(self.n));
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let n = usize::try_from(self.n).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(n).collect())
    }

    fn update_context(&self, _ctx: &mut PipelineContext<'_>) {}
}

/// Keeps the first `n` rows
pub struct LimitStage {
    n: u64,
}

impl LimitStage {
    pub fn new(n: u64) -> Self {
        Self { n }
    }
}

impl StageHandler for LimitStage {
    fn name(&self) -> &'static str {
        "$limit"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        _ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        let mut f = SqlFragment::raw(PASSTHROUGH);
        f.push(input)
            .push(" s ORDER BY s.seq LIMIT ")
            .bind(count_param(self.n));
        Ok(f)
    }

    fn interpret(&self, mut rows: Vec<Row>, _ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        rows.truncate(usize::try_from(self.n).unwrap_or(usize::MAX));
        Ok(rows)
    }

    fn update_context(&self, _ctx: &mut PipelineContext<'_>) {}
}

// ---- $sample ----

/// Uniform random subset of `size` rows, kept in input order
pub struct SampleStage {
    size: u64,
}

impl SampleStage {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

impl StageHandler for SampleStage {
    fn name(&self) -> &'static str {
        "$sample"
    }

    fn compile_sql(
        &self,
        input: &str,
        _builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment> {
        // random() cannot be seeded
        if ctx.options.sample_seed.is_some() {
            return Err(decline("$sample", "seeded sampling"));
        }
        let mut f = SqlFragment::raw(PASSTHROUGH);
        f.push("(SELECT * FROM ")
            .push(input)
            .push(" ORDER BY random() LIMIT ")
            .bind(count_param(self.size))
            .push(") s");
        Ok(f)
    }

    fn interpret(&self, rows: Vec<Row>, ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>> {
        let amount = usize::try_from(self.size).unwrap_or(usize::MAX).min(rows.len());
        let mut picked = match ctx.options.sample_seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                rand::seq::index::sample(&mut rng, rows.len(), amount).into_vec()
            }
            None => rand::seq::index::sample(&mut rand::thread_rng(), rows.len(), amount).into_vec(),
        };
        picked.sort_unstable();

        let mut keep = vec![false; rows.len()];
        for i in picked {
            keep[i] = true;
        }
        Ok(rows
            .into_iter()
            .zip(keep)
            .filter_map(|(row, kept)| kept.then_some(row))
            .collect())
    }

    fn update_context(&self, _ctx: &mut PipelineContext<'_>) {}
}
