//! Stage handlers
//!
//! One handler per stage kind. Each handler can:
//!
//! - extend a CTE chain with one SELECT over its input relation
//!   ([`StageHandler::compile_sql`]), used by the SQL and staged tiers
//! - transform rows in memory ([`StageHandler::interpret`]), used by the
//!   interpreter and by the staged tier for stages that decline SQL
//!
//! A compiled stage reads its input as `s` and yields the relation columns
//! `seq, id, root_payload, data` (see [`crate::compiler::builder`]).

mod count;
mod facet;
mod fields;
mod filter;
mod group;
mod lookup;
mod order;
mod unwind;

pub use count::CountStage;
pub use facet::FacetStage;
pub use fields::{AddFieldsStage, ProjectStage, UnsetStage};
pub use filter::FilterStage;
pub use group::GroupStage;
pub use lookup::LookupStage;
pub use order::{LimitStage, SampleStage, SkipStage, SortStage};
pub use unwind::UnwindStage;

use std::collections::HashMap;

use crate::compiler::CteBuilder;
use crate::errors::{AggregationError, AggregationResult};
use crate::expression::{ExprTranslator, SqlFragment, SqlKind};
use crate::pipeline::{PipelineContext, Row, Stage, StageKind};
use crate::storage::{Capabilities, SqlValue};
use crate::value::FieldPath;

/// Behaviour shared by every stage kind
pub trait StageHandler {
    /// `$name` of the stage
    fn name(&self) -> &'static str;

    /// SELECT producing this stage's relation from `input`.
    ///
    /// Declines with a fallback error when the stage or one of its
    /// expressions has no exact SQL form.
    fn compile_sql(
        &self,
        input: &str,
        builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<SqlFragment>;

    /// Appends this stage to the chain; returns the name of its relation
    fn materialize_sql(
        &self,
        input: &str,
        builder: &mut CteBuilder,
        ctx: &mut PipelineContext<'_>,
    ) -> AggregationResult<String> {
        let select = self.compile_sql(input, builder, ctx)?;
        let name = ctx.stage_label();
        builder.push(name.clone(), select);
        Ok(name)
    }

    /// Applies the stage to in-memory rows
    fn interpret(&self, rows: Vec<Row>, ctx: &PipelineContext<'_>) -> AggregationResult<Vec<Row>>;

    /// True when each output row depends on one input row only, so the
    /// stage can run batch by batch
    fn streams(&self) -> bool {
        false
    }

    /// Records what the stage did to the top-level fields
    fn update_context(&self, ctx: &mut PipelineContext<'_>) {
        ctx.reset_fields();
    }
}

/// Handler for a parsed stage
pub fn handler_for(stage: &Stage) -> Box<dyn StageHandler + '_> {
    match &stage.kind {
        StageKind::Match(filter) => Box::new(FilterStage::new(filter)),
        StageKind::AddFields(fields) => Box::new(AddFieldsStage::new(fields)),
        StageKind::Project(spec) => Box::new(ProjectStage::new(spec)),
        StageKind::Unset(paths) => Box::new(UnsetStage::new(paths)),
        StageKind::Group(spec) => Box::new(GroupStage::new(spec)),
        StageKind::Sort(keys) => Box::new(SortStage::new(keys)),
        StageKind::Skip(n) => Box::new(SkipStage::new(*n)),
        StageKind::Limit(n) => Box::new(LimitStage::new(*n)),
        StageKind::Sample(n) => Box::new(SampleStage::new(*n)),
        StageKind::Unwind(spec) => Box::new(UnwindStage::new(spec)),
        StageKind::Lookup(spec) => Box::new(LookupStage::new(spec)),
        StageKind::Facet(branches) => Box::new(FacetStage::new(branches)),
        StageKind::Count(field) => Box::new(CountStage::new(field)),
    }
}

/// Translator over the input row `s`
pub(crate) fn row_translator(
    caps: Capabilities,
    known: &HashMap<String, SqlKind>,
) -> ExprTranslator<'_> {
    ExprTranslator::new("s.data", "s.root_payload", caps).with_known_fields(known)
}

/// SQL JSON path of a field, declining paths the engine cannot address
pub(crate) fn json_path(path: &FieldPath) -> AggregationResult<String> {
    path.json_path()
        .ok_or_else(|| AggregationError::unsupported_expression(format!("field path '{}'", path)))
}

/// Row count bound as a parameter
pub(crate) fn count_param(n: u64) -> SqlValue {
    SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

/// `SELECT s.seq, s.id, s.root_payload, <data> FROM input s`
pub(crate) fn select_with_data(input: &str, data: &SqlFragment) -> SqlFragment {
    let mut f = SqlFragment::raw("SELECT s.seq, s.id, s.root_payload, ");
    f.append(data).push(" AS data FROM ").push(input).push(" s");
    f
}

/// Declines a stage the current engine cannot express
pub(crate) fn decline(stage: &str, reason: &str) -> AggregationError {
    AggregationError::unsupported_stage(stage, reason)
}
