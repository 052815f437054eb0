//! Stage definitions

use serde_json::Value;

use crate::expression::Expression;
use crate::value::FieldPath;

use super::filter::FilterExpr;
use super::Pipeline;

/// Group accumulators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorOp {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    Push,
    AddToSet,
    First,
    Last,
}

impl AccumulatorOp {
    /// Looks an accumulator up by its `$name`
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => AccumulatorOp::Sum,
            "$count" => AccumulatorOp::Count,
            "$avg" => AccumulatorOp::Avg,
            "$min" => AccumulatorOp::Min,
            "$max" => AccumulatorOp::Max,
            "$push" => AccumulatorOp::Push,
            "$addToSet" => AccumulatorOp::AddToSet,
            "$first" => AccumulatorOp::First,
            "$last" => AccumulatorOp::Last,
            _ => return None,
        })
    }

    /// True when the result depends on input order
    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            AccumulatorOp::Push | AccumulatorOp::First | AccumulatorOp::Last
        )
    }
}

/// One output field of `$group`
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub name: String,
    pub op: AccumulatorOp,
    pub argument: Expression,
}

/// `$group`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub key: Expression,
    pub accumulators: Vec<Accumulator>,
}

/// `$unwind`
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindSpec {
    pub path: FieldPath,
    pub include_array_index: Option<FieldPath>,
    pub preserve_null_and_empty: bool,
}

/// `$lookup`
#[derive(Debug, Clone, PartialEq)]
pub struct LookupSpec {
    pub from: String,
    pub local_field: FieldPath,
    pub foreign_field: FieldPath,
    pub as_field: FieldPath,
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// How a `$project` field is produced
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expression),
}

/// Whether `$project` keeps or drops the listed fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectMode {
    Inclusion,
    Exclusion,
}

/// `$project`
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSpec {
    pub mode: ProjectMode,
    /// Fields other than `_id`, in specification order
    pub fields: Vec<(FieldPath, ProjectField)>,
    /// `_id` handling; `None` keeps the default (included)
    pub id: Option<ProjectField>,
}

impl ProjectSpec {
    /// True when `_id` survives the projection
    pub fn keeps_id(&self) -> bool {
        !matches!(self.id, Some(ProjectField::Exclude))
    }
}

/// The stage variants
#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    Match(FilterExpr),
    AddFields(Vec<(FieldPath, Expression)>),
    Project(ProjectSpec),
    Group(GroupSpec),
    Sort(Vec<(FieldPath, SortDirection)>),
    Skip(u64),
    Limit(u64),
    Unwind(UnwindSpec),
    Lookup(LookupSpec),
    Facet(Vec<(String, Pipeline)>),
    Unset(Vec<FieldPath>),
    Count(String),
    Sample(u64),
}

/// A parsed stage plus the JSON it was parsed from
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub spec: Value,
}

impl Stage {
    /// Creates a stage
    pub fn new(kind: StageKind, spec: Value) -> Self {
        Self { kind, spec }
    }

    /// The `$name` of the stage
    pub fn name(&self) -> &'static str {
        match &self.kind {
            StageKind::Match(_) => "$match",
            StageKind::AddFields(_) => "$addFields",
            StageKind::Project(_) => "$project",
            StageKind::Group(_) => "$group",
            StageKind::Sort(_) => "$sort",
            StageKind::Skip(_) => "$skip",
            StageKind::Limit(_) => "$limit",
            StageKind::Unwind(_) => "$unwind",
            StageKind::Lookup(_) => "$lookup",
            StageKind::Facet(_) => "$facet",
            StageKind::Unset(_) => "$unset",
            StageKind::Count(_) => "$count",
            StageKind::Sample(_) => "$sample",
        }
    }

    /// Every aggregation expression the stage evaluates (not `$match` predicates)
    pub fn expressions(&self) -> Vec<&Expression> {
        let mut out = Vec::new();
        match &self.kind {
            StageKind::Match(filter) => collect_filter_expressions(filter, &mut out),
            StageKind::AddFields(fields) => out.extend(fields.iter().map(|(_, e)| e)),
            StageKind::Project(spec) => {
                let fields = spec.fields.iter().map(|(_, f)| f).chain(spec.id.iter());
                for field in fields {
                    if let ProjectField::Computed(e) = field {
                        out.push(e);
                    }
                }
            }
            StageKind::Group(spec) => {
                out.push(&spec.key);
                out.extend(spec.accumulators.iter().map(|a| &a.argument));
            }
            StageKind::Facet(branches) => {
                for (_, pipeline) in branches {
                    for stage in pipeline.stages() {
                        out.extend(stage.expressions());
                    }
                }
            }
            _ => {}
        }
        out
    }

    /// Top-level fields this stage writes, or `None` when it reshapes the document
    pub fn written_fields(&self) -> Option<Vec<String>> {
        match &self.kind {
            StageKind::Match(_)
            | StageKind::Sort(_)
            | StageKind::Skip(_)
            | StageKind::Limit(_)
            | StageKind::Sample(_) => Some(Vec::new()),
            StageKind::AddFields(fields) => {
                Some(fields.iter().map(|(p, _)| p.root().to_string()).collect())
            }
            StageKind::Unset(paths) => Some(paths.iter().map(|p| p.root().to_string()).collect()),
            StageKind::Unwind(spec) => {
                let mut fields = vec![spec.path.root().to_string()];
                if let Some(index) = &spec.include_array_index {
                    fields.push(index.root().to_string());
                }
                Some(fields)
            }
            StageKind::Lookup(spec) => Some(vec![spec.as_field.root().to_string()]),
            StageKind::Project(_) | StageKind::Group(_) | StageKind::Facet(_) | StageKind::Count(_) => None,
        }
    }
}

fn collect_filter_expressions<'a>(filter: &'a FilterExpr, out: &mut Vec<&'a Expression>) {
    match filter {
        FilterExpr::Expr(e) => out.push(e),
        FilterExpr::And(items) | FilterExpr::Or(items) | FilterExpr::Nor(items) => {
            for item in items {
                collect_filter_expressions(item, out);
            }
        }
        FilterExpr::Not(inner) => collect_filter_expressions(inner, out),
        FilterExpr::Field(..) | FilterExpr::Text(_) => {}
    }
}
