//! Expression language shared by every tier
//!
//! - [`parser`]: JSON to [`Expression`] tree
//! - [`eval`]: direct evaluation (interpreter, and the staged tier's fallback steps)
//! - [`sql`]: translation to a SQL fragment with bound parameters
//! - [`complexity`]: the score behind tier selection
//!
//! The two execution modes must agree on every operator the translator
//! accepts; anything it cannot reproduce exactly is declined and evaluated
//! directly instead.

pub mod ast;
pub mod complexity;
pub mod date;
pub mod eval;
pub mod operators;
pub mod parser;
pub mod sql;

pub use ast::{Expression, Variable};
pub use complexity::{complexity, tier_for_score};
pub use eval::{evaluate, evaluate_field, evaluate_truthy, Scope};
pub use operators::{Operator, OperatorFamily};
pub use parser::parse_expression;
pub use sql::{
    each_sort_key, sort_key_json, sort_key_param, yields_remove, ExprTranslator, FieldSql, SqlExpr,
    SqlFragment, SqlKind, NO_PATH,
};
