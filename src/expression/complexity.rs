//! Expression complexity and the tier hint derived from it
//!
//! Score = 1, plus for every operator node: +1 when it is nested below
//! another operator, +1 when arithmetic, +2 when conditional, +2 when it
//! works on arrays.

use crate::aggregator::Tier;

use super::ast::Expression;
use super::operators::OperatorFamily;

/// Highest score routed to the SQL tier
pub const SQL_TIER_MAX_SCORE: u32 = 2;
/// Highest score routed to the staged tier
pub const STAGED_TIER_MAX_SCORE: u32 = 8;

/// Complexity score of an expression
pub fn complexity(expr: &Expression) -> u32 {
    1 + operator_weight(expr, false)
}

fn operator_weight(expr: &Expression, nested: bool) -> u32 {
    match expr {
        Expression::Operator(op, args) => {
            let mut weight = if nested { 1 } else { 0 };
            weight += match op.family() {
                OperatorFamily::Arithmetic => 1,
                OperatorFamily::Conditional | OperatorFamily::Array => 2,
                _ => 0,
            };
            weight + args.iter().map(|a| operator_weight(a, true)).sum::<u32>()
        }
        // Literal containers do not nest operators any deeper
        Expression::Object(fields) => fields.iter().map(|(_, v)| operator_weight(v, nested)).sum(),
        Expression::Array(items) => items.iter().map(|i| operator_weight(i, nested)).sum(),
        Expression::Literal(_) | Expression::FieldRef(_) | Expression::Variable(..) => 0,
    }
}

/// First tier worth attempting for a given score
pub fn tier_for_score(score: u32) -> Tier {
    if score <= SQL_TIER_MAX_SCORE {
        Tier::Sql
    } else if score <= STAGED_TIER_MAX_SCORE {
        Tier::Staged
    } else {
        Tier::Interpreter
    }
}
