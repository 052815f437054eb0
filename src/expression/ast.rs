//! Expression tree

use std::collections::HashSet;

use serde_json::Value;

use crate::value::FieldPath;

use super::operators::Operator;

/// A `$$` variable reference
#[derive(Debug, Clone, PartialEq)]
pub enum Variable {
    /// `$$ROOT`: the document entering the pipeline
    Root,
    /// `$$CURRENT`: the document entering the current stage
    Current,
    /// `$$REMOVE`: drops the field it is assigned to
    Remove,
    /// A variable bound by `$let`, `$map`, `$filter` or `$reduce`
    User(String),
}

/// A parsed aggregation expression.
///
/// Object-form operator arguments are normalized into positional order by
/// the parser (see [`Operator::named_params`]), so every operator node holds
/// a plain argument list.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// A constant
    Literal(Value),
    /// `"$a.b"`
    FieldRef(FieldPath),
    /// `"$$NAME"` or `"$$NAME.a.b"`
    Variable(Variable, Option<FieldPath>),
    /// `{"$op": args}`
    Operator(Operator, Vec<Expression>),
    /// An object literal whose values are expressions
    Object(Vec<(String, Expression)>),
    /// An array literal whose elements are expressions
    Array(Vec<Expression>),
}

impl Expression {
    /// Shorthand for a field reference
    pub fn field(path: FieldPath) -> Self {
        Expression::FieldRef(path)
    }

    /// Returns the literal value, if this is a constant
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Expression::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// True for a bare `$$REMOVE`
    pub fn is_remove(&self) -> bool {
        matches!(self, Expression::Variable(Variable::Remove, None))
    }

    /// Visits this node and every descendant, depth first
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expression)) {
        visit(self);
        match self {
            Expression::Operator(_, args) | Expression::Array(args) => {
                for arg in args {
                    arg.walk(visit);
                }
            }
            Expression::Object(fields) => {
                for (_, value) in fields {
                    value.walk(visit);
                }
            }
            Expression::Literal(_) | Expression::FieldRef(_) | Expression::Variable(..) => {}
        }
    }

    /// Top-level field names this expression reads from the current document.
    ///
    /// `$$CURRENT.a` counts as a read of `a`; a bare `$$ROOT` or `$$CURRENT`
    /// reads everything and is reported through [`Expression::reads_whole_document`].
    pub fn referenced_fields(&self) -> HashSet<String> {
        let mut fields = HashSet::new();
        self.walk(&mut |node| match node {
            Expression::FieldRef(path) => {
                fields.insert(path.root().to_string());
            }
            Expression::Variable(Variable::Current, Some(path)) => {
                fields.insert(path.root().to_string());
            }
            _ => {}
        });
        fields
    }

    /// True when the expression reads the whole current or root document
    pub fn reads_whole_document(&self) -> bool {
        let mut whole = false;
        self.walk(&mut |node| {
            if let Expression::Variable(Variable::Root | Variable::Current, path) = node {
                // $$ROOT.a still depends on the pipeline input, not the stage input
                if path.is_none() || matches!(node, Expression::Variable(Variable::Root, _)) {
                    whole = true;
                }
            }
        });
        whole
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    #[test]
    fn test_referenced_fields() {
        let expr = Expression::Operator(
            Operator::Add,
            vec![
                Expression::FieldRef(path("a.b")),
                Expression::Variable(Variable::Current, Some(path("c"))),
                Expression::Literal(json!(1)),
            ],
        );
        let fields = expr.referenced_fields();
        assert!(fields.contains("a"));
        assert!(fields.contains("c"));
        assert_eq!(fields.len(), 2);
        assert!(!expr.reads_whole_document());
    }

    #[test]
    fn test_whole_document_reads() {
        assert!(Expression::Variable(Variable::Root, None).reads_whole_document());
        assert!(Expression::Variable(Variable::Root, Some(path("a"))).reads_whole_document());
        assert!(Expression::Variable(Variable::Current, None).reads_whole_document());
        assert!(!Expression::Variable(Variable::Remove, None).reads_whole_document());
    }
}
