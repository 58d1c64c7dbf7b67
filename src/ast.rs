// Abstract Syntax Tree definitions
// The parser emits raw nodes; the optimizer rewrites them into the canonical subset

use std::sync::Arc;

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::signature::Signature;

/// A step in a path expression with its attached predicate stages
///
/// Predicates written after a step (`a.b[0]`) are applied to the result of
/// evaluating that step against each input, not to the whole path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathStep {
    /// The main step node (field name, wildcard, etc.)
    pub node: AstNode,
    /// Predicate conditions applied in order during this step
    pub stages: Vec<AstNode>,
    /// Array constructor in first or last position; its array is kept whole
    pub cons_array: bool,
}

/// One `^(...)` term
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortTerm {
    pub expression: AstNode,
    pub descending: bool,
}

/// Compiled regex literal (`/pattern/flags`)
#[derive(Debug, Clone)]
pub struct RegexLiteral {
    pub pattern: String,
    pub flags: String,
    pub compiled: Arc<Regex>,
}

impl PartialEq for RegexLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.flags == other.flags
    }
}

impl Serialize for RegexLiteral {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("/{}/{}", self.pattern, self.flags))
    }
}

/// AST Node types
///
/// Canonical nodes are the ones the evaluator accepts. The variants under
/// "Raw nodes" only exist between parsing and optimization; the evaluator
/// rejects them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AstNode {
    /// String literal (e.g., "hello", 'world')
    String(String),

    /// Number literal
    Number(f64),

    /// Boolean literal
    Boolean(bool),

    /// Null literal
    Null,

    /// Regex literal
    Regex(RegexLiteral),

    /// Field name (e.g., foo in foo.bar). Only appears as a path step once optimized.
    Name(String),

    /// Variable reference: `""` is `$`, `"$"` is `$$`, anything else `$name`
    Variable(String),

    /// Wildcard operator (*)
    Wildcard,

    /// Descendant operator (**)
    Descendant,

    /// Path expression (e.g., foo.bar[0].baz)
    Path {
        steps: Vec<PathStep>,
        /// Set by a `[]` suffix anywhere in the path
        keep_singleton_array: bool,
    },

    /// Filter applied to a non-path expression (e.g., `$x[0]`, `[1,2,3][-1]`)
    Predicate {
        lhs: Box<AstNode>,
        condition: Box<AstNode>,
        position: usize,
    },

    /// Binary operation
    Binary {
        op: BinaryOp,
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        position: usize,
    },

    /// Unary negation
    Negate {
        operand: Box<AstNode>,
        position: usize,
    },

    /// Array constructor
    Array(Vec<AstNode>),

    /// Object constructor over the whole input
    Object {
        pairs: Vec<(AstNode, AstNode)>,
        position: usize,
    },

    /// Variable binding `$name := value`
    Bind {
        name: String,
        value: Box<AstNode>,
    },

    /// Block expression `( a; b; c )`
    Block(Vec<AstNode>),

    /// Conditional expression (? :)
    Condition {
        test: Box<AstNode>,
        then: Box<AstNode>,
        otherwise: Option<Box<AstNode>>,
    },

    /// Order-by `lhs^(<a, >b)`
    Sort {
        lhs: Box<AstNode>,
        terms: Vec<SortTerm>,
        position: usize,
    },

    /// Grouping clause `lhs{key: value}`
    Group {
        lhs: Box<AstNode>,
        pairs: Vec<(AstNode, AstNode)>,
        position: usize,
    },

    /// Function invocation; `procedure` is any expression yielding a function
    Function {
        procedure: Box<AstNode>,
        args: Vec<AstNode>,
        position: usize,
    },

    /// Invocation containing `?` placeholders
    Partial {
        procedure: Box<AstNode>,
        args: Vec<AstNode>,
        position: usize,
    },

    /// Placeholder for partial application (?)
    Placeholder,

    /// Lambda function definition
    Lambda {
        params: Vec<String>,
        body: Arc<AstNode>,
        signature: Option<Arc<Signature>>,
        /// Zero-argument wrapper around a call in tail position
        thunk: bool,
    },

    /// `lhs ~> rhs`
    Apply {
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        position: usize,
    },

    /// Transform operator |pattern|update[,delete]|
    Transform {
        pattern: Arc<AstNode>,
        update: Arc<AstNode>,
        delete: Option<Arc<AstNode>>,
        position: usize,
    },

    /// Syntax error recorded by a recovering parse, with the unconsumed tokens
    Error {
        code: &'static str,
        message: String,
        position: usize,
        token: Option<String>,
        remaining: Vec<String>,
    },

    // ── Raw nodes ───────────────────────────────────────────────────────────
    /// `lhs.rhs` before path flattening
    Dot {
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        position: usize,
    },

    /// `lhs[condition]`; `None` for the empty `[]` suffix
    Filter {
        lhs: Box<AstNode>,
        condition: Option<Box<AstNode>>,
        position: usize,
    },

    /// `lhs{...}` before it becomes a group
    GroupBy {
        lhs: Box<AstNode>,
        pairs: Vec<(AstNode, AstNode)>,
        position: usize,
    },

    /// `lhs^(...)` before it becomes a sort
    OrderBy {
        lhs: Box<AstNode>,
        terms: Vec<SortTerm>,
        position: usize,
    },

    /// `lhs := rhs` before the target is checked
    Assign {
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        position: usize,
    },

    /// `lhs ~> rhs` before it becomes an apply
    Pipe {
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
        position: usize,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // Logical
    And,
    Or,

    // String
    Concatenate,

    // Range
    Range,

    // Membership
    In,

    // Coalescing
    Coalesce, // ??

    // Default
    Default, // ?:
}

impl BinaryOp {
    /// Operator as written in source, for error messages
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Concatenate => "&",
            BinaryOp::Range => "..",
            BinaryOp::In => "in",
            BinaryOp::Coalesce => "??",
            BinaryOp::Default => "?:",
        }
    }
}

impl PathStep {
    /// Create a path step from a node without stages
    pub fn new(node: AstNode) -> Self {
        PathStep {
            node,
            stages: Vec::new(),
            cons_array: false,
        }
    }
}

impl AstNode {
    /// Create a string literal node
    pub fn string(s: impl Into<String>) -> Self {
        AstNode::String(s.into())
    }

    /// Create a variable reference node
    pub fn variable(name: impl Into<String>) -> Self {
        AstNode::Variable(name.into())
    }

    /// Single-step path for a field name
    pub fn name_path(name: impl Into<String>) -> Self {
        AstNode::Path {
            steps: vec![PathStep::new(AstNode::Name(name.into()))],
            keep_singleton_array: false,
        }
    }

    /// Source position carried by the node, if any
    pub fn position(&self) -> Option<usize> {
        match self {
            AstNode::Predicate { position, .. }
            | AstNode::Binary { position, .. }
            | AstNode::Negate { position, .. }
            | AstNode::Object { position, .. }
            | AstNode::Sort { position, .. }
            | AstNode::Group { position, .. }
            | AstNode::Function { position, .. }
            | AstNode::Partial { position, .. }
            | AstNode::Apply { position, .. }
            | AstNode::Transform { position, .. }
            | AstNode::Error { position, .. }
            | AstNode::Dot { position, .. }
            | AstNode::Filter { position, .. }
            | AstNode::GroupBy { position, .. }
            | AstNode::OrderBy { position, .. }
            | AstNode::Assign { position, .. }
            | AstNode::Pipe { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Node kinds that only exist before optimization
    pub fn is_raw(&self) -> bool {
        matches!(
            self,
            AstNode::Dot { .. }
                | AstNode::Filter { .. }
                | AstNode::GroupBy { .. }
                | AstNode::OrderBy { .. }
                | AstNode::Assign { .. }
                | AstNode::Pipe { .. }
        )
    }

    /// Short kind name used in logs and diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            AstNode::String(_) => "string",
            AstNode::Number(_) => "number",
            AstNode::Boolean(_) | AstNode::Null => "value",
            AstNode::Regex(_) => "regex",
            AstNode::Name(_) => "name",
            AstNode::Variable(_) => "variable",
            AstNode::Wildcard => "wildcard",
            AstNode::Descendant => "descendant",
            AstNode::Path { .. } => "path",
            AstNode::Predicate { .. } => "predicate",
            AstNode::Binary { .. } => "binary",
            AstNode::Negate { .. } => "unary",
            AstNode::Array(_) => "array",
            AstNode::Object { .. } => "object",
            AstNode::Bind { .. } => "bind",
            AstNode::Block(_) => "block",
            AstNode::Condition { .. } => "condition",
            AstNode::Sort { .. } => "sort",
            AstNode::Group { .. } => "group",
            AstNode::Function { .. } => "function",
            AstNode::Partial { .. } => "partial",
            AstNode::Placeholder => "placeholder",
            AstNode::Lambda { .. } => "lambda",
            AstNode::Apply { .. } => "apply",
            AstNode::Transform { .. } => "transform",
            AstNode::Error { .. } => "error",
            AstNode::Dot { .. } => "dot",
            AstNode::Filter { .. } => "filter",
            AstNode::GroupBy { .. } => "groupby",
            AstNode::OrderBy { .. } => "orderby",
            AstNode::Assign { .. } => "assign",
            AstNode::Pipe { .. } => "pipe",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_path() {
        let node = AstNode::name_path("foo");
        match node {
            AstNode::Path { steps, keep_singleton_array } => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].node, AstNode::Name("foo".to_string()));
                assert!(!keep_singleton_array);
            }
            other => panic!("expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_kinds() {
        let dot = AstNode::Dot {
            lhs: Box::new(AstNode::Name("a".into())),
            rhs: Box::new(AstNode::Name("b".into())),
            position: 2,
        };
        assert!(dot.is_raw());
        assert_eq!(dot.position(), Some(2));
        assert!(!AstNode::name_path("a").is_raw());
    }

    #[test]
    fn test_canonical_ast_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AstNode>();
    }
}
