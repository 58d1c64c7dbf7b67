// Rewrites the raw parse tree into the canonical AST the evaluator accepts
// Flattens paths, attaches predicates and groupings, and wraps tail calls in thunks

use std::sync::Arc;

use crate::ast::{AstNode, PathStep};
use crate::error::{Error, Result};

/// Canonicalize a raw AST. Pure: the input tree is consumed, nothing else is touched.
pub fn optimize(node: AstNode) -> Result<AstNode> {
    match node {
        AstNode::Name(name) => Ok(AstNode::name_path(name)),

        AstNode::Dot { lhs, rhs, position } => flatten_path(*lhs, *rhs, position),

        AstNode::Filter {
            lhs,
            condition,
            position,
        } => attach_filter(*lhs, condition.map(|c| *c), position),

        AstNode::GroupBy {
            lhs,
            pairs,
            position,
        } => {
            let lhs = optimize(*lhs)?;
            if matches!(lhs, AstNode::Group { .. }) {
                return Err(Error::syntax(
                    "S0210",
                    "Each step can only have one grouping expression",
                    position,
                    Some("{".to_string()),
                ));
            }
            Ok(AstNode::Group {
                lhs: Box::new(lhs),
                pairs: optimize_pairs(pairs)?,
                position,
            })
        }

        AstNode::OrderBy {
            lhs,
            terms,
            position,
        } => {
            let lhs = optimize(*lhs)?;
            let terms = terms
                .into_iter()
                .map(|mut term| {
                    term.expression = optimize(term.expression)?;
                    Ok(term)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(AstNode::Sort {
                lhs: Box::new(lhs),
                terms,
                position,
            })
        }

        AstNode::Assign { lhs, rhs, position } => match *lhs {
            AstNode::Variable(name) => Ok(AstNode::Bind {
                name,
                value: Box::new(optimize(*rhs)?),
            }),
            other => Err(Error::syntax(
                "S0212",
                "The left side of := must be a variable name (start with $)",
                position,
                Some(other.kind().to_string()),
            )),
        },

        AstNode::Pipe { lhs, rhs, position } => Ok(AstNode::Apply {
            lhs: Box::new(optimize(*lhs)?),
            rhs: Box::new(optimize(*rhs)?),
            position,
        }),

        AstNode::Negate { operand, position } => match optimize(*operand)? {
            AstNode::Number(n) => Ok(AstNode::Number(-n)),
            operand => Ok(AstNode::Negate {
                operand: Box::new(operand),
                position,
            }),
        },

        AstNode::Binary {
            op,
            lhs,
            rhs,
            position,
        } => Ok(AstNode::Binary {
            op,
            lhs: Box::new(optimize(*lhs)?),
            rhs: Box::new(optimize(*rhs)?),
            position,
        }),

        AstNode::Array(items) => Ok(AstNode::Array(optimize_all(items)?)),

        AstNode::Object { pairs, position } => Ok(AstNode::Object {
            pairs: optimize_pairs(pairs)?,
            position,
        }),

        AstNode::Block(expressions) => Ok(AstNode::Block(optimize_all(expressions)?)),

        AstNode::Condition {
            test,
            then,
            otherwise,
        } => Ok(AstNode::Condition {
            test: Box::new(optimize(*test)?),
            then: Box::new(optimize(*then)?),
            otherwise: otherwise.map(|o| optimize(*o).map(Box::new)).transpose()?,
        }),

        AstNode::Function {
            procedure,
            args,
            position,
        } => Ok(AstNode::Function {
            procedure: Box::new(optimize(*procedure)?),
            args: optimize_all(args)?,
            position,
        }),

        AstNode::Partial {
            procedure,
            args,
            position,
        } => Ok(AstNode::Partial {
            procedure: Box::new(optimize(*procedure)?),
            args: optimize_all(args)?,
            position,
        }),

        AstNode::Lambda {
            params,
            body,
            signature,
            thunk,
        } => {
            let body = optimize(unwrap_arc(body))?;
            let body = if thunk { body } else { tail_call_optimize(body) };
            Ok(AstNode::Lambda {
                params,
                body: Arc::new(body),
                signature,
                thunk,
            })
        }

        AstNode::Transform {
            pattern,
            update,
            delete,
            position,
        } => Ok(AstNode::Transform {
            pattern: Arc::new(optimize(unwrap_arc(pattern))?),
            update: Arc::new(optimize(unwrap_arc(update))?),
            delete: delete
                .map(|d| optimize(unwrap_arc(d)).map(Arc::new))
                .transpose()?,
            position,
        }),

        AstNode::Predicate {
            lhs,
            condition,
            position,
        } => Ok(AstNode::Predicate {
            lhs: Box::new(optimize(*lhs)?),
            condition: Box::new(optimize(*condition)?),
            position,
        }),

        AstNode::Bind { name, value } => Ok(AstNode::Bind {
            name,
            value: Box::new(optimize(*value)?),
        }),

        AstNode::Apply { lhs, rhs, position } => Ok(AstNode::Apply {
            lhs: Box::new(optimize(*lhs)?),
            rhs: Box::new(optimize(*rhs)?),
            position,
        }),

        AstNode::Sort {
            lhs,
            terms,
            position,
        } => Ok(AstNode::Sort {
            lhs: Box::new(optimize(*lhs)?),
            terms,
            position,
        }),

        AstNode::Group {
            lhs,
            pairs,
            position,
        } => Ok(AstNode::Group {
            lhs: Box::new(optimize(*lhs)?),
            pairs,
            position,
        }),

        // Already canonical
        other @ (AstNode::String(_)
        | AstNode::Number(_)
        | AstNode::Boolean(_)
        | AstNode::Null
        | AstNode::Regex(_)
        | AstNode::Variable(_)
        | AstNode::Wildcard
        | AstNode::Descendant
        | AstNode::Path { .. }
        | AstNode::Placeholder
        | AstNode::Error { .. }) => Ok(other),
    }
}

fn optimize_all(nodes: Vec<AstNode>) -> Result<Vec<AstNode>> {
    nodes.into_iter().map(optimize).collect()
}

fn optimize_pairs(pairs: Vec<(AstNode, AstNode)>) -> Result<Vec<(AstNode, AstNode)>> {
    pairs
        .into_iter()
        .map(|(k, v)| Ok((optimize(k)?, optimize(v)?)))
        .collect()
}

fn unwrap_arc(node: Arc<AstNode>) -> AstNode {
    Arc::try_unwrap(node).unwrap_or_else(|shared| (*shared).clone())
}

/// Split an optimized node into path steps and the path's keep flag
fn into_steps(node: AstNode) -> (Vec<PathStep>, bool) {
    match node {
        AstNode::Path {
            steps,
            keep_singleton_array,
        } => (steps, keep_singleton_array),
        other => (vec![PathStep::new(other)], false),
    }
}

fn flatten_path(lhs: AstNode, rhs: AstNode, position: usize) -> Result<AstNode> {
    let (mut steps, lhs_keep) = into_steps(optimize(lhs)?);
    let (rest, rhs_keep) = into_steps(optimize(rhs)?);
    steps.extend(rest);

    for step in steps.iter_mut() {
        match &step.node {
            AstNode::Number(_) | AstNode::Boolean(_) | AstNode::Null => {
                let value = match &step.node {
                    AstNode::Number(n) => crate::value::format_number(*n),
                    AstNode::Boolean(b) => b.to_string(),
                    _ => "null".to_string(),
                };
                return Err(Error::syntax(
                    "S0213",
                    format!(
                        "The literal value {} cannot be used as a step within a path expression",
                        value
                    ),
                    position,
                    Some(value),
                ));
            }
            AstNode::String(s) => step.node = AstNode::Name(s.clone()),
            _ => {}
        }
    }

    let last = steps.len() - 1;
    for (index, step) in steps.iter_mut().enumerate() {
        step.cons_array = matches!(step.node, AstNode::Array(_)) && (index == 0 || index == last);
    }

    Ok(AstNode::Path {
        steps,
        keep_singleton_array: lhs_keep || rhs_keep,
    })
}

fn attach_filter(lhs: AstNode, condition: Option<AstNode>, position: usize) -> Result<AstNode> {
    let lhs = optimize(lhs)?;

    let Some(condition) = condition else {
        // `[]`: keep the result in array form
        let (steps, _) = into_steps(lhs);
        return Ok(AstNode::Path {
            steps,
            keep_singleton_array: true,
        });
    };

    if matches!(lhs, AstNode::Group { .. }) {
        return Err(Error::syntax(
            "S0209",
            "A predicate cannot follow a grouping expression in a step",
            position,
            Some("[".to_string()),
        ));
    }

    let condition = optimize(condition)?;
    match lhs {
        AstNode::Path {
            mut steps,
            keep_singleton_array,
        } => {
            let Some(last) = steps.last_mut() else {
                return Err(Error::syntax("S0201", "Syntax error: \"[\"", position, None));
            };
            if matches!(last.node, AstNode::Group { .. }) {
                return Err(Error::syntax(
                    "S0209",
                    "A predicate cannot follow a grouping expression in a step",
                    position,
                    Some("[".to_string()),
                ));
            }
            last.stages.push(condition);
            Ok(AstNode::Path {
                steps,
                keep_singleton_array,
            })
        }
        other => Ok(AstNode::Predicate {
            lhs: Box::new(other),
            condition: Box::new(condition),
            position,
        }),
    }
}

/// Wrap a call in tail position into a zero-argument thunk lambda
fn tail_call_optimize(node: AstNode) -> AstNode {
    match node {
        call @ AstNode::Function { .. } => AstNode::Lambda {
            params: Vec::new(),
            body: Arc::new(call),
            signature: None,
            thunk: true,
        },
        AstNode::Condition {
            test,
            then,
            otherwise,
        } => AstNode::Condition {
            test,
            then: Box::new(tail_call_optimize(*then)),
            otherwise: otherwise.map(|o| Box::new(tail_call_optimize(*o))),
        },
        AstNode::Block(mut expressions) => {
            if let Some(last) = expressions.pop() {
                expressions.push(tail_call_optimize(last));
            }
            AstNode::Block(expressions)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn canonical(source: &str) -> AstNode {
        optimize(parse(source).unwrap()).unwrap()
    }

    fn step_names(node: &AstNode) -> Vec<String> {
        match node {
            AstNode::Path { steps, .. } => steps
                .iter()
                .map(|s| match &s.node {
                    AstNode::Name(n) => n.clone(),
                    other => other.kind().to_string(),
                })
                .collect(),
            other => panic!("expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_name_becomes_path() {
        assert_eq!(canonical("foo"), AstNode::name_path("foo"));
    }

    #[test]
    fn test_dot_chain_flattens() {
        let ast = canonical("a.b.c.d");
        assert_eq!(step_names(&ast), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_string_step_becomes_name() {
        let ast = canonical("a.\"b c\"");
        assert_eq!(step_names(&ast), vec!["a", "b c"]);
    }

    #[test]
    fn test_literal_step_is_rejected() {
        let err = optimize(parse("a.1").unwrap()).unwrap_err();
        assert_eq!(err.code, "S0213");
        assert_eq!(err.position, Some(2));
        assert_eq!(err.token.as_deref(), Some("1"));

        let err = optimize(parse("a.b.c.true").unwrap()).unwrap_err();
        assert_eq!(err.position, Some(6));
    }

    #[test]
    fn test_predicate_attaches_to_step() {
        let ast = canonical("a[0].b");
        match ast {
            AstNode::Path { steps, .. } => {
                assert_eq!(steps[0].stages, vec![AstNode::Number(0.0)]);
                assert!(steps[1].stages.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_predicate_on_non_path() {
        let ast = canonical("[10, 20, 30][-1]");
        match ast {
            AstNode::Predicate { condition, .. } => {
                assert_eq!(*condition, AstNode::Number(-1.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_brackets_keep_array() {
        match canonical("a.b[]") {
            AstNode::Path {
                keep_singleton_array,
                ..
            } => assert!(keep_singleton_array),
            other => panic!("unexpected {:?}", other),
        }
        match canonical("a[].b") {
            AstNode::Path {
                keep_singleton_array,
                steps,
            } => {
                assert!(keep_singleton_array);
                assert_eq!(steps.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cons_array_flag() {
        match canonical("[1, 2].$") {
            AstNode::Path { steps, .. } => assert!(steps[0].cons_array),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_grouping_errors() {
        let err = optimize(parse("a{\"x\": 1}{\"y\": 2}").unwrap()).unwrap_err();
        assert_eq!(err.code, "S0210");
        let err = optimize(parse("a{\"x\": 1}[0]").unwrap()).unwrap_err();
        assert_eq!(err.code, "S0209");
    }

    #[test]
    fn test_assign_requires_variable() {
        assert!(matches!(canonical("$x := 1"), AstNode::Bind { .. }));
        let err = optimize(parse("a := 1").unwrap()).unwrap_err();
        assert_eq!(err.code, "S0212");
    }

    #[test]
    fn test_unary_minus_folds() {
        assert_eq!(canonical("-5"), AstNode::Number(-5.0));
        assert!(matches!(canonical("-a"), AstNode::Negate { .. }));
    }

    #[test]
    fn test_tail_calls_become_thunks() {
        let ast = canonical("function($n, $acc){ $n = 0 ? $acc : $f($n - 1, $acc + $n) }");
        let body = match ast {
            AstNode::Lambda { body, .. } => body,
            other => panic!("unexpected {:?}", other),
        };
        match &*body {
            AstNode::Condition { then, otherwise, .. } => {
                assert!(matches!(**then, AstNode::Path { .. }));
                assert!(matches!(
                    otherwise.as_deref(),
                    Some(AstNode::Lambda { thunk: true, .. })
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_tail_call_is_left_alone() {
        let ast = canonical("function($n){ 1 + $f($n) }");
        match ast {
            AstNode::Lambda { body, .. } => assert!(matches!(*body, AstNode::Binary { .. })),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let once = canonical("a.b[c > 1]^(>d){e: $sum(f)} ~> $count");
        let twice = optimize(once.clone()).unwrap();
        assert_eq!(once, twice);
    }
}
