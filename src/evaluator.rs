// Expression evaluator
// Walks the canonical AST over Sequence boxes; function application runs through a trampoline

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::ast::{AstNode, BinaryOp, PathStep, SortTerm};
use crate::environment::{Env, Environment, FrameGuard};
use crate::error::{Error, Result};
use crate::procedure::{
    CallContext, Lambda, PartialApplication, PartialArg, Procedure, Retained, Transformer,
};
use crate::sequence::Sequence;
use crate::signature::Signature;
use crate::value::JValue;

/// Largest sequence the range operator may allocate
const MAX_RANGE_SIZE: f64 = 1e7;

/// Limits applied to a single evaluation
#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Maximum nesting of evaluate calls before U1001
    pub max_depth: usize,
    /// Native stack, in bytes, one evaluation may use before U1001.
    ///
    /// Keeps deep non-tail recursion an error rather than a stack overflow on
    /// threads with the default 2 MiB stack.
    pub max_stack: usize,
    /// Optional cap on the total number of evaluate calls
    pub max_steps: Option<u64>,
}

impl Default for EvalOptions {
    fn default() -> Self {
        EvalOptions {
            max_depth: 302,
            max_stack: 1024 * 1024,
            max_steps: None,
        }
    }
}

/// Evaluator for canonical ASTs
///
/// One evaluator serves one top-level evaluation: it owns the depth and step
/// counters, the timestamp `$now()`/`$millis()` report, and the frames that
/// may form reference cycles with the closures bound into them. Those frames
/// are cleared when the evaluator drops, unless [`Evaluator::release_frames`]
/// hands them to the functions in the result.
pub struct Evaluator {
    options: EvalOptions,
    depth: usize,
    stack_base: usize,
    steps: u64,
    timestamp: DateTime<Utc>,
    closure_frames: FrameGuard,
}

impl Evaluator {
    pub fn new(options: EvalOptions) -> Self {
        Evaluator {
            options,
            depth: 0,
            stack_base: 0,
            steps: 0,
            timestamp: Utc::now(),
            closure_frames: FrameGuard::default(),
        }
    }

    /// Instant fixed at the start of the evaluation
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn options(&self) -> &EvalOptions {
        &self.options
    }

    /// Evaluate a node against an input in a frame
    ///
    /// Every result passes through [`Sequence::collapse`], so a one-element
    /// sequence is only ever observed when a `[]` path asked for it.
    pub fn evaluate(&mut self, node: &AstNode, input: &Sequence, env: &Env) -> Result<Sequence> {
        let here = stack_address();
        if self.depth == 0 {
            self.stack_base = here;
        }
        self.depth += 1;
        if self.depth > self.options.max_depth
            || self.stack_base.abs_diff(here) > self.options.max_stack
        {
            self.depth -= 1;
            return Err(Error::new(
                "U1001",
                "Stack overflow error: Check for non-terminating recursive function.  \
                 Consider rewriting as tail-recursive.",
            )
            .or_position(node.position()));
        }
        self.steps += 1;
        if let Some(limit) = self.options.max_steps {
            if self.steps > limit {
                self.depth -= 1;
                return Err(Error::new(
                    "U1001",
                    "Expression evaluation timeout: Check for infinite loop",
                )
                .or_position(node.position()));
            }
        }

        let result = self.evaluate_internal(node, input, env);

        self.depth -= 1;
        result
            .map(Sequence::collapse)
            .map_err(|e| e.or_position(node.position()))
    }

    // Arms with locals of their own are out-of-line helpers; this frame
    // repeats on the native stack once per nesting level.
    fn evaluate_internal(&mut self, node: &AstNode, input: &Sequence, env: &Env) -> Result<Sequence> {
        match node {
            AstNode::String(s) => Ok(Sequence::from(JValue::string(s.as_str()))),
            AstNode::Number(n) => Ok(Sequence::from(JValue::Number(*n))),
            AstNode::Boolean(b) => Ok(Sequence::from(JValue::Bool(*b))),
            AstNode::Null => Ok(Sequence::from(JValue::Null)),
            AstNode::Regex(regex) => Ok(Sequence::from(JValue::Regex(Arc::clone(&regex.compiled)))),

            AstNode::Name(name) => Ok(lookup_field(input, name)),
            AstNode::Variable(name) if name.is_empty() => Ok(input.clone()),
            AstNode::Variable(name) => Ok(env.lookup(name)),
            AstNode::Wildcard => Ok(wildcard(input)),
            AstNode::Descendant => Ok(descendants(input)),

            AstNode::Path {
                steps,
                keep_singleton_array,
            } => self.evaluate_path(steps, *keep_singleton_array, input, env),

            AstNode::Predicate { lhs, condition, .. } => self.evaluate_predicate(lhs, condition, input, env),

            AstNode::Binary { op, lhs, rhs, .. } => self.evaluate_binary(*op, lhs, rhs, input, env),

            AstNode::Negate { operand, .. } => self.evaluate_negate(operand, input, env),

            AstNode::Array(items) => self.evaluate_array(items, input, env),

            AstNode::Object { pairs, .. } => self.evaluate_group(pairs, input, env),

            AstNode::Group { lhs, pairs, .. } => self.evaluate_grouped(lhs, pairs, input, env),

            AstNode::Sort { lhs, terms, .. } => self.evaluate_sort(lhs, terms, input, env),

            AstNode::Bind { name, value } => self.evaluate_bind(name, value, input, env),

            AstNode::Block(expressions) => self.evaluate_block(expressions, input, env),

            AstNode::Condition {
                test,
                then,
                otherwise,
            } => self.evaluate_condition(test, then, otherwise.as_deref(), input, env),

            AstNode::Function {
                procedure,
                args,
                position,
            } => self.evaluate_function(procedure, args, None, input, env, *position),

            AstNode::Partial {
                procedure,
                args,
                position,
            } => self.evaluate_partial(procedure, args, input, env, *position),

            AstNode::Placeholder => Ok(Sequence::Absent),

            AstNode::Lambda {
                params,
                body,
                signature,
                thunk,
            } => Ok(make_lambda(params, body, signature.as_ref(), *thunk, input, env)),

            AstNode::Apply { lhs, rhs, position } => self.evaluate_apply(lhs, rhs, input, env, *position),

            AstNode::Transform {
                pattern,
                update,
                delete,
                position,
            } => Ok(make_transformer(pattern, update, delete.as_ref(), *position, env)),

            AstNode::Error { position, token, .. } => Err(syntax_error_node(*position, token.as_deref())),

            raw => Err(Error::new(
                "S0206",
                format!("Unsupported node kind {} reached the evaluator", raw.kind()),
            )
            .or_position(raw.position())),
        }
    }

    #[inline(never)]
    fn evaluate_predicate(
        &mut self,
        lhs: &AstNode,
        condition: &AstNode,
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        let value = self.evaluate(lhs, input, env)?;
        self.apply_filter(condition, &value, env)
    }

    #[inline(never)]
    fn evaluate_negate(&mut self, operand: &AstNode, input: &Sequence, env: &Env) -> Result<Sequence> {
        match self.evaluate(operand, input, env)?.into_value() {
            None => Ok(Sequence::Absent),
            Some(JValue::Number(n)) => Ok(Sequence::from(JValue::Number(-n))),
            Some(other) => Err(Error::new(
                "D1002",
                format!("Cannot negate a non-numeric value: {}", other),
            )
            .with_value(Some(other))),
        }
    }

    #[inline(never)]
    fn evaluate_grouped(
        &mut self,
        lhs: &AstNode,
        pairs: &[(AstNode, AstNode)],
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        let value = self.evaluate(lhs, input, env)?;
        self.evaluate_group(pairs, &value, env)
    }

    #[inline(never)]
    fn evaluate_bind(&mut self, name: &str, value: &AstNode, input: &Sequence, env: &Env) -> Result<Sequence> {
        let value = self.evaluate(value, input, env)?;
        if value.contains_function() {
            self.closure_frames.watch(env);
        }
        env.bind(name, value.clone());
        Ok(value)
    }

    #[inline(never)]
    fn evaluate_block(&mut self, expressions: &[AstNode], input: &Sequence, env: &Env) -> Result<Sequence> {
        let frame = Environment::extend(env);
        let mut result = Sequence::Absent;
        for expression in expressions {
            result = self.evaluate(expression, input, &frame)?;
        }
        Ok(result)
    }

    #[inline(never)]
    fn evaluate_condition(
        &mut self,
        test: &AstNode,
        then: &AstNode,
        otherwise: Option<&AstNode>,
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        if self.evaluate(test, input, env)?.truthy() {
            self.evaluate(then, input, env)
        } else if let Some(otherwise) = otherwise {
            self.evaluate(otherwise, input, env)
        } else {
            Ok(Sequence::Absent)
        }
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    #[inline(never)]
    fn evaluate_path(
        &mut self,
        steps: &[PathStep],
        keep_singleton: bool,
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        let Some(first) = steps.first() else {
            return Ok(Sequence::Absent);
        };
        let last = steps.len() - 1;

        let mut result = if first.cons_array {
            self.evaluate(&first.node, input, env)?
        } else {
            // A variable step sees the input whole; any other step maps over
            // the members of an array or sequence input
            let maps_members = !matches!(first.node, AstNode::Variable(_))
                && (input.is_multi() || matches!(input, Sequence::Scalar(JValue::Array(_))));
            let inputs: Vec<Sequence> = if maps_members {
                input.members().iter().cloned().map(Sequence::Scalar).collect()
            } else {
                vec![input.clone()]
            };
            self.evaluate_step(first, &inputs, env, last == 0)?
        };

        for (index, step) in steps.iter().enumerate().skip(1) {
            if result.is_absent() {
                break;
            }
            let inputs: Vec<Sequence> = result
                .members()
                .iter()
                .cloned()
                .map(Sequence::Scalar)
                .collect();
            result = self.evaluate_step(step, &inputs, env, index == last)?;
        }

        if !keep_singleton {
            return Ok(result);
        }
        Ok(match result {
            Sequence::Scalar(array @ JValue::Array(_)) if steps[last].cons_array => Sequence::Values {
                items: vec![array],
                keep_singleton: true,
            },
            other => other.keep_singleton(),
        })
    }

    /// Evaluate one step against each input, apply its stages, then flatten
    fn evaluate_step(
        &mut self,
        step: &PathStep,
        inputs: &[Sequence],
        env: &Env,
        last: bool,
    ) -> Result<Sequence> {
        let mut results = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut value = self.evaluate(&step.node, input, env)?;
            for stage in &step.stages {
                value = self.apply_filter(stage, &value, env)?;
            }
            if !value.is_absent() {
                results.push(value);
            }
        }

        // A lone array produced by the final step is the result as-is
        if last && results.len() == 1 {
            if let Some(Sequence::Scalar(array @ JValue::Array(_))) = results.first() {
                return Ok(Sequence::Scalar(array.clone()));
            }
        }

        let mut items = Vec::new();
        for value in results {
            match value {
                Sequence::Absent => {}
                Sequence::Scalar(JValue::Array(array)) => {
                    if step.cons_array {
                        items.push(JValue::Array(array));
                    } else {
                        items.extend(array.iter().cloned());
                    }
                }
                Sequence::Scalar(value) => items.push(value),
                Sequence::Values { items: values, .. } => items.extend(values),
            }
        }
        // Left uncollapsed: a lone constructed array stays one member for the next step
        Ok(if items.is_empty() {
            Sequence::Absent
        } else {
            Sequence::Values {
                items,
                keep_singleton: false,
            }
        })
    }

    /// Keep the members of `value` selected by `condition`
    fn apply_filter(&mut self, condition: &AstNode, value: &Sequence, env: &Env) -> Result<Sequence> {
        let members = value.members();

        if let AstNode::Number(n) = condition {
            let Some(index) = resolve_index(*n, members.len()) else {
                return Ok(Sequence::Absent);
            };
            return Ok(Sequence::from(members[index].clone()));
        }

        let mut kept = Vec::new();
        for (index, member) in members.iter().enumerate() {
            let selector = self.evaluate(condition, &Sequence::from(member.clone()), env)?;
            let keep = match numeric_selectors(&selector) {
                Some(numbers) => numbers
                    .into_iter()
                    .any(|n| resolve_index(n, members.len()) == Some(index)),
                None => selector.truthy(),
            };
            if keep {
                kept.push(member.clone());
            }
        }
        Ok(if kept.is_empty() {
            Sequence::Absent
        } else {
            Sequence::Values {
                items: kept,
                keep_singleton: false,
            }
        })
    }

    // ── Operators ────────────────────────────────────────────────────────────

    #[inline(never)]
    fn evaluate_binary(
        &mut self,
        op: BinaryOp,
        lhs: &AstNode,
        rhs: &AstNode,
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        let left = self.evaluate(lhs, input, env)?;

        // Operators that may skip their right operand
        match op {
            BinaryOp::And => {
                let result = left.truthy() && self.evaluate(rhs, input, env)?.truthy();
                return Ok(Sequence::from(JValue::Bool(result)));
            }
            BinaryOp::Or => {
                let result = left.truthy() || self.evaluate(rhs, input, env)?.truthy();
                return Ok(Sequence::from(JValue::Bool(result)));
            }
            BinaryOp::Coalesce => {
                return if left.is_absent() {
                    self.evaluate(rhs, input, env)
                } else {
                    Ok(left)
                };
            }
            BinaryOp::Default => {
                return if left.truthy() {
                    Ok(left)
                } else {
                    self.evaluate(rhs, input, env)
                };
            }
            _ => {}
        }

        let left = left.into_value();
        let right = self.evaluate(rhs, input, env)?.into_value();

        match op {
            BinaryOp::Add
            | BinaryOp::Subtract
            | BinaryOp::Multiply
            | BinaryOp::Divide
            | BinaryOp::Modulo => arithmetic(op, left, right),

            BinaryOp::LessThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqual => compare(op, left, right),

            BinaryOp::Equal => Ok(Sequence::from(JValue::Bool(match (left, right) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            }))),
            BinaryOp::NotEqual => Ok(Sequence::from(JValue::Bool(match (left, right) {
                (Some(l), Some(r)) => l != r,
                _ => false,
            }))),

            BinaryOp::Concatenate => {
                let mut joined = match &left {
                    Some(value) => crate::functions::string::cast(value)?,
                    None => String::new(),
                };
                if let Some(value) = &right {
                    joined.push_str(&crate::functions::string::cast(value)?);
                }
                Ok(Sequence::from(JValue::from(joined)))
            }

            BinaryOp::In => Ok(Sequence::from(JValue::Bool(match (left, right) {
                (Some(needle), Some(haystack)) => haystack.members().contains(&needle),
                _ => false,
            }))),

            BinaryOp::Range => range(left, right),

            BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce | BinaryOp::Default => {
                Ok(Sequence::Absent)
            }
        }
    }

    #[inline(never)]
    fn evaluate_array(&mut self, items: &[AstNode], input: &Sequence, env: &Env) -> Result<Sequence> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            let value = self.evaluate(item, input, env)?;
            // A nested array constructor is one member; anything else is spliced in
            if matches!(item, AstNode::Array(_)) {
                values.extend(value.into_value());
                continue;
            }
            match value {
                Sequence::Absent => {}
                Sequence::Scalar(JValue::Array(array)) => values.extend(array.iter().cloned()),
                Sequence::Scalar(value) => values.push(value),
                Sequence::Values { items, .. } => values.extend(items),
            }
        }
        Ok(Sequence::array(values))
    }

    // ── Grouping and sorting ─────────────────────────────────────────────────

    /// Object construction over the members of `input`
    ///
    /// Members are partitioned by the key each pair produces; every value
    /// expression then runs once per key over that key's members.
    #[inline(never)]
    fn evaluate_group(
        &mut self,
        pairs: &[(AstNode, AstNode)],
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        let mut members: Vec<Sequence> = input
            .members()
            .iter()
            .cloned()
            .map(Sequence::Scalar)
            .collect();
        if members.is_empty() {
            members.push(Sequence::Absent);
        }

        let mut groups: IndexMap<String, (Sequence, usize)> = IndexMap::new();
        for member in &members {
            for (pair_index, (key_expr, _)) in pairs.iter().enumerate() {
                let key = match self.evaluate(key_expr, member, env)?.into_value() {
                    None => continue,
                    Some(JValue::String(key)) => key.to_string(),
                    Some(other) => {
                        return Err(Error::new(
                            "T1003",
                            format!("Key in object structure must evaluate to a string; got: {}", other),
                        )
                        .with_value(Some(other)))
                    }
                };
                match groups.get_mut(&key) {
                    Some((data, index)) => {
                        if *index != pair_index {
                            return Err(Error::new(
                                "D1009",
                                format!("Multiple key definitions evaluate to same key: {}", key),
                            )
                            .with_value(Some(JValue::from(key))));
                        }
                        *data = append(std::mem::take(data), member);
                    }
                    None => {
                        groups.insert(key, (member.clone(), pair_index));
                    }
                }
            }
        }

        let mut object = IndexMap::with_capacity(groups.len());
        for (key, (data, pair_index)) in groups {
            let value = self.evaluate(&pairs[pair_index].1, &data, env)?;
            if let Some(value) = value.into_value() {
                object.insert(key, value);
            }
        }
        Ok(Sequence::from(JValue::object(object)))
    }

    #[inline(never)]
    fn evaluate_sort(
        &mut self,
        lhs: &AstNode,
        terms: &[SortTerm],
        input: &Sequence,
        env: &Env,
    ) -> Result<Sequence> {
        let value = self.evaluate(lhs, input, env)?;
        let items = value.members().to_vec();
        if items.len() < 2 {
            return Ok(value);
        }

        let mut keys = Vec::with_capacity(items.len());
        for item in &items {
            let mut row = Vec::with_capacity(terms.len());
            for term in terms {
                row.push(
                    self.evaluate(&term.expression, &Sequence::from(item.clone()), env)?
                        .into_value(),
                );
            }
            keys.push(row);
        }

        for column in 0..terms.len() {
            let mut first: Option<&JValue> = None;
            for key in keys.iter().filter_map(|row| row[column].as_ref()) {
                if !(key.is_number() || key.is_string()) {
                    return Err(Error::new(
                        "T2008",
                        "The expressions within an order-by clause must evaluate to numeric or string values",
                    )
                    .with_value(Some(key.clone())));
                }
                match first {
                    None => first = Some(key),
                    Some(seen) if seen.type_name() != key.type_name() => {
                        return Err(Error::new(
                            "T2007",
                            format!(
                                "Type mismatch when comparing values {} and {} in order-by clause",
                                seen, key
                            ),
                        )
                        .with_value(Some(seen.clone()))
                        .with_value2(Some(key.clone())))
                    }
                    Some(_) => {}
                }
            }
        }

        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by(|&a, &b| compare_sort_keys(&keys[a], &keys[b], terms));
        Ok(Sequence::from_items(
            order.into_iter().map(|i| items[i].clone()).collect(),
        ))
    }

    // ── Functions ────────────────────────────────────────────────────────────

    #[inline(never)]
    fn evaluate_function(
        &mut self,
        procedure: &AstNode,
        args: &[AstNode],
        applied: Option<Sequence>,
        input: &Sequence,
        env: &Env,
        position: usize,
    ) -> Result<Sequence> {
        let callee = self.evaluate(procedure, input, env)?;
        if callee.is_absent() {
            if let Some(name) = misspelt_function(procedure, env) {
                return Err(Error::new(
                    "T1005",
                    format!("Attempted to invoke a non-function. Did you mean ${}?", name),
                )
                .at(position)
                .with_token(name));
            }
        }

        let mut values = Vec::with_capacity(args.len() + 1);
        values.extend(applied);
        for arg in args {
            values.push(self.evaluate(arg, input, env)?);
        }

        let name = procedure_name(procedure);
        let Some(callee) = callee.as_procedure().cloned() else {
            return Err(not_a_function(position, name));
        };
        let ctx = CallContext {
            input,
            env,
            position: Some(position),
            name,
        };
        self.apply(&callee, values, &ctx).map_err(|e| {
            let e = e.or_position(Some(position));
            if e.token.is_none() && !name.is_empty() {
                e.with_token(name)
            } else {
                e
            }
        })
    }

    #[inline(never)]
    fn evaluate_partial(
        &mut self,
        procedure: &AstNode,
        args: &[AstNode],
        input: &Sequence,
        env: &Env,
        position: usize,
    ) -> Result<Sequence> {
        let mut bound = Vec::with_capacity(args.len());
        for arg in args {
            bound.push(match arg {
                AstNode::Placeholder => PartialArg::Placeholder,
                other => PartialArg::Bound(self.evaluate(other, input, env)?),
            });
        }

        let callee = self.evaluate(procedure, input, env)?;
        let Some(callee) = callee.as_procedure().cloned() else {
            if callee.is_absent() {
                if let Some(name) = misspelt_function(procedure, env) {
                    return Err(Error::new(
                        "T1007",
                        format!(
                            "Attempted to partially apply a non-function. Did you mean ${}?",
                            name
                        ),
                    )
                    .at(position)
                    .with_token(name));
                }
            }
            return Err(
                Error::new("T1008", "Attempted to partially apply a non-function").at(position),
            );
        };

        Ok(Sequence::from(JValue::function(Procedure::Partial(Rc::new(
            PartialApplication {
                procedure: callee,
                args: bound,
            },
        )))))
    }

    /// `lhs ~> rhs`
    #[inline(never)]
    fn evaluate_apply(
        &mut self,
        lhs: &AstNode,
        rhs: &AstNode,
        input: &Sequence,
        env: &Env,
        position: usize,
    ) -> Result<Sequence> {
        let value = self.evaluate(lhs, input, env)?;

        // `x ~> $f(a)` is `$f(x, a)`
        if let AstNode::Function {
            procedure,
            args,
            position,
        } = rhs
        {
            return self.evaluate_function(procedure, args, Some(value), input, env, *position);
        }

        let target = self.evaluate(rhs, input, env)?;
        let Some(second) = target.as_procedure().cloned() else {
            return Err(Error::new(
                "T2006",
                "The right side of the function application operator ~> must be a function",
            )
            .at(position)
            .with_value(target.into_value()));
        };

        if let Some(first) = value.as_procedure() {
            return Ok(Sequence::from(JValue::function(Procedure::Composition(Rc::new(
                (first.clone(), second),
            )))));
        }

        let ctx = CallContext {
            input,
            env,
            position: Some(position),
            name: "",
        };
        self.apply(&second, vec![value], &ctx)
    }

    /// Apply a procedure, resolving tail calls iteratively
    ///
    /// A lambda whose body ends in a call returns a thunk instead of recursing;
    /// the loop here evaluates the thunk's callee and arguments and applies
    /// again, so tail recursion runs in constant native stack.
    pub fn apply(
        &mut self,
        procedure: &Procedure,
        args: Vec<Sequence>,
        ctx: &CallContext<'_>,
    ) -> Result<Sequence> {
        let mut result = self.apply_inner(procedure, args, ctx)?;

        loop {
            let thunk = match result.as_procedure() {
                Some(next @ Procedure::Lambda(lambda)) if next.is_thunk() => Rc::clone(lambda),
                _ => break,
            };
            let AstNode::Function {
                procedure: callee_node,
                args: arg_nodes,
                position,
            } = thunk.body.as_ref()
            else {
                break;
            };
            log::trace!("trampoline: tail call at position {}", position);

            let callee = self.evaluate(callee_node, &thunk.input, &thunk.env)?;
            let mut values = Vec::with_capacity(arg_nodes.len());
            for arg in arg_nodes {
                values.push(self.evaluate(arg, &thunk.input, &thunk.env)?);
            }
            let name = procedure_name(callee_node);
            let Some(callee) = callee.as_procedure().cloned() else {
                if callee.is_absent() {
                    if let Some(name) = misspelt_function(callee_node, &thunk.env) {
                        return Err(Error::new(
                            "T1005",
                            format!("Attempted to invoke a non-function. Did you mean ${}?", name),
                        )
                        .at(*position)
                        .with_token(name));
                    }
                }
                return Err(not_a_function(*position, name));
            };
            let tail_ctx = CallContext { name, ..*ctx };
            result = self.apply_inner(&callee, values, &tail_ctx)?;
        }

        Ok(result)
    }

    fn apply_inner(
        &mut self,
        procedure: &Procedure,
        args: Vec<Sequence>,
        ctx: &CallContext<'_>,
    ) -> Result<Sequence> {
        match procedure {
            Procedure::Native(native) => {
                let values: Vec<Option<JValue>> = args.into_iter().map(Sequence::into_value).collect();
                let values = match &native.signature {
                    Some(signature) => {
                        signature.validate(&values, ctx.input.to_value().as_ref(), &native.name)?
                    }
                    None => values,
                };
                let implementation = Rc::clone(&native.implementation);
                let native_ctx = CallContext {
                    name: &native.name,
                    ..*ctx
                };
                implementation(self, &values, &native_ctx)
            }

            Procedure::Lambda(lambda) => {
                let args = match &lambda.signature {
                    Some(signature) => {
                        let values: Vec<Option<JValue>> =
                            args.into_iter().map(Sequence::into_value).collect();
                        signature
                            .validate(&values, ctx.input.to_value().as_ref(), ctx.name)?
                            .into_iter()
                            .map(Sequence::from)
                            .collect()
                    }
                    None => args,
                };
                let frame = Environment::extend(&lambda.env);
                let mut args = args.into_iter();
                for param in &lambda.params {
                    frame.bind(param.clone(), args.next().unwrap_or_default());
                }
                self.evaluate(&lambda.body, &lambda.input, &frame)
            }

            Procedure::Partial(partial) => {
                let mut supplied = args.into_iter();
                let full: Vec<Sequence> = partial
                    .args
                    .iter()
                    .map(|arg| match arg {
                        PartialArg::Placeholder => supplied.next().unwrap_or_default(),
                        PartialArg::Bound(value) => value.clone(),
                    })
                    .collect();
                log::trace!("partial application of {:?}", partial.procedure);
                self.apply_inner(&partial.procedure, full, ctx)
            }

            Procedure::Transform(transformer) => {
                let value = args.into_iter().next().and_then(Sequence::into_value);
                self.run_transform(transformer, value).map(Sequence::from)
            }

            Procedure::Composition(pair) => {
                let (first, second) = pair.as_ref();
                let intermediate = self.apply(first, args, ctx)?;
                self.apply_inner(second, vec![intermediate], ctx)
            }

            Procedure::Retained(retained) => self.apply(&retained.procedure, args, ctx),
        }
    }

    /// Invoke a function value from inside a native implementation
    ///
    /// Arguments beyond the callee's arity are dropped, so `$map` can offer
    /// `(value, index, array)` to a one-parameter lambda.
    pub fn call_function(
        &mut self,
        procedure: &Procedure,
        mut args: Vec<Option<JValue>>,
        ctx: &CallContext<'_>,
    ) -> Result<Option<JValue>> {
        args.truncate(procedure.arity());
        let args = args.into_iter().map(Sequence::from).collect();
        Ok(self.apply(procedure, args, ctx)?.into_value())
    }

    // ── Transform ────────────────────────────────────────────────────────────

    fn run_transform(&mut self, transformer: &Transformer, input: Option<JValue>) -> Result<Option<JValue>> {
        let Some(value) = input else {
            return Ok(None);
        };
        if !(value.is_object() || value.is_array()) {
            return Err(Error::new(
                "T2013",
                "The transform operator can only be applied to an object or an array of objects",
            )
            .at(transformer.position)
            .with_value(Some(value)));
        }

        let copy = value.deep_clone();
        let matches = self.evaluate(
            &transformer.pattern,
            &Sequence::from(copy.clone()),
            &transformer.env,
        )?;

        let mut edits: HashMap<*const IndexMap<String, JValue>, Edit> = HashMap::new();
        for target in matches.members() {
            let JValue::Object(map) = target else {
                continue;
            };
            let context = Sequence::from(target.clone());

            let update = match self.evaluate(&transformer.update, &context, &transformer.env)?.into_value() {
                None => None,
                Some(JValue::Object(update)) => Some(update),
                Some(other) => {
                    return Err(Error::new(
                        "T2011",
                        format!(
                            "The insert/update clause of the transform expression must evaluate to an object: {}",
                            other
                        ),
                    )
                    .or_position(transformer.update.position())
                    .with_value(Some(other)))
                }
            };

            let mut deletions = Vec::new();
            if let Some(delete) = &transformer.delete {
                if let Some(names) = self.evaluate(delete, &context, &transformer.env)?.into_value() {
                    for name in names.members() {
                        match name.as_str() {
                            Some(name) => deletions.push(name.to_string()),
                            None => {
                                return Err(Error::new(
                                    "T2012",
                                    format!(
                                        "The delete clause of the transform expression must evaluate to a string or array of strings: {}",
                                        names
                                    ),
                                )
                                .or_position(delete.position())
                                .with_value(Some(names.clone())))
                            }
                        }
                    }
                }
            }

            let edit = edits.entry(Rc::as_ptr(map)).or_default();
            if let Some(update) = update {
                edit.update.extend(update.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            edit.delete.extend(deletions);
        }

        Ok(Some(rebuild(&copy, &edits)))
    }

    // ── Frames ───────────────────────────────────────────────────────────────

    /// Finish a top-level evaluation.
    ///
    /// Without functions in `result` the closure frames are cleared now.
    /// Otherwise every function in the result takes shared ownership of the
    /// frames, which are cleared when the last of them is dropped.
    pub fn release_frames(&mut self, result: Sequence) -> Sequence {
        let frames = std::mem::take(&mut self.closure_frames);
        if frames.is_empty() || !result.contains_function() {
            return result;
        }
        let frames = Rc::new(frames);
        match result {
            Sequence::Absent => Sequence::Absent,
            Sequence::Scalar(value) => Sequence::Scalar(retain(&value, &frames)),
            Sequence::Values {
                items,
                keep_singleton,
            } => Sequence::Values {
                items: items.iter().map(|item| retain(item, &frames)).collect(),
                keep_singleton,
            },
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(EvalOptions::default())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Address of a local in the current frame; differences measure native stack use
#[inline(always)]
fn stack_address() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

#[inline(never)]
fn make_lambda(
    params: &[String],
    body: &Arc<AstNode>,
    signature: Option<&Arc<Signature>>,
    thunk: bool,
    input: &Sequence,
    env: &Env,
) -> Sequence {
    Sequence::from(JValue::function(Procedure::Lambda(Rc::new(Lambda {
        params: params.to_vec(),
        body: Arc::clone(body),
        signature: signature.cloned(),
        thunk,
        env: Rc::clone(env),
        input: input.clone(),
    }))))
}

#[inline(never)]
fn make_transformer(
    pattern: &Arc<AstNode>,
    update: &Arc<AstNode>,
    delete: Option<&Arc<AstNode>>,
    position: usize,
    env: &Env,
) -> Sequence {
    Sequence::from(JValue::function(Procedure::Transform(Rc::new(Transformer {
        pattern: Arc::clone(pattern),
        update: Arc::clone(update),
        delete: delete.cloned(),
        env: Rc::clone(env),
        position,
    }))))
}

fn syntax_error_node(position: usize, token: Option<&str>) -> Error {
    let err = Error::new(
        "S0500",
        "Attempted to evaluate an expression containing syntax error(s)",
    )
    .at(position);
    match token {
        Some(token) => err.with_token(token),
        None => err,
    }
}

/// Copy of `value` whose functions hold `frames`
fn retain(value: &JValue, frames: &Rc<FrameGuard>) -> JValue {
    match value {
        JValue::Function(procedure) => JValue::function(Procedure::Retained(Rc::new(Retained {
            procedure: procedure.clone(),
            frames: Rc::clone(frames),
        }))),
        JValue::Array(items) if value.contains_function() => {
            JValue::array(items.iter().map(|item| retain(item, frames)).collect())
        }
        JValue::Object(map) if value.contains_function() => JValue::object(
            map.iter()
                .map(|(key, item)| (key.clone(), retain(item, frames)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Updates and deletions collected for one matched object
#[derive(Default)]
struct Edit {
    update: IndexMap<String, JValue>,
    delete: Vec<String>,
}

/// Copy `value`, applying the collected edits to the objects they target
fn rebuild(value: &JValue, edits: &HashMap<*const IndexMap<String, JValue>, Edit>) -> JValue {
    match value {
        JValue::Array(array) => JValue::array(array.iter().map(|v| rebuild(v, edits)).collect()),
        JValue::Object(map) => {
            let mut object: IndexMap<String, JValue> = map
                .iter()
                .map(|(k, v)| (k.clone(), rebuild(v, edits)))
                .collect();
            if let Some(edit) = edits.get(&Rc::as_ptr(map)) {
                for (key, value) in &edit.update {
                    object.insert(key.clone(), value.clone());
                }
                for key in &edit.delete {
                    object.shift_remove(key);
                }
            }
            JValue::object(object)
        }
        other => other.clone(),
    }
}

/// Field lookup; arrays are searched member-wise and nested results flattened
pub(crate) fn lookup_field(input: &Sequence, key: &str) -> Sequence {
    match input {
        Sequence::Absent => Sequence::Absent,
        Sequence::Scalar(value) => lookup_value(value, key),
        Sequence::Values { items, .. } => {
            let mut found = Vec::new();
            for item in items {
                collect_field(item, key, &mut found);
            }
            Sequence::from_items(found)
        }
    }
}

fn lookup_value(value: &JValue, key: &str) -> Sequence {
    match value {
        JValue::Object(map) => Sequence::from(map.get(key).cloned()),
        JValue::Array(array) => {
            let mut found = Vec::new();
            for item in array.iter() {
                collect_field(item, key, &mut found);
            }
            if found.is_empty() {
                Sequence::Absent
            } else {
                Sequence::Values {
                    items: found,
                    keep_singleton: false,
                }
            }
        }
        _ => Sequence::Absent,
    }
}

fn collect_field(value: &JValue, key: &str, out: &mut Vec<JValue>) {
    match lookup_value(value, key) {
        Sequence::Absent => {}
        Sequence::Scalar(JValue::Array(array)) => out.extend(array.iter().cloned()),
        Sequence::Scalar(value) => out.push(value),
        Sequence::Values { items, .. } => out.extend(items),
    }
}

/// `*`: every field value of an object (or element of an array), arrays flattened
fn wildcard(input: &Sequence) -> Sequence {
    let source = match input {
        Sequence::Scalar(value) => value,
        Sequence::Values { items, .. } => match items.first() {
            Some(first) => first,
            None => return Sequence::Absent,
        },
        Sequence::Absent => return Sequence::Absent,
    };

    let mut results = Vec::new();
    let mut push = |value: &JValue| match value {
        JValue::Array(_) => flatten_into(value, &mut results),
        other => results.push(other.clone()),
    };
    match source {
        JValue::Object(map) => map.values().for_each(&mut push),
        JValue::Array(array) => array.iter().for_each(&mut push),
        _ => {}
    }
    Sequence::from_items(results)
}

fn flatten_into(value: &JValue, out: &mut Vec<JValue>) {
    match value {
        JValue::Array(array) => array.iter().for_each(|v| flatten_into(v, out)),
        other => out.push(other.clone()),
    }
}

/// `**`: the input and every value nested below it, depth first
fn descendants(input: &Sequence) -> Sequence {
    let mut results = Vec::new();
    match input {
        Sequence::Absent => return Sequence::Absent,
        Sequence::Scalar(value) => collect_descendants(value, &mut results),
        Sequence::Values { items, .. } => items.iter().for_each(|v| collect_descendants(v, &mut results)),
    }
    Sequence::from_items(results)
}

fn collect_descendants(value: &JValue, out: &mut Vec<JValue>) {
    match value {
        JValue::Array(array) => array.iter().for_each(|v| collect_descendants(v, out)),
        JValue::Object(map) => {
            out.push(value.clone());
            map.values().for_each(|v| collect_descendants(v, out));
        }
        other => out.push(other.clone()),
    }
}

/// Concatenate two group members into one sequence
fn append(data: Sequence, member: &Sequence) -> Sequence {
    match (data, member) {
        (data, Sequence::Absent) => data,
        (Sequence::Absent, member) => member.clone(),
        (data, member) => {
            let mut items = data.members().to_vec();
            items.extend(member.members().iter().cloned());
            Sequence::Values {
                items,
                keep_singleton: false,
            }
        }
    }
}

/// Floor a selector and resolve negative values from the end
#[inline]
fn resolve_index(selector: f64, len: usize) -> Option<usize> {
    let index = selector.floor();
    let index = if index < 0.0 { index + len as f64 } else { index };
    if index >= 0.0 && index < len as f64 {
        Some(index as usize)
    } else {
        None
    }
}

/// Numbers a predicate produced, when it produced nothing but numbers
fn numeric_selectors(selector: &Sequence) -> Option<Vec<f64>> {
    match selector {
        Sequence::Scalar(JValue::Number(n)) => Some(vec![*n]),
        Sequence::Scalar(JValue::Array(array)) => array.iter().map(JValue::as_f64).collect(),
        Sequence::Values { items, .. } => items.iter().map(JValue::as_f64).collect(),
        _ => None,
    }
}

fn arithmetic(op: BinaryOp, left: Option<JValue>, right: Option<JValue>) -> Result<Sequence> {
    let l = match &left {
        None => None,
        Some(JValue::Number(n)) => Some(*n),
        Some(other) => {
            return Err(Error::new(
                "T2001",
                format!("The left side of the {} operator must evaluate to a number", op.symbol()),
            )
            .with_token(op.symbol())
            .with_value(Some(other.clone())))
        }
    };
    let r = match &right {
        None => None,
        Some(JValue::Number(n)) => Some(*n),
        Some(other) => {
            return Err(Error::new(
                "T2002",
                format!("The right side of the {} operator must evaluate to a number", op.symbol()),
            )
            .with_token(op.symbol())
            .with_value(Some(other.clone())))
        }
    };
    let (Some(l), Some(r)) = (l, r) else {
        return Ok(Sequence::Absent);
    };
    let n = match op {
        BinaryOp::Add => l + r,
        BinaryOp::Subtract => l - r,
        BinaryOp::Multiply => l * r,
        BinaryOp::Divide => l / r,
        _ => l % r,
    };
    Ok(Sequence::from(JValue::Number(n)))
}

fn compare(op: BinaryOp, left: Option<JValue>, right: Option<JValue>) -> Result<Sequence> {
    let comparable = |v: &Option<JValue>| match v {
        None => true,
        Some(v) => v.is_number() || v.is_string(),
    };
    if !comparable(&left) || !comparable(&right) {
        let offending = if comparable(&left) { right } else { left };
        return Err(Error::new(
            "T2010",
            format!(
                "The expressions either side of operator {} must evaluate to numeric or string values",
                op.symbol()
            ),
        )
        .with_token(op.symbol())
        .with_value(offending));
    }
    let (Some(l), Some(r)) = (left, right) else {
        return Ok(Sequence::from(JValue::Bool(false)));
    };
    let ordering = match (&l, &r) {
        (JValue::Number(a), JValue::Number(b)) => a.partial_cmp(b),
        (JValue::String(a), JValue::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(Error::new(
                "T2009",
                format!(
                    "The values {} and {} either side of operator {} must be of the same data type",
                    l,
                    r,
                    op.symbol()
                ),
            )
            .with_token(op.symbol())
            .with_value(Some(l))
            .with_value2(Some(r)))
        }
    };
    let result = match (op, ordering) {
        (_, None) => false,
        (BinaryOp::LessThan, Some(o)) => o == Ordering::Less,
        (BinaryOp::LessThanOrEqual, Some(o)) => o != Ordering::Greater,
        (BinaryOp::GreaterThan, Some(o)) => o == Ordering::Greater,
        (_, Some(o)) => o != Ordering::Less,
    };
    Ok(Sequence::from(JValue::Bool(result)))
}

fn range(left: Option<JValue>, right: Option<JValue>) -> Result<Sequence> {
    if let Some(l) = &left {
        if !l.is_integer() {
            return Err(Error::new(
                "T2003",
                "The left side of the range operator (..) must evaluate to an integer",
            )
            .with_value(left));
        }
    }
    if let Some(r) = &right {
        if !r.is_integer() {
            return Err(Error::new(
                "T2004",
                "The right side of the range operator (..) must evaluate to an integer",
            )
            .with_value(right));
        }
    }
    let (Some(start), Some(end)) = (
        left.as_ref().and_then(JValue::as_f64),
        right.as_ref().and_then(JValue::as_f64),
    ) else {
        return Ok(Sequence::Absent);
    };
    if start > end {
        return Ok(Sequence::Absent);
    }
    let size = end - start + 1.0;
    if size > MAX_RANGE_SIZE {
        return Err(Error::new(
            "D2014",
            format!(
                "The size of the sequence allocated by the range operator (..) must not exceed 1e7.  Attempted to allocate {}.",
                crate::value::format_number(size)
            ),
        )
        .with_value(Some(JValue::Number(size))));
    }
    let (start, count) = (start as i64, size as i64);
    Ok(Sequence::array(
        (0..count).map(|i| JValue::from_i64(start + i)).collect(),
    ))
}

/// Ordering of two rows of precomputed sort keys; absent keys sort last
fn compare_sort_keys(a: &[Option<JValue>], b: &[Option<JValue>], terms: &[SortTerm]) -> Ordering {
    for (index, term) in terms.iter().enumerate() {
        let ordering = match (&a[index], &b[index]) {
            (None, None) => continue,
            (None, Some(_)) => return Ordering::Greater,
            (Some(_), None) => return Ordering::Less,
            (Some(JValue::Number(x)), Some(JValue::Number(y))) => {
                x.partial_cmp(y).unwrap_or(Ordering::Equal)
            }
            (Some(JValue::String(x)), Some(JValue::String(y))) => x.cmp(y),
            _ => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return if term.descending {
                ordering.reverse()
            } else {
                ordering
            };
        }
    }
    Ordering::Equal
}

/// Name a call site reports in errors: `$f(..)` gives `f`, `f(..)` gives `f`
fn procedure_name(node: &AstNode) -> &str {
    match node {
        AstNode::Variable(name) => name,
        AstNode::Path { steps, .. } => match steps.first().map(|s| &s.node) {
            Some(AstNode::Name(name)) => name,
            _ => "",
        },
        _ => "",
    }
}

/// `uppercase(x)` written without the `$`, when `$uppercase` exists
fn misspelt_function(node: &AstNode, env: &Env) -> Option<String> {
    let AstNode::Path { steps, .. } = node else {
        return None;
    };
    match steps.first().map(|s| &s.node) {
        Some(AstNode::Name(name)) if env.contains(name) => Some(name.clone()),
        _ => None,
    }
}

fn not_a_function(position: usize, name: &str) -> Error {
    let err = Error::new("T1006", "Attempted to invoke a non-function").at(position);
    if name.is_empty() {
        err
    } else {
        err.with_token(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;

    fn eval(source: &str, input: JValue) -> Result<Option<JValue>> {
        crate::compile(source)?.evaluate(&input)
    }

    fn eval_ok(source: &str, input: JValue) -> Option<JValue> {
        match eval(source, input) {
            Ok(value) => value,
            Err(e) => panic!("{} failed: {}", source, e),
        }
    }

    fn eval_err(source: &str, input: JValue) -> Error {
        match eval(source, input) {
            Ok(value) => panic!("{} should fail, got {:?}", source, value),
            Err(e) => e,
        }
    }

    #[test]
    fn test_evaluate_literals() {
        assert_eq!(eval_ok("\"hello\"", JValue::Null), Some(JValue::from("hello")));
        assert_eq!(eval_ok("42", JValue::Null), Some(JValue::from(42i64)));
        assert_eq!(eval_ok("true", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("null", JValue::Null), Some(JValue::Null));
    }

    #[test]
    fn test_evaluate_path() {
        let data = jvalue!({"foo": {"bar": {"baz": 42}}});
        assert_eq!(eval_ok("foo.bar.baz", data.clone()), Some(JValue::from(42i64)));
        assert_eq!(eval_ok("foo.missing", data.clone()), None);
        assert_eq!(eval_ok("missing", data), None);
    }

    #[test]
    fn test_path_flattens_arrays() {
        let data = jvalue!({"a": [{"b": [1, 2]}, {"b": 3}, {"c": 4}]});
        assert_eq!(eval_ok("a.b", data.clone()), Some(jvalue!([1, 2, 3])));
        assert_eq!(eval_ok("a[0].b", data.clone()), Some(jvalue!([1, 2])));
        assert_eq!(eval_ok("a.c", data), Some(JValue::from(4i64)));
    }

    #[test]
    fn test_top_level_array_input_is_mapped() {
        let data = jvalue!([{"x": 1}, {"x": 2}]);
        assert_eq!(eval_ok("x", data.clone()), Some(jvalue!([1, 2])));
        assert_eq!(eval_ok("$[1]", data.clone()), Some(jvalue!({"x": 2})));
        assert_eq!(eval_ok("$count($)", data), Some(JValue::from(2i64)));
    }

    #[test]
    fn test_keep_singleton_array() {
        let data = jvalue!({"a": [{"b": 1}]});
        assert_eq!(eval_ok("a.b", data.clone()), Some(JValue::from(1i64)));
        assert_eq!(eval_ok("a.b[]", data.clone()), Some(jvalue!([1])));
        assert_eq!(eval_ok("a[].b", data), Some(jvalue!([1])));
    }

    #[test]
    fn test_predicates() {
        assert_eq!(eval_ok("[10,20,30][-1]", JValue::Null), Some(JValue::from(10i64)));
        assert_eq!(eval_ok("[10,20,30][1.7]", JValue::Null), Some(JValue::from(20i64)));
        assert_eq!(eval_ok("[10,20,30][5]", JValue::Null), None);
        assert_eq!(eval_ok("[10,20,30][[0,2]]", JValue::Null), Some(jvalue!([10, 30])));
        assert_eq!(eval_ok("[1,2,3,4][$ > 2]", JValue::Null), Some(jvalue!([3, 4])));

        let data = jvalue!({"items": [{"p": 5}, {"p": 15}, {"p": 25}]});
        assert_eq!(eval_ok("items[p > 10].p", data), Some(jvalue!([15, 25])));
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_ok("1 + 2 * 3", JValue::Null), Some(JValue::from(7i64)));
        assert_eq!(eval_ok("7 % 3", JValue::Null), Some(JValue::from(1i64)));
        assert_eq!(eval_ok("-(2 + 3)", JValue::Null), Some(JValue::from(-5i64)));
        assert_eq!(eval_ok("missing + 1", jvalue!({})), None);
        assert_eq!(eval_err("'a' + 1", JValue::Null).code, "T2001");
        assert_eq!(eval_err("1 + 'a'", JValue::Null).code, "T2002");
        assert_eq!(eval_err("-'a'", JValue::Null).code, "D1002");
    }

    #[test]
    fn test_comparison() {
        assert_eq!(eval_ok("1 < 2", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("'b' >= 'a'", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("missing < 2", jvalue!({})), Some(JValue::Bool(false)));
        assert_eq!(eval_err("1 < 'a'", JValue::Null).code, "T2009");
        assert_eq!(eval_err("true < 1", JValue::Null).code, "T2010");
    }

    #[test]
    fn test_equality_is_deep() {
        assert_eq!(eval_ok("{'a': [1, 2]} = {'a': [1, 2]}", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("[1, 2] != [2, 1]", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("missing = missing", jvalue!({})), Some(JValue::Bool(false)));
        assert_eq!(eval_ok("missing != 1", jvalue!({})), Some(JValue::Bool(false)));
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        assert_eq!(eval_ok("false and $undefinedFn()", JValue::Null), Some(JValue::Bool(false)));
        assert_eq!(eval_ok("true or $undefinedFn()", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("1 and 'x'", JValue::Null), Some(JValue::Bool(true)));
    }

    #[test]
    fn test_coalescing_operators() {
        assert_eq!(eval_ok("missing ?? 5", jvalue!({})), Some(JValue::from(5i64)));
        assert_eq!(eval_ok("0 ?? 5", JValue::Null), Some(JValue::from(0i64)));
        assert_eq!(eval_ok("0 ?: 5", JValue::Null), Some(JValue::from(5i64)));
        assert_eq!(eval_ok("'x' ?: 5", JValue::Null), Some(JValue::from("x")));
    }

    #[test]
    fn test_concatenation_and_membership() {
        assert_eq!(eval_ok("'a' & 1 & true", JValue::Null), Some(JValue::from("a1true")));
        assert_eq!(eval_ok("missing & 'x'", jvalue!({})), Some(JValue::from("x")));
        assert_eq!(eval_ok("2 in [1, 2, 3]", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("'a' in 'a'", JValue::Null), Some(JValue::Bool(true)));
        assert_eq!(eval_ok("4 in [1, 2, 3]", JValue::Null), Some(JValue::Bool(false)));
    }

    #[test]
    fn test_range() {
        assert_eq!(eval_ok("1..5", JValue::Null), Some(jvalue!([1, 2, 3, 4, 5])));
        assert_eq!(eval_ok("5..1", JValue::Null), None);
        assert_eq!(eval_ok("[1..3, 7]", JValue::Null), Some(jvalue!([1, 2, 3, 7])));
        assert_eq!(eval_err("1.5..3", JValue::Null).code, "T2003");
        assert_eq!(eval_err("1..'x'", JValue::Null).code, "T2004");
        assert_eq!(eval_err("1..20000000", JValue::Null).code, "D2014");
    }

    #[test]
    fn test_array_constructor() {
        assert_eq!(eval_ok("[]", JValue::Null), Some(jvalue!([])));
        assert_eq!(eval_ok("[1, [2, 3]]", JValue::Null), Some(jvalue!([1, [2, 3]])));
        assert_eq!(eval_ok("[[1]]", JValue::Null), Some(jvalue!([[1]])));
        let data = jvalue!({"a": [1, 2]});
        assert_eq!(eval_ok("[a, 3]", data), Some(jvalue!([1, 2, 3])));
    }

    #[test]
    fn test_object_constructor_groups() {
        let data = jvalue!({"items": [
            {"k": "x", "v": 1},
            {"k": "y", "v": 2},
            {"k": "x", "v": 3}
        ]});
        assert_eq!(
            eval_ok("items{k: $sum(v)}", data.clone()),
            Some(jvalue!({"x": 4, "y": 2}))
        );
        assert_eq!(eval_ok("{'a': 1, 'b': missing}", data.clone()), Some(jvalue!({"a": 1})));
        assert_eq!(eval_err("{1: 2}", JValue::Null).code, "T1003");
        assert_eq!(eval_err("items{k: v, k: v}", data).code, "D1009");
    }

    #[test]
    fn test_sort() {
        let data = jvalue!({"p": [
            {"n": "b", "v": 2},
            {"n": "a", "v": 2},
            {"n": "c", "v": 1},
            {"n": "d"}
        ]});
        assert_eq!(eval_ok("p^(v).n", data.clone()), Some(jvalue!(["c", "b", "a", "d"])));
        assert_eq!(eval_ok("p^(>v, n).n", data.clone()), Some(jvalue!(["a", "b", "c", "d"])));
        assert_eq!(eval_err("[{'x': 1}, {'x': 'a'}]^(x)", JValue::Null).code, "T2007");
        assert_eq!(eval_err("[{'x': true}, {'x': false}]^(x)", JValue::Null).code, "T2008");
    }

    #[test]
    fn test_wildcard_and_descendants() {
        let data = jvalue!({"a": {"x": 1, "y": [2, 3]}});
        assert_eq!(eval_ok("a.*", data.clone()), Some(jvalue!([1, 2, 3])));
        assert_eq!(eval_ok("**.x", data), Some(JValue::from(1i64)));
    }

    #[test]
    fn test_blocks_and_bindings() {
        assert_eq!(eval_ok("($x := 3; $x * 2)", JValue::Null), Some(JValue::from(6i64)));
        assert_eq!(eval_ok("($x := 1; ($x := 2); $x)", JValue::Null), Some(JValue::from(1i64)));
        assert_eq!(eval_ok("$$.a", jvalue!({"a": 7})), Some(JValue::from(7i64)));
    }

    #[test]
    fn test_conditions() {
        assert_eq!(eval_ok("1 > 0 ? 'yes' : 'no'", JValue::Null), Some(JValue::from("yes")));
        assert_eq!(eval_ok("false ? 'yes'", JValue::Null), None);
    }

    #[test]
    fn test_lambdas_and_closures() {
        assert_eq!(
            eval_ok("($add := function($a, $b) { $a + $b }; $add(2, 3))", JValue::Null),
            Some(JValue::from(5i64))
        );
        assert_eq!(
            eval_ok(
                "($mk := function($n) { function($x) { $x + $n } }; $mk(10)(5))",
                JValue::Null
            ),
            Some(JValue::from(15i64))
        );
        assert_eq!(
            eval_ok("(function($x) { $x * 2 })(21)", JValue::Null),
            Some(JValue::from(42i64))
        );
    }

    #[test]
    fn test_lambda_signature_is_checked() {
        let err = eval_err("(function($x)<n:n>{ $x })('a')", JValue::Null);
        assert_eq!(err.code, "T0410");
    }

    #[test]
    fn test_tail_recursion_runs_in_constant_stack() {
        let source = "($count := function($n, $acc) { $n = 0 ? $acc : $count($n - 1, $acc + 1) }; $count(100000, 0))";
        assert_eq!(eval_ok(source, JValue::Null), Some(JValue::from(100000i64)));
    }

    #[test]
    fn test_deep_non_tail_recursion_overflows() {
        let recurse = "($f := function($n) { $n = 0 ? 0 : 1 + $f($n - 1) }; $f(100000))";
        let err = eval_err(recurse, JValue::Null);
        assert_eq!(err.code, "U1001");
        assert!(err.is_fatal());

        let shallow = "($f := function($n) { $n = 0 ? 0 : 1 + $f($n - 1) }; $f(5))";
        assert_eq!(eval_ok(shallow, JValue::Null), Some(JValue::from(5i64)));
    }

    #[test]
    fn test_depth_and_stack_limits() {
        let expr = crate::compile("($f := function($n) { $n = 0 ? 0 : 1 + $f($n - 1) }; $f(10))")
            .unwrap();
        let run = |options: EvalOptions| {
            expr.evaluate_with(&JValue::Null, &crate::Bindings::new(), &options)
        };

        let shallow = EvalOptions {
            max_depth: 10,
            ..EvalOptions::default()
        };
        assert_eq!(run(shallow).unwrap_err().code, "U1001");

        let small_stack = EvalOptions {
            max_depth: usize::MAX,
            max_stack: 4 * 1024,
            ..EvalOptions::default()
        };
        assert_eq!(run(small_stack).unwrap_err().code, "U1001");

        assert_eq!(run(EvalOptions::default()).unwrap(), Some(JValue::from(10i64)));
    }

    #[test]
    fn test_step_budget() {
        let expr = crate::compile("[1..1000].($ * 2)").unwrap();
        let options = EvalOptions {
            max_steps: Some(100),
            ..EvalOptions::default()
        };
        let err = expr
            .evaluate_with(&JValue::Null, &crate::Bindings::new(), &options)
            .unwrap_err();
        assert_eq!(err.code, "U1001");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_partial_application() {
        assert_eq!(
            eval_ok("($first := $substring(?, 0, 2); $first('hello'))", JValue::Null),
            Some(JValue::from("he"))
        );
        assert_eq!(eval_err("$nothing(?, 1)", JValue::Null).code, "T1008");
        assert_eq!(eval_err("substring(?, 1)", JValue::Null).code, "T1007");
    }

    #[test]
    fn test_partial_binds_arguments_when_created() {
        let native = "($x := 1; $p := $substring(?, $x); $x := 3; $p('hello'))";
        assert_eq!(eval_ok(native, JValue::Null), Some(JValue::from("ello")));

        let lambda = "(
            $x := 1;
            $drop := function($s, $n) { $substring($s, $n) };
            $p := $drop(?, $x);
            $x := 3;
            $p('hello')
        )";
        assert_eq!(eval_ok(lambda, JValue::Null), Some(JValue::from("ello")));
    }

    #[test]
    fn test_function_errors() {
        let err = eval_err("uppercase('x')", JValue::Null);
        assert_eq!(err.code, "T1005");
        assert_eq!(err.token.as_deref(), Some("uppercase"));
        assert_eq!(eval_err("($x := 5; $x())", JValue::Null).code, "T1006");
        assert_eq!(eval_err("1 ~> 2", JValue::Null).code, "T2006");
    }

    #[test]
    fn test_apply_operator() {
        assert_eq!(eval_ok("'abc' ~> $uppercase()", JValue::Null), Some(JValue::from("ABC")));
        assert_eq!(
            eval_ok("'abc' ~> $substring(1)", JValue::Null),
            Some(JValue::from("bc"))
        );
        assert_eq!(
            eval_ok("($f := $uppercase ~> $substring(?, 0, 1); $f('xyz'))", JValue::Null),
            Some(JValue::from("X"))
        );
    }

    #[test]
    fn test_transform() {
        let data = jvalue!({"a": {"b": 1, "c": 2}, "d": [{"b": 3}]});
        assert_eq!(
            eval_ok("$ ~> |a|{'b': 10}, 'c'|", data.clone()),
            Some(jvalue!({"a": {"b": 10}, "d": [{"b": 3}]}))
        );
        assert_eq!(
            eval_ok("$ ~> |**[b]|{'seen': true}|", data.clone()),
            Some(jvalue!({"a": {"b": 1, "c": 2, "seen": true}, "d": [{"b": 3, "seen": true}]}))
        );
        // the input itself is left untouched
        assert_eq!(eval_ok("($ ~> |a|{'b': 10}|; a.b)", data.clone()), Some(JValue::from(1i64)));
        assert_eq!(eval_err("$ ~> |a|5|", data.clone()).code, "T2011");
        assert_eq!(eval_err("$ ~> |a|{}, 5|", data).code, "T2012");
        assert_eq!(eval_err("5 ~> |a|{}|", JValue::Null).code, "T2013");
    }

    #[test]
    fn test_recovered_error_node_is_not_evaluable() {
        let (ast, errors) = crate::parser::parse_with_recovery("a +");
        assert!(!errors.is_empty());
        let ast = crate::optimizer::optimize(ast).unwrap();
        let mut evaluator = Evaluator::default();
        let env = Environment::new();
        let err = evaluator
            .evaluate(&ast, &Sequence::from(JValue::Null), &env)
            .unwrap_err();
        assert_eq!(err.code, "S0500");
    }

    #[test]
    fn test_raw_node_is_rejected() {
        let raw = AstNode::Dot {
            lhs: Box::new(AstNode::Name("a".into())),
            rhs: Box::new(AstNode::Name("b".into())),
            position: 1,
        };
        let mut evaluator = Evaluator::default();
        let err = evaluator
            .evaluate(&raw, &Sequence::Absent, &Environment::new())
            .unwrap_err();
        assert_eq!(err.code, "S0206");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_closure_frames_are_released() {
        let frame = Environment::extend(&crate::functions::root_env().unwrap());
        let expr = crate::compile("($f := function() { 1 }; 2)").unwrap();

        let mut evaluator = Evaluator::default();
        let result = evaluator
            .evaluate(expr.ast(), &Sequence::from(JValue::Null), &frame)
            .unwrap();
        // the block frame and the closure bound in it still hold each other
        assert_eq!(Rc::strong_count(&frame), 2);
        assert_eq!(evaluator.release_frames(result), Sequence::from(JValue::from(2i64)));
        assert_eq!(Rc::strong_count(&frame), 1);
    }

    #[test]
    fn test_closure_frames_are_released_on_error() {
        let frame = Environment::extend(&crate::functions::root_env().unwrap());
        let expr = crate::compile("($f := function() { 1 }; $error('boom'))").unwrap();

        let mut evaluator = Evaluator::default();
        let err = evaluator
            .evaluate(expr.ast(), &Sequence::from(JValue::Null), &frame)
            .unwrap_err();
        assert_eq!(err.code, "D3137");
        drop(evaluator);
        assert_eq!(Rc::strong_count(&frame), 1);
    }

    #[test]
    fn test_returned_closure_keeps_its_frames() {
        let frame = Environment::extend(&crate::functions::root_env().unwrap());
        let expr = crate::compile(
            "($count := function($n) { $n = 0 ? 'done' : $count($n - 1) }; $count)",
        )
        .unwrap();
        let input = Sequence::from(JValue::Null);

        let mut evaluator = Evaluator::default();
        let result = evaluator.evaluate(expr.ast(), &input, &frame).unwrap();
        let result = evaluator.release_frames(result);
        let procedure = result.as_procedure().cloned().unwrap();
        assert!(matches!(procedure, Procedure::Retained(_)));

        let ctx = CallContext {
            input: &input,
            env: &frame,
            position: None,
            name: "",
        };
        let value = evaluator
            .call_function(&procedure, vec![Some(JValue::from(3i64))], &ctx)
            .unwrap();
        assert_eq!(value, Some(JValue::from("done")));
        assert_eq!(Rc::strong_count(&frame), 2);

        drop(result);
        drop(procedure);
        assert_eq!(Rc::strong_count(&frame), 1);
    }
}
