// jsonata-engine - JSONata expression language for Rust
// Copyright (c) 2025 jsonata-engine contributors
// Licensed under the MIT License

//! # jsonata-engine
//!
//! A JSON query and transformation language: compile an expression once,
//! then evaluate it against any number of JSON documents.
//!
//! ## Architecture
//!
//! - `parser` - Tokenizer and Pratt parser (expression text to raw AST)
//! - `optimizer` - Rewrites the raw AST into the canonical AST the evaluator runs
//! - `ast` - Abstract Syntax Tree definitions
//! - `value` / `sequence` - Runtime values and the result box distinguishing absence
//! - `environment` - Lexical frames for variable bindings
//! - `evaluator` - Expression evaluator, including the function-call trampoline
//! - `procedure` / `signature` - Callable values and argument validation
//! - `functions` - Built-in function library
//! - `datetime` - Date/time handling functions
//!
//! ## Example
//!
//! ```
//! use jsonata_engine::{compile, jvalue};
//!
//! let expr = compile("orders[price > 100].product").unwrap();
//! let data = jvalue!({"orders": [{"product": "A", "price": 150}, {"product": "B", "price": 50}]});
//! assert_eq!(expr.evaluate(&data).unwrap(), Some(jvalue!("A")));
//! ```

pub mod ast;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod functions;
pub mod optimizer;
pub mod parser;
pub mod procedure;
pub mod sequence;
pub mod signature;
pub mod value;
mod datetime;

pub use ast::AstNode;
pub use error::{Error, ErrorFamily, Result};
pub use evaluator::{EvalOptions, Evaluator};
pub use parser::parse_with_recovery;
pub use procedure::Procedure;
pub use sequence::Sequence;
pub use value::JValue;

use environment::{Env, Environment};
use signature::Signature;

/// A compiled expression.
///
/// Holds the canonical AST; evaluation never mutates it, so one expression
/// can be evaluated repeatedly against different inputs.
#[derive(Debug, Clone)]
pub struct Expression {
    ast: AstNode,
}

impl Expression {
    /// Evaluate against `input`. `None` means the result is absent.
    pub fn evaluate(&self, input: &JValue) -> Result<Option<JValue>> {
        self.evaluate_with(input, &Bindings::new(), &EvalOptions::default())
    }

    /// Evaluate with external variable bindings and evaluation limits
    pub fn evaluate_with(
        &self,
        input: &JValue,
        bindings: &Bindings,
        options: &EvalOptions,
    ) -> Result<Option<JValue>> {
        let frame = bindings.frame()?;
        let input = Sequence::from(input.clone());
        frame.bind("$", input.clone());

        // on error the evaluator drops here, clearing its closure frames
        let mut evaluator = Evaluator::new(options.clone());
        let result = evaluator.evaluate(&self.ast, &input, &frame)?;
        Ok(evaluator.release_frames(result).into_value())
    }

    /// Evaluate with JSON text in and out.
    ///
    /// An absent result is the empty string.
    pub fn evaluate_json(&self, json: &str) -> Result<String> {
        let input = JValue::from_json_str(json).map_err(|e| {
            Error::new("D0100", format!("Input is not valid JSON: {}", e))
        })?;
        match self.evaluate(&input)? {
            Some(value) => Ok(value::stringify(&value, false)),
            None => Ok(String::new()),
        }
    }

    /// The canonical AST
    pub fn ast(&self) -> &AstNode {
        &self.ast
    }
}

/// Compile an expression: tokenize, parse and optimize.
///
/// # Examples
///
/// ```
/// use jsonata_engine::{compile, jvalue};
///
/// let expr = compile("$uppercase(name)").unwrap();
/// assert_eq!(expr.evaluate(&jvalue!({"name": "alice"})).unwrap(), Some(jvalue!("ALICE")));
/// ```
pub fn compile(source: &str) -> Result<Expression> {
    let ast = optimizer::optimize(parser::parse(source)?)?;
    log::debug!("compiled {} byte expression to {}", source.len(), ast.kind());
    Ok(Expression { ast })
}

/// Compile and evaluate in one call
pub fn evaluate(source: &str, input: &JValue) -> Result<Option<JValue>> {
    compile(source)?.evaluate(input)
}

/// External variables visible to an evaluation as `$name`
#[derive(Default)]
pub struct Bindings {
    values: Vec<(String, Sequence)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a value to `$name`
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<JValue>) -> &mut Self {
        self.values.push((name.into(), Sequence::from(value.into())));
        self
    }

    /// Bind a host function to `$name`.
    ///
    /// With a signature such as `<n-n:n>`, arguments are validated (and the
    /// context value substituted) before `f` sees them.
    pub fn bind_function<F>(
        &mut self,
        name: impl Into<String>,
        signature: Option<&str>,
        f: F,
    ) -> Result<&mut Self>
    where
        F: Fn(&[Option<JValue>]) -> Result<Option<JValue>> + 'static,
    {
        let name = name.into();
        let signature = signature.map(Signature::parse).transpose()?;
        let arity = signature
            .as_ref()
            .map_or(1, |s| s.params.iter().filter(|p| !p.optional).count());
        let procedure = Procedure::native(name.clone(), arity, signature, move |_, args, _| {
            f(args).map(Sequence::from)
        });
        self.values.push((name, Sequence::from(JValue::function(procedure))));
        Ok(self)
    }

    /// Frame for one evaluation: a child of the bindings, which sit above the natives
    fn frame(&self) -> Result<Env> {
        let root = functions::root_env()?;
        let outer = if self.values.is_empty() {
            root
        } else {
            let outer = Environment::extend(&root);
            for (name, value) in &self.values {
                outer.bind(name.clone(), value.clone());
            }
            outer
        };
        Ok(Environment::extend(&outer))
    }
}
