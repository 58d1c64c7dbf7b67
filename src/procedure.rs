// Callable values: natives, lambdas, partial applications, transforms and compositions
// Every variant is Rc-shared so JValue::Function clones stay O(1)

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::ast::AstNode;
use crate::environment::{Env, FrameGuard};
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::sequence::Sequence;
use crate::signature::Signature;
use crate::value::JValue;

/// Call site of an application: what a native implementation can see
#[derive(Clone, Copy)]
pub struct CallContext<'a> {
    /// Input (`$`) at the call site
    pub input: &'a Sequence,
    /// Frame active at the call site
    pub env: &'a Env,
    pub position: Option<usize>,
    /// Name the procedure was invoked by, for signature errors
    pub name: &'a str,
}

pub type NativeImpl =
    dyn Fn(&mut Evaluator, &[Option<JValue>], &CallContext<'_>) -> Result<Sequence>;

/// A function implemented in Rust
pub struct NativeFunction {
    pub name: String,
    /// Number of required parameters; callbacks receive at most this many arguments
    pub arity: usize,
    pub signature: Option<Signature>,
    pub implementation: Rc<NativeImpl>,
}

/// A closure created by `function($a, $b) { ... }`
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Arc<AstNode>,
    pub signature: Option<Arc<Signature>>,
    pub thunk: bool,
    /// Frame the lambda was defined in
    pub env: Env,
    /// Input at the definition site; the body sees it as `$`
    pub input: Sequence,
}

/// One argument slot of a partial application
#[derive(Clone, Debug)]
pub enum PartialArg {
    Placeholder,
    Bound(Sequence),
}

pub struct PartialApplication {
    pub procedure: Procedure,
    pub args: Vec<PartialArg>,
}

/// The function produced by `| pattern | update, delete |`
pub struct Transformer {
    pub pattern: Arc<AstNode>,
    pub update: Arc<AstNode>,
    pub delete: Option<Arc<AstNode>>,
    pub env: Env,
    pub position: usize,
}

/// A function returned from an evaluation.
///
/// Holds the evaluation's closure frames: they are cleared once the last
/// returned function referring to them is dropped.
pub struct Retained {
    pub procedure: Procedure,
    pub frames: Rc<FrameGuard>,
}

#[derive(Clone)]
pub enum Procedure {
    Native(Rc<NativeFunction>),
    Lambda(Rc<Lambda>),
    Partial(Rc<PartialApplication>),
    Transform(Rc<Transformer>),
    /// `f ~> g`: apply `f`, then `g` to its result
    Composition(Rc<(Procedure, Procedure)>),
    Retained(Rc<Retained>),
}

impl Procedure {
    /// Wrap a Rust closure as a native function
    pub fn native<F>(name: impl Into<String>, arity: usize, signature: Option<Signature>, f: F) -> Self
    where
        F: Fn(&mut Evaluator, &[Option<JValue>], &CallContext<'_>) -> Result<Sequence> + 'static,
    {
        Procedure::Native(Rc::new(NativeFunction {
            name: name.into(),
            arity,
            signature,
            implementation: Rc::new(f),
        }))
    }

    /// Number of arguments the procedure expects
    pub fn arity(&self) -> usize {
        match self {
            Procedure::Native(native) => native.arity,
            Procedure::Lambda(lambda) => lambda.params.len(),
            Procedure::Partial(partial) => partial
                .args
                .iter()
                .filter(|a| matches!(a, PartialArg::Placeholder))
                .count(),
            Procedure::Transform(_) | Procedure::Composition(_) => 1,
            Procedure::Retained(retained) => retained.procedure.arity(),
        }
    }

    pub fn is_thunk(&self) -> bool {
        matches!(self, Procedure::Lambda(lambda) if lambda.thunk)
    }

    /// Identity comparison; two procedures are equal only if they are the same closure
    pub fn ptr_eq(&self, other: &Procedure) -> bool {
        match (self, other) {
            (Procedure::Native(a), Procedure::Native(b)) => Rc::ptr_eq(a, b),
            (Procedure::Lambda(a), Procedure::Lambda(b)) => Rc::ptr_eq(a, b),
            (Procedure::Partial(a), Procedure::Partial(b)) => Rc::ptr_eq(a, b),
            (Procedure::Transform(a), Procedure::Transform(b)) => Rc::ptr_eq(a, b),
            (Procedure::Composition(a), Procedure::Composition(b)) => Rc::ptr_eq(a, b),
            (Procedure::Retained(a), b) => a.procedure.ptr_eq(b),
            (a, Procedure::Retained(b)) => a.ptr_eq(&b.procedure),
            _ => false,
        }
    }

    /// Name used in signature errors
    pub fn name(&self) -> &str {
        match self {
            Procedure::Native(native) => &native.name,
            Procedure::Partial(partial) => partial.procedure.name(),
            Procedure::Retained(retained) => retained.procedure.name(),
            _ => "",
        }
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Native(native) => write!(f, "Native({})", native.name),
            Procedure::Lambda(lambda) => write!(
                f,
                "Lambda({}{})",
                lambda.params.join(", "),
                if lambda.thunk { ", thunk" } else { "" }
            ),
            Procedure::Partial(partial) => write!(f, "Partial({:?})", partial.procedure),
            Procedure::Transform(_) => write!(f, "Transform"),
            Procedure::Composition(pair) => write!(f, "Composition({:?}, {:?})", pair.0, pair.1),
            Procedure::Retained(retained) => fmt::Debug::fmt(&retained.procedure, f),
        }
    }
}
