//! Deferred expressions.
//!
//! [`delay`] wraps a [`Func`] so that calling it builds a [`Delayed`] node
//! instead of executing anything. Arithmetic operators, [`Delayed::attr`] and
//! [`Delayed::item`] likewise produce new nodes, so a chain of derived
//! expressions assembles a single graph with zero eager evaluation. Only
//! [`Delayed::compute`] runs user code.
//!
//! Interception is represented as explicit tagged operations ([`Op`])
//! dispatched by one evaluator, rather than dynamic method dispatch.

use std::sync::Arc;

use crate::error::ComputeError;
use crate::func::{Func, Kwargs};
use crate::graph::Graph;
use crate::hash::TaskId;
use crate::sched::{Backend, ComputeOptions, ExecutionResult};
use crate::value::{BinOp, Value, canonical_bytes};

/// The operation a task performs, dispatched by a single evaluator.
#[derive(Clone, Debug)]
pub enum Op {
    /// Invoke a named callable with positional and keyword arguments.
    Call { func: Func, kwargs: Kwargs },
    /// Read a field of a record.
    GetAttr { name: String },
    /// Index into a list or record; arguments are `[container, key]`.
    GetItem,
    /// Apply a binary operator; arguments are `[lhs, rhs]`.
    BinOp { op: BinOp },
}

impl Op {
    /// Short label identifying the operation in logs and errors.
    pub fn label(&self) -> String {
        match self {
            Op::Call { func, .. } => func.name().to_owned(),
            Op::GetAttr { name } => format!("getattr '{name}'"),
            Op::GetItem => "getitem".to_owned(),
            Op::BinOp { op } => format!("operator '{}'", op.symbol()),
        }
    }
}

/// An argument of a deferred expression: either a literal value or another
/// deferred computation, which becomes a dependency edge.
#[derive(Clone, Debug)]
pub enum TaskArg {
    Literal(Value),
    Dep(Delayed),
}

impl From<Delayed> for TaskArg {
    fn from(value: Delayed) -> Self {
        TaskArg::Dep(value)
    }
}

impl From<&Delayed> for TaskArg {
    fn from(value: &Delayed) -> Self {
        TaskArg::Dep(value.clone())
    }
}

impl From<Value> for TaskArg {
    fn from(value: Value) -> Self {
        TaskArg::Literal(value)
    }
}

impl From<bool> for TaskArg {
    fn from(value: bool) -> Self {
        TaskArg::Literal(value.into())
    }
}

impl From<i64> for TaskArg {
    fn from(value: i64) -> Self {
        TaskArg::Literal(value.into())
    }
}

impl From<i32> for TaskArg {
    fn from(value: i32) -> Self {
        TaskArg::Literal(value.into())
    }
}

impl From<f64> for TaskArg {
    fn from(value: f64) -> Self {
        TaskArg::Literal(value.into())
    }
}

impl From<&str> for TaskArg {
    fn from(value: &str) -> Self {
        TaskArg::Literal(value.into())
    }
}

impl From<String> for TaskArg {
    fn from(value: String) -> Self {
        TaskArg::Literal(value.into())
    }
}

/// Shorthand for a literal argument in a [`Deferred::call`] argument list.
pub fn lit(value: impl Into<Value>) -> TaskArg {
    TaskArg::Literal(value.into())
}

pub(crate) struct Expr {
    pub(crate) op: Op,
    pub(crate) args: Vec<TaskArg>,
    pub(crate) id: TaskId,
}

/// A handle to a deferred computation.
///
/// `Delayed` is the future/result handle of the library: it is cheap to
/// clone, immutable once built, and resolves to a [`Value`] when
/// [`compute`](Delayed::compute) is called. Handles built from identical
/// expressions share a [`TaskId`], so the graph deduplicates them.
#[derive(Clone)]
pub struct Delayed {
    pub(crate) inner: Arc<Expr>,
}

impl Delayed {
    pub(crate) fn build(op: Op, args: Vec<TaskArg>) -> Self {
        let id = content_id(&op, &args);
        Delayed {
            inner: Arc::new(Expr { op, args, id }),
        }
    }

    /// The content-derived identity of this node.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Builds a field access on the record this handle resolves to.
    pub fn attr(&self, name: impl Into<String>) -> Delayed {
        Delayed::build(
            Op::GetAttr { name: name.into() },
            vec![TaskArg::Dep(self.clone())],
        )
    }

    /// Builds an index access on the list or record this handle resolves to.
    /// The key may itself be deferred.
    pub fn item(&self, key: impl Into<TaskArg>) -> Delayed {
        Delayed::build(Op::GetItem, vec![TaskArg::Dep(self.clone()), key.into()])
    }

    /// Executes the graph reachable from this handle and blocks until the
    /// value is resolved, using default [`ComputeOptions`].
    pub fn compute(&self, backend: &dyn Backend) -> Result<Value, ComputeError> {
        self.compute_with(backend, &ComputeOptions::default())
    }

    /// [`compute`](Delayed::compute) with explicit per-call options. There is
    /// no ambient configuration; everything is passed here.
    pub fn compute_with(
        &self,
        backend: &dyn Backend,
        options: &ComputeOptions,
    ) -> Result<Value, ComputeError> {
        let mut result = compute_many(std::slice::from_ref(self), backend, options)?;
        extract(&mut result, self.id())
    }
}

impl std::fmt::Debug for Delayed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delayed({} @ {})", self.inner.op.label(), self.id())
    }
}

/// Evaluates several outputs over one shared graph, so common
/// sub-computations run once.
pub fn compute_many(
    roots: &[Delayed],
    backend: &dyn Backend,
    options: &ComputeOptions,
) -> Result<ExecutionResult, ComputeError> {
    let graph = Graph::from_delayed(roots);
    let targets: Vec<TaskId> = roots.iter().map(Delayed::id).collect();
    backend.execute(&graph, &targets, options)
}

fn extract(result: &mut ExecutionResult, id: TaskId) -> Result<Value, ComputeError> {
    if let Some(value) = result.take(id) {
        return Ok(value);
    }
    match result.take_failure(id) {
        Some(err) => Err(ComputeError::Task(err)),
        None => Err(ComputeError::Cancelled),
    }
}

/// Wraps a callable so that invoking it defers execution.
///
/// ```
/// use tsumugi::{delay, lit, Func, Value, sched::Serial};
///
/// let add = Func::new("add", |args, _| {
///     Ok(Value::Float(args[0].as_f64().unwrap() + args[1].as_f64().unwrap()))
/// });
/// let sum = delay(add).call([lit(1.0), lit(2.0)]);
/// assert_eq!(sum.compute(&Serial).unwrap(), Value::Float(3.0));
/// ```
pub fn delay(func: Func) -> Deferred {
    Deferred {
        func,
        kwargs: Kwargs::new(),
    }
}

/// A wrapped callable returned by [`delay`]; calling it yields a [`Delayed`]
/// node instead of a value.
#[derive(Clone)]
pub struct Deferred {
    func: Func,
    kwargs: Kwargs,
}

impl Deferred {
    /// Attaches a keyword argument. Kwargs are literals; a deferred value
    /// belongs in the positional arguments.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Builds the deferred call node. No user code runs here. Mixed literal
    /// and deferred arguments convert through [`TaskArg`]:
    /// `f.call([lit(1), dep.into()])`.
    pub fn call(&self, args: impl IntoIterator<Item = TaskArg>) -> Delayed {
        Delayed::build(
            Op::Call {
                func: self.func.clone(),
                kwargs: self.kwargs.clone(),
            },
            args.into_iter().collect(),
        )
    }
}

fn content_id(op: &Op, args: &[TaskArg]) -> TaskId {
    let mut hasher = blake3::Hasher::new();

    match op {
        Op::Call { func, kwargs } => {
            hasher.update(b"call");
            hasher.update(func.name().as_bytes());
            hasher.update(&canonical_bytes(kwargs));
        }
        Op::GetAttr { name } => {
            hasher.update(b"getattr");
            hasher.update(name.as_bytes());
        }
        Op::GetItem => {
            hasher.update(b"getitem");
        }
        Op::BinOp { op } => {
            hasher.update(b"binop");
            hasher.update(op.symbol().as_bytes());
        }
    }

    for arg in args {
        match arg {
            TaskArg::Literal(value) => {
                hasher.update(b"lit");
                hasher.update(&canonical_bytes(value));
            }
            TaskArg::Dep(dep) => {
                hasher.update(b"ref");
                hasher.update(dep.id().as_bytes());
            }
        }
    }

    TaskId::from_hasher(&hasher)
}

macro_rules! impl_binop {
    ($trait:ident, $method:ident, $op:expr) => {
        impl std::ops::$trait for Delayed {
            type Output = Delayed;

            fn $method(self, rhs: Delayed) -> Delayed {
                Delayed::build(Op::BinOp { op: $op }, vec![self.into(), rhs.into()])
            }
        }

        impl std::ops::$trait for &Delayed {
            type Output = Delayed;

            fn $method(self, rhs: &Delayed) -> Delayed {
                Delayed::build(Op::BinOp { op: $op }, vec![self.into(), rhs.into()])
            }
        }

        impl std::ops::$trait<Value> for Delayed {
            type Output = Delayed;

            fn $method(self, rhs: Value) -> Delayed {
                Delayed::build(Op::BinOp { op: $op }, vec![self.into(), rhs.into()])
            }
        }

        impl std::ops::$trait<i64> for Delayed {
            type Output = Delayed;

            fn $method(self, rhs: i64) -> Delayed {
                Delayed::build(Op::BinOp { op: $op }, vec![self.into(), rhs.into()])
            }
        }

        impl std::ops::$trait<f64> for Delayed {
            type Output = Delayed;

            fn $method(self, rhs: f64) -> Delayed {
                Delayed::build(Op::BinOp { op: $op }, vec![self.into(), rhs.into()])
            }
        }
    };
}

impl_binop!(Add, add, BinOp::Add);
impl_binop!(Sub, sub, BinOp::Sub);
impl_binop!(Mul, mul, BinOp::Mul);
impl_binop!(Div, div, BinOp::Div);
