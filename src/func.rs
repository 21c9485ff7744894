//! Named callables and the registry used by worker-side execution.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::value::Value;

/// Keyword arguments of a call, ordered so they hash deterministically.
pub type Kwargs = BTreeMap<String, Value>;

type FuncImpl = dyn Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + Send + Sync;

/// A named callable wrapped by [`delay`](crate::delay).
///
/// The name doubles as the callable reference for content hashing and as the
/// lookup key workers use to resolve the function on their side of a process
/// boundary. Userland errors are `anyhow` errors, reported through
/// [`TaskExecutionError`](crate::TaskExecutionError) at `compute()` time.
#[derive(Clone)]
pub struct Func {
    name: Arc<str>,
    call: Arc<FuncImpl>,
}

impl Func {
    pub fn new<F>(name: impl Into<Arc<str>>, call: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            call: Arc::new(call),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, args: &[Value], kwargs: &Kwargs) -> anyhow::Result<Value> {
        (self.call)(args, kwargs)
    }
}

impl std::fmt::Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Func({})", self.name)
    }
}

/// Maps function names to callables.
///
/// Local backends execute closures directly, but the process and distributed
/// backends only ship a function *name* across the worker boundary; the
/// worker resolves it here. A name missing from the worker-side registry is a
/// task execution failure naming the function.
#[derive(Clone, Default)]
pub struct Registry {
    map: HashMap<Arc<str>, Func>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the `tsumugi.*` builtin functions used
    /// by chunked reductions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::agg::register_builtins(&mut registry);
        registry
    }

    /// Registers a function under its own name, replacing any previous entry.
    pub fn register(&mut self, func: Func) {
        self.map.insert(Arc::from(func.name()), func);
    }

    pub fn get(&self, name: &str) -> Option<&Func> {
        self.map.get(name)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
