//! Pluggable execution backends.
//!
//! A [`Backend`] takes a validated [`Graph`] and a set of requested outputs
//! and runs the tasks in dependency order. Four backends are provided:
//!
//! * [`Serial`] — deterministic single-thread execution, for debugging.
//! * [`ThreadPool`] — N worker threads sharing process memory.
//! * [`ProcessPool`] — N child processes, tasks serialized per call.
//! * [`RemotePool`] — a distributed worker set behind the
//!   [`RemoteWorker`] trait, with lost-worker rescheduling.
//!
//! Each task moves `Pending -> Ready -> Running -> Done` (or `Failed`); a
//! task becomes `Ready` exactly when all of its dependencies are `Done`, so
//! for any edge A -> B, A's completion is strictly ordered before B starts.
//! Backend choice and all knobs are per-call [`ComputeOptions`]; there is no
//! process-global scheduler configuration.

mod process;
mod remote;
mod serial;
mod threaded;

pub use process::{ProcessPool, WorkerCommand, is_worker_process};
pub use remote::{RemotePool, RemoteWorker, WorkerFailure};
pub use serial::Serial;
pub use threaded::ThreadPool;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ComputeError, TaskExecutionError};
use crate::graph::{Arg, Graph, TaskNode};
use crate::hash::TaskId;
use crate::value::Value;

/// Executes task graphs. Implementations differ only in *where* tasks run;
/// ordering, failure and cancellation semantics are shared.
pub trait Backend {
    fn execute(
        &self,
        graph: &Graph,
        targets: &[TaskId],
        options: &ComputeOptions,
    ) -> Result<ExecutionResult, ComputeError>;
}

/// Per-call configuration. Passed explicitly to every `compute()`; effects
/// never leak past the call.
#[derive(Clone, Debug)]
pub struct ComputeOptions {
    /// Cooperative cancellation; see [`CancelToken`].
    pub cancel: Option<CancelToken>,
    /// How many times a task is rescheduled after losing its worker
    /// (process and distributed backends).
    pub retries: u32,
    /// Return whatever finished instead of failing the whole call.
    pub best_effort: bool,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            cancel: None,
            retries: 3,
            best_effort: false,
        }
    }
}

impl ComputeOptions {
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Cooperative cancellation handle.
///
/// Cancelling prevents tasks that have not yet started from starting;
/// callables already running are opaque blocking calls and are left to
/// finish.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The values produced by one compute call, keyed by task id.
///
/// Populated incrementally as tasks finish; a value is only ever recorded
/// after all of its dependencies completed. Under best-effort the per-task
/// failures are kept alongside.
#[derive(Debug, Default)]
pub struct ExecutionResult {
    values: HashMap<TaskId, Value>,
    failures: HashMap<TaskId, TaskExecutionError>,
}

impl ExecutionResult {
    pub(crate) fn new(
        values: HashMap<TaskId, Value>,
        failures: HashMap<TaskId, TaskExecutionError>,
    ) -> Self {
        Self { values, failures }
    }

    pub fn value(&self, id: TaskId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn take(&mut self, id: TaskId) -> Option<Value> {
        self.values.remove(&id)
    }

    pub fn failure(&self, id: TaskId) -> Option<&TaskExecutionError> {
        self.failures.get(&id)
    }

    pub(crate) fn take_failure(&mut self, id: TaskId) -> Option<TaskExecutionError> {
        self.failures.remove(&id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskExecutionError> {
        self.failures.values()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Shared dependency bookkeeping for the dataflow scheduler loops.
///
/// Built once per compute call from the reachable sub-graph: who depends on
/// whom, and how many unresolved dependencies each task starts with.
pub(crate) struct RunPlan {
    pub needed: HashSet<TaskId>,
    pub dependents: HashMap<TaskId, Vec<TaskId>>,
    pub dependency_counts: HashMap<TaskId, usize>,
}

impl RunPlan {
    pub fn build(
        graph: &Graph,
        targets: &[TaskId],
    ) -> Result<Self, ComputeError> {
        graph.validate(targets)?;
        let needed = graph.needed(targets)?;

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut dependency_counts: HashMap<TaskId, usize> = HashMap::new();

        for &id in &needed {
            let node = graph.get(id).ok_or(crate::error::GraphError::UnknownTarget(id))?;
            let deps = node.dependencies();
            dependency_counts.insert(id, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id);
            }
        }

        Ok(Self {
            needed,
            dependents,
            dependency_counts,
        })
    }

    /// Tasks that are ready immediately (no dependencies).
    pub fn seeds(&self) -> Vec<TaskId> {
        let mut seeds: Vec<TaskId> = self
            .dependency_counts
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&id, _)| id)
            .collect();
        seeds.sort_unstable();
        seeds
    }

    pub fn total(&self) -> usize {
        self.needed.len()
    }
}

/// Substitutes dependency values for argument references.
pub(crate) fn resolve_args(node: &TaskNode, values: &HashMap<TaskId, Value>) -> Vec<Value> {
    node.args
        .iter()
        .map(|arg| match arg {
            Arg::Literal(value) => value.clone(),
            Arg::Task(id) => values
                .get(id)
                .cloned()
                .expect("scheduler ran a task before its dependencies"),
        })
        .collect()
}

/// Tracks tasks that can never run because an ancestor failed or was
/// skipped. Counting them as completed keeps the scheduler loops finite.
pub(crate) struct Poison {
    aborted: HashSet<TaskId>,
}

impl Poison {
    pub fn new() -> Self {
        Self {
            aborted: HashSet::new(),
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.aborted.contains(&id)
    }

    /// Marks a single task as unrunnable; returns false if it already was.
    pub fn mark(&mut self, id: TaskId) -> bool {
        self.aborted.insert(id)
    }

    /// Marks every transitive dependent of `id` as unrunnable, returning the
    /// tasks newly poisoned.
    pub fn spread(&mut self, plan: &RunPlan, id: TaskId) -> Vec<TaskId> {
        let mut newly = Vec::new();
        let mut stack: VecDeque<TaskId> = VecDeque::new();
        stack.push_back(id);

        while let Some(current) = stack.pop_front() {
            if let Some(dependents) = plan.dependents.get(&current) {
                for &dependent in dependents {
                    if self.aborted.insert(dependent) {
                        newly.push(dependent);
                        stack.push_back(dependent);
                    }
                }
            }
        }

        newly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{Delayed, delay, lit};
    use crate::func::Func;

    fn noop() -> Func {
        Func::new("noop", |_, _| Ok(Value::Null))
    }

    fn diamond() -> (Delayed, Delayed, Delayed, Delayed) {
        let base = delay(noop()).call([lit(0)]);
        let left = base.clone() + 1i64;
        let right = base.clone() + 2i64;
        let top = left.clone() + right.clone();
        (base, left, right, top)
    }

    #[test]
    fn plan_counts_unique_dependencies() {
        let (base, left, right, top) = diamond();
        let graph = Graph::from_delayed(std::slice::from_ref(&top));
        let plan = RunPlan::build(&graph, &[top.id()]).unwrap();

        assert_eq!(plan.total(), 4);
        assert_eq!(plan.seeds(), vec![base.id()]);
        assert_eq!(plan.dependency_counts[&top.id()], 2);
        let mut parents = plan.dependents[&base.id()].clone();
        parents.sort_unstable();
        let mut expected = vec![left.id(), right.id()];
        expected.sort_unstable();
        assert_eq!(parents, expected);
    }

    #[test]
    fn duplicated_argument_counts_once() {
        let base = delay(noop()).call([lit(0)]);
        let doubled = base.clone() + base.clone();
        let graph = Graph::from_delayed(std::slice::from_ref(&doubled));
        let plan = RunPlan::build(&graph, &[doubled.id()]).unwrap();

        assert_eq!(plan.dependency_counts[&doubled.id()], 1);
    }

    #[test]
    fn poison_spreads_transitively() {
        let (base, left, right, top) = diamond();
        let graph = Graph::from_delayed(std::slice::from_ref(&top));
        let plan = RunPlan::build(&graph, &[top.id()]).unwrap();

        let mut poison = Poison::new();
        let newly = poison.spread(&plan, base.id());
        assert_eq!(newly.len(), 3);
        assert!(poison.contains(left.id()));
        assert!(poison.contains(right.id()));
        assert!(poison.contains(top.id()));
        // Idempotent.
        assert!(poison.spread(&plan, base.id()).is_empty());
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        let options = ComputeOptions::default().with_cancel(token.clone());
        assert!(options.is_cancelled());
    }
}
