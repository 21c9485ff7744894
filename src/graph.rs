//! The flat task graph.
//!
//! A [`Graph`] maps [`TaskId`]s to task definitions. It is assembled either
//! by flattening [`Delayed`] expression trees (always acyclic, deduplicated
//! by content hash) or by hand through [`Graph::insert`]. Hand-built graphs
//! can express cycles and dangling references, so every backend runs
//! [`Graph::validate`] before executing anything: graph defects are build
//! errors, never execution errors.

use std::collections::{HashMap, HashSet};

use petgraph::graph::NodeIndex;

use crate::error::GraphError;
use crate::expr::{Delayed, Op, TaskArg};
use crate::hash::TaskId;
use crate::value::Value;

/// An argument of a graph node: a literal value or a reference to another
/// task's output.
#[derive(Clone, Debug)]
pub enum Arg {
    Literal(Value),
    Task(TaskId),
}

/// One task definition: the operation plus its resolved-or-referenced
/// arguments. Immutable once inserted.
#[derive(Clone, Debug)]
pub struct TaskNode {
    pub op: Op,
    pub args: Vec<Arg>,
}

impl TaskNode {
    /// The distinct task ids this node depends on.
    pub fn dependencies(&self) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut deps = Vec::new();
        for arg in &self.args {
            if let Arg::Task(id) = arg
                && seen.insert(*id)
            {
                deps.push(*id);
            }
        }
        deps
    }
}

/// A mapping from task id to task definition.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<TaskId, TaskNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flattens expression trees into a graph, collapsing structurally
    /// identical subtrees into single nodes.
    pub fn from_delayed(roots: &[Delayed]) -> Self {
        let mut graph = Graph::new();
        let mut stack: Vec<Delayed> = roots.to_vec();

        while let Some(delayed) = stack.pop() {
            let id = delayed.id();
            if graph.nodes.contains_key(&id) {
                continue;
            }

            let mut args = Vec::with_capacity(delayed.inner.args.len());
            for arg in &delayed.inner.args {
                match arg {
                    TaskArg::Literal(value) => args.push(Arg::Literal(value.clone())),
                    TaskArg::Dep(dep) => {
                        args.push(Arg::Task(dep.id()));
                        stack.push(dep.clone());
                    }
                }
            }

            graph.nodes.insert(
                id,
                TaskNode {
                    op: delayed.inner.op.clone(),
                    args,
                },
            );
        }

        graph
    }

    /// Inserts a node under an explicit id. This is the raw escape hatch;
    /// ids need not be content-derived, and nothing is checked until
    /// [`validate`](Graph::validate).
    pub fn insert(&mut self, id: TaskId, node: TaskNode) {
        self.nodes.insert(id, node);
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.nodes.keys().copied()
    }

    /// Checks the graph invariants before execution: every referenced id
    /// exists, the requested outputs exist, and the graph is acyclic
    /// (including self-reference).
    pub fn validate(&self, targets: &[TaskId]) -> Result<(), GraphError> {
        for &target in targets {
            if !self.nodes.contains_key(&target) {
                return Err(GraphError::UnknownTarget(target));
            }
        }

        for (&id, node) in &self.nodes {
            for dep in node.dependencies() {
                if !self.nodes.contains_key(&dep) {
                    return Err(GraphError::MissingDependency { task: id, missing: dep });
                }
            }
        }

        self.toposort().map(|_| ())
    }

    /// A deterministic dependency order over all nodes, or the cycle that
    /// prevents one.
    pub fn toposort(&self) -> Result<Vec<TaskId>, GraphError> {
        // Sorted insertion keeps the petgraph order independent of HashMap
        // iteration order, which keeps serial execution deterministic.
        let mut ids: Vec<TaskId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();

        let mut petgraph = petgraph::Graph::<TaskId, ()>::new();
        let mut indices: HashMap<TaskId, NodeIndex> = HashMap::with_capacity(ids.len());
        for &id in &ids {
            indices.insert(id, petgraph.add_node(id));
        }

        for &id in &ids {
            for dep in self.nodes[&id].dependencies() {
                if let (Some(&from), Some(&to)) = (indices.get(&dep), indices.get(&id)) {
                    petgraph.add_edge(from, to, ());
                }
            }
        }

        match petgraph::algo::toposort(&petgraph, None) {
            Ok(order) => Ok(order.into_iter().map(|ix| petgraph[ix]).collect()),
            Err(cycle) => Err(GraphError::Cycle(petgraph[cycle.node_id()])),
        }
    }

    /// The set of tasks reachable from the requested outputs, i.e. the
    /// sub-graph a compute call actually needs to run.
    pub fn needed(&self, targets: &[TaskId]) -> Result<HashSet<TaskId>, GraphError> {
        let mut needed = HashSet::new();
        let mut stack: Vec<TaskId> = targets.to_vec();

        while let Some(id) = stack.pop() {
            if !needed.insert(id) {
                continue;
            }
            let node = self
                .nodes
                .get(&id)
                .ok_or(GraphError::UnknownTarget(id))?;
            for dep in node.dependencies() {
                if !needed.contains(&dep) {
                    stack.push(dep);
                }
            }
        }

        Ok(needed)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<TaskId> = self.nodes.keys().copied().collect();
        ids.sort_unstable();

        writeln!(f, "Graph ({} nodes)", ids.len())?;
        for id in ids {
            let node = &self.nodes[&id];
            write!(f, "    {id} = {}", node.op.label())?;
            for dep in node.dependencies() {
                write!(f, " <- {dep}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{delay, lit};
    use crate::func::Func;

    fn noop() -> Func {
        Func::new("noop", |_, _| Ok(Value::Null))
    }

    fn raw_id(seed: &str) -> TaskId {
        // Hand-built ids for raw graph tests.
        TaskId::from_hasher(blake3::Hasher::new().update(seed.as_bytes()))
    }

    fn call_node(args: Vec<Arg>) -> TaskNode {
        TaskNode {
            op: Op::Call {
                func: noop(),
                kwargs: Default::default(),
            },
            args,
        }
    }

    #[test]
    fn shared_subtrees_are_deduplicated() {
        let base = delay(noop()).call([lit(1)]);
        let left = base.clone() + 1i64;
        let right = base.clone() + 2i64;
        let top = left + right;

        let graph = Graph::from_delayed(&[top.clone()]);
        // base, left, right, top; base appears once despite two parents.
        assert_eq!(graph.len(), 4);
        assert!(graph.get(base.id()).is_some());
        assert!(graph.validate(&[top.id()]).is_ok());
    }

    #[test]
    fn missing_dependency_is_a_build_error() {
        let mut graph = Graph::new();
        let a = raw_id("a");
        let ghost = raw_id("ghost");
        graph.insert(a, call_node(vec![Arg::Task(ghost)]));

        match graph.validate(&[a]) {
            Err(GraphError::MissingDependency { task, missing }) => {
                assert_eq!(task, a);
                assert_eq!(missing, ghost);
            }
            other => panic!("expected MissingDependency, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_build_error() {
        let mut graph = Graph::new();
        let a = raw_id("a");
        graph.insert(a, call_node(vec![Arg::Task(a)]));

        assert!(matches!(graph.validate(&[a]), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn mutual_reference_is_a_build_error() {
        let mut graph = Graph::new();
        let a = raw_id("a");
        let b = raw_id("b");
        graph.insert(a, call_node(vec![Arg::Task(b)]));
        graph.insert(b, call_node(vec![Arg::Task(a)]));

        assert!(matches!(graph.validate(&[a]), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn unknown_target_is_a_build_error() {
        let graph = Graph::new();
        let ghost = TaskId::from_hasher(blake3::Hasher::new().update(b"nope"));
        assert!(matches!(
            graph.validate(&[ghost]),
            Err(GraphError::UnknownTarget(_))
        ));
    }

    #[test]
    fn needed_is_limited_to_reachable_nodes() {
        let a = delay(noop()).call([lit(1)]);
        let b = delay(noop()).call([lit(2)]);
        let top = a.clone() + 1i64;

        let graph = Graph::from_delayed(&[top.clone(), b.clone()]);
        let needed = graph.needed(&[top.id()]).unwrap();
        assert!(needed.contains(&a.id()));
        assert!(!needed.contains(&b.id()));
    }

    #[test]
    fn toposort_orders_dependencies_first() {
        let a = delay(noop()).call([lit(1)]);
        let top = a.clone() + 1i64;
        let graph = Graph::from_delayed(&[top.clone()]);

        let order = graph.toposort().unwrap();
        let pos = |id| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(a.id()) < pos(top.id()));
    }
}
