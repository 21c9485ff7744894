//! Synchronous single-thread backend.

use std::collections::HashMap;

use crate::error::{ComputeError, TaskExecutionError};
use crate::eval::eval_op;
use crate::graph::Graph;
use crate::hash::TaskId;
use crate::sched::{Backend, ComputeOptions, ExecutionResult, RunPlan, resolve_args};
use crate::value::Value;

/// Runs the whole sub-graph in the calling thread, in deterministic
/// topological order. Aborts at the first failure it reaches, which makes it
/// the backend of choice for debugging a graph.
#[derive(Clone, Copy, Debug, Default)]
pub struct Serial;

impl Backend for Serial {
    fn execute(
        &self,
        graph: &Graph,
        targets: &[TaskId],
        options: &ComputeOptions,
    ) -> Result<ExecutionResult, ComputeError> {
        let plan = RunPlan::build(graph, targets)?;
        let order = graph.toposort()?;

        let mut values: HashMap<TaskId, Value> = HashMap::new();
        let mut failures = HashMap::new();

        for id in order {
            if !plan.needed.contains(&id) {
                continue;
            }

            if options.is_cancelled() {
                tracing::debug!(task = %id, "cancelled before task started");
                if options.best_effort {
                    break;
                }
                return Err(ComputeError::Cancelled);
            }

            let node = graph
                .get(id)
                .ok_or(crate::error::GraphError::UnknownTarget(id))?;
            let args = resolve_args(node, &values);

            tracing::debug!(task = %id, op = %node.op.label(), "running task");
            match eval_op(&node.op, &args) {
                Ok(value) => {
                    values.insert(id, value);
                }
                Err(error) => {
                    let failure = TaskExecutionError::new(id, node.op.label(), error);
                    tracing::warn!(task = %id, "task failed: {failure}");
                    if options.best_effort {
                        // Serial still aborts at the first failure; best
                        // effort only keeps what already finished.
                        failures.insert(id, failure);
                        break;
                    }
                    return Err(failure.into());
                }
            }
        }

        Ok(ExecutionResult::new(values, failures))
    }
}
