//! Thread-pool backend.

use std::collections::HashMap;
use std::sync::mpsc::channel;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{ComputeError, TaskExecutionError};
use crate::eval::eval_op;
use crate::graph::Graph;
use crate::hash::TaskId;
use crate::sched::{
    Backend, ComputeOptions, ExecutionResult, Poison, RunPlan, resolve_args,
};
use crate::value::Value;

/// Executes ready tasks on N worker threads sharing process memory.
///
/// The scheduler performs a parallel topological traversal: tasks with no
/// unresolved dependencies are spawned immediately, and every completion
/// unlocks its dependents. Independent tasks keep running after a failure;
/// only the dependents of a failed task are withheld.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool {
    /// Builds a pool with `threads` worker threads (0 lets rayon pick).
    pub fn new(threads: usize) -> Result<Self, ComputeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("tsumugi-worker-{i}"))
            .build()
            .map_err(|e| ComputeError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }
}

enum Outcome {
    Finished(anyhow::Result<Value>),
    /// The cancel token was set before the callable started.
    Skipped,
}

impl Backend for ThreadPool {
    fn execute(
        &self,
        graph: &Graph,
        targets: &[TaskId],
        options: &ComputeOptions,
    ) -> Result<ExecutionResult, ComputeError> {
        let plan = RunPlan::build(graph, targets)?;
        let total = plan.total();

        if total == 0 {
            return Ok(ExecutionResult::default());
        }

        let progress = ProgressBar::new(total as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );
        progress.set_message("Running tasks...");

        let mut dependency_counts = plan.dependency_counts.clone();
        let mut values: HashMap<TaskId, Value> = HashMap::new();
        let mut failures: HashMap<TaskId, TaskExecutionError> = HashMap::new();
        let mut poison = Poison::new();
        let mut cancelled = false;
        let mut first_failure: Option<TaskExecutionError> = None;

        let started = Instant::now();

        // The scheduler loop stays on the calling thread; only tasks go to
        // the pool.
        self.pool.in_place_scope(|s| {
            let (result_sender, result_receiver) = channel::<(TaskId, Outcome)>();

            // Resolves arguments up front so the spawned closure owns
            // everything it needs; the values map stays with this thread.
            let spawn_task = |values: &HashMap<TaskId, Value>, id: TaskId| {
                let node = graph.get(id).expect("planned task exists in the graph");
                let args = resolve_args(node, values);
                let op = node.op.clone();
                let sender = result_sender.clone();
                let cancel = options.cancel.clone();

                s.spawn(move |_| {
                    if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                        let _ = sender.send((id, Outcome::Skipped));
                        return;
                    }

                    tracing::debug!(task = %id, op = %op.label(), "task running");
                    let outcome = eval_op(&op, &args);
                    let _ = sender.send((id, Outcome::Finished(outcome)));
                });
            };

            for id in plan.seeds() {
                spawn_task(&values, id);
            }

            let mut completed = 0usize;
            while completed < total {
                let (id, outcome) = result_receiver
                    .recv()
                    .expect("scheduler result channel closed");
                completed += 1;

                match outcome {
                    Outcome::Finished(Ok(value)) => {
                        values.insert(id, value);
                        progress.inc(1);

                        if let Some(dependents) = plan.dependents.get(&id) {
                            for &dependent in dependents {
                                let count = dependency_counts
                                    .get_mut(&dependent)
                                    .expect("dependent is part of the plan");
                                *count -= 1;
                                if *count > 0 || poison.contains(dependent) {
                                    continue;
                                }
                                if options.is_cancelled() {
                                    cancelled = true;
                                    if poison.mark(dependent) {
                                        completed += 1 + poison.spread(&plan, dependent).len();
                                    }
                                    continue;
                                }
                                spawn_task(&values, dependent);
                            }
                        }
                    }
                    Outcome::Finished(Err(error)) => {
                        let node = graph.get(id).expect("planned task exists in the graph");
                        let failure = TaskExecutionError::new(id, node.op.label(), error);
                        tracing::warn!(task = %id, "task failed: {failure}");
                        completed += poison.spread(&plan, id).len();
                        if first_failure.is_none() {
                            first_failure = Some(failure.clone());
                        }
                        failures.insert(id, failure);
                    }
                    Outcome::Skipped => {
                        cancelled = true;
                        tracing::debug!(task = %id, "task skipped, computation cancelled");
                        completed += poison.spread(&plan, id).len();
                    }
                }
            }
        });

        progress.finish_and_clear();
        tracing::debug!(
            tasks = total,
            elapsed = ?started.elapsed(),
            "thread pool run finished"
        );

        if options.best_effort {
            return Ok(ExecutionResult::new(values, failures));
        }
        if let Some(failure) = first_failure {
            return Err(failure.into());
        }
        if cancelled {
            return Err(ComputeError::Cancelled);
        }
        Ok(ExecutionResult::new(values, failures))
    }
}
