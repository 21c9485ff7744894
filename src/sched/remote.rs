//! Distributed backend over an abstract worker transport.
//!
//! [`RemotePool`] schedules tasks onto a fixed set of [`RemoteWorker`]s. The
//! transport is the implementor's business; the pool only sees a blocking
//! `submit` per task. On top of the shared dataflow loop it adds the two
//! behaviors a distributed run needs:
//!
//! * a worker reporting [`WorkerFailure::Lost`] is dropped from the rotation
//!   and its task is rescheduled elsewhere, a bounded number of times;
//! * intermediate values are released as soon as no pending task needs them,
//!   so long chains do not accumulate every chunk ever loaded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::channel;

use crate::error::{ComputeError, TaskExecutionError};
use crate::graph::Graph;
use crate::hash::TaskId;
use crate::protocol::{TaskRequest, WireOp};
use crate::sched::{Backend, ComputeOptions, ExecutionResult, Poison, RunPlan, resolve_args};
use crate::value::Value;

/// How a remote submission went wrong.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The worker is gone (connection dropped, machine died). The task is
    /// rescheduled on another worker.
    Lost,
    /// The worker ran out of memory. It is asked to restart and the task is
    /// retried.
    OutOfMemory,
    /// The task itself failed; the worker is fine.
    Task(String),
}

/// One worker in a [`RemotePool`]. `submit` blocks until the task finished
/// or the worker gave up; the pool calls it from its own threads, one task
/// per worker at a time.
pub trait RemoteWorker: Send + Sync {
    fn submit(&self, request: TaskRequest) -> Result<Value, WorkerFailure>;

    /// Asked after [`WorkerFailure::OutOfMemory`]; transports that can bounce
    /// their worker do it here.
    fn restart(&self) {}
}

/// Schedules tasks across remote workers with lost-worker rescheduling and
/// eager release of intermediate values.
pub struct RemotePool {
    workers: Vec<Arc<dyn RemoteWorker>>,
}

impl RemotePool {
    pub fn new(workers: Vec<Arc<dyn RemoteWorker>>) -> Self {
        Self { workers }
    }
}

impl Backend for RemotePool {
    fn execute(
        &self,
        graph: &Graph,
        targets: &[TaskId],
        options: &ComputeOptions,
    ) -> Result<ExecutionResult, ComputeError> {
        if self.workers.is_empty() {
            return Err(ComputeError::Backend("remote pool has no workers".into()));
        }

        let plan = RunPlan::build(graph, targets)?;
        let total = plan.total();
        if total == 0 {
            return Ok(ExecutionResult::default());
        }

        let target_set: HashSet<TaskId> = targets.iter().copied().collect();
        let mut ready: VecDeque<TaskId> = plan.seeds().into();
        let mut idle: Vec<usize> = (0..self.workers.len()).collect();
        let mut dead: HashSet<usize> = HashSet::new();
        let mut in_flight: HashMap<usize, TaskId> = HashMap::new();
        let mut attempts: HashMap<TaskId, u32> = HashMap::new();
        let mut dependency_counts = plan.dependency_counts.clone();
        // How many unfinished dependents still need each task's value.
        let mut pending_uses: HashMap<TaskId, usize> = plan
            .needed
            .iter()
            .map(|&id| (id, plan.dependents.get(&id).map_or(0, Vec::len)))
            .collect();
        let mut values: HashMap<TaskId, Value> = HashMap::new();
        let mut failures: HashMap<TaskId, TaskExecutionError> = HashMap::new();
        let mut poison = Poison::new();
        let mut first_failure: Option<TaskExecutionError> = None;
        let mut cancelled = false;
        let mut fatal: Option<ComputeError> = None;
        let mut completed = 0usize;

        std::thread::scope(|scope| {
            let (tx, rx) = channel::<(usize, TaskId, Result<Value, WorkerFailure>)>();

            while completed < total && fatal.is_none() {
                while let Some(&id) = ready.front() {
                    if options.is_cancelled() {
                        cancelled = true;
                        for id in ready.drain(..) {
                            if poison.mark(id) {
                                completed += 1;
                                release_inputs(graph, &target_set, &mut pending_uses, &mut values, id);
                                for p in poison.spread(&plan, id) {
                                    completed += 1;
                                    release_inputs(graph, &target_set, &mut pending_uses, &mut values, p);
                                }
                            }
                        }
                        break;
                    }
                    let Some(worker) = idle.pop() else { break };
                    ready.pop_front();

                    let node = graph.get(id).expect("planned task exists in the graph");
                    let request = TaskRequest {
                        id,
                        op: WireOp::from_op(&node.op),
                        args: resolve_args(node, &values),
                    };
                    let remote = Arc::clone(&self.workers[worker]);
                    let tx = tx.clone();
                    in_flight.insert(worker, id);
                    tracing::debug!(task = %id, worker, "submitting task to remote worker");
                    scope.spawn(move || {
                        let outcome = remote.submit(request);
                        let _ = tx.send((worker, id, outcome));
                    });
                }

                if completed >= total {
                    break;
                }
                if in_flight.is_empty() {
                    if !ready.is_empty() {
                        fatal = Some(ComputeError::Backend(
                            "no live remote workers left".into(),
                        ));
                    }
                    break;
                }

                let (worker, id, outcome) = rx
                    .recv()
                    .expect("remote event channel closed with submissions alive");
                in_flight.remove(&worker);

                match outcome {
                    Ok(value) => {
                        idle.push(worker);
                        completed += 1;
                        values.insert(id, value);
                        release_inputs(graph, &target_set, &mut pending_uses, &mut values, id);

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
                                        completed += 1;
                                        release_inputs(
                                            graph, &target_set, &mut pending_uses, &mut values,
                                            dependent,
                                        );
                                        for p in poison.spread(&plan, dependent) {
                                            completed += 1;
                                            release_inputs(
                                                graph, &target_set, &mut pending_uses, &mut values,
                                                p,
                                            );
                                        }
                                    }
                                    continue;
                                }
                                ready.push_back(dependent);
                            }
                        }
                    }
                    Err(WorkerFailure::Task(message)) => {
                        idle.push(worker);
                        completed += 1;
                        let label = graph
                            .get(id)
                            .map(|node| node.op.label())
                            .unwrap_or_else(|| "unknown".into());
                        let failure = TaskExecutionError::new(id, label, anyhow::anyhow!(message));
                        tracing::warn!(task = %id, "task failed on remote worker: {failure}");
                        release_inputs(graph, &target_set, &mut pending_uses, &mut values, id);
                        for p in poison.spread(&plan, id) {
                            completed += 1;
                            release_inputs(graph, &target_set, &mut pending_uses, &mut values, p);
                        }
                        if first_failure.is_none() {
                            first_failure = Some(failure.clone());
                        }
                        failures.insert(id, failure);
                    }
                    Err(WorkerFailure::Lost) => {
                        dead.insert(worker);
                        let tries = attempts.entry(id).or_insert(0);
                        *tries += 1;
                        if *tries > options.retries {
                            fatal = Some(ComputeError::WorkerLost {
                                id,
                                attempts: *tries,
                            });
                        } else if dead.len() == self.workers.len() {
                            fatal = Some(ComputeError::WorkerLost {
                                id,
                                attempts: *tries,
                            });
                        } else {
                            tracing::warn!(
                                task = %id,
                                worker,
                                attempt = *tries,
                                "remote worker lost, rescheduling task"
                            );
                            ready.push_front(id);
                        }
                    }
                    Err(WorkerFailure::OutOfMemory) => {
                        let tries = attempts.entry(id).or_insert(0);
                        *tries += 1;
                        if *tries > options.retries {
                            fatal = Some(ComputeError::ResourceExhaustion {
                                id,
                                attempts: *tries,
                            });
                        } else {
                            tracing::warn!(
                                task = %id,
                                worker,
                                attempt = *tries,
                                "remote worker out of memory, restarting it"
                            );
                            self.workers[worker].restart();
                            idle.push(worker);
                            ready.push_front(id);
                        }
                    }
                }
            }
        });

        if let Some(fatal) = fatal {
            return Err(fatal);
        }
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

/// `finished` will never be dispatched again, so each of its inputs has one
/// fewer pending use; inputs nobody else needs are dropped unless they were
/// requested as outputs.
fn release_inputs(
    graph: &Graph,
    targets: &HashSet<TaskId>,
    pending_uses: &mut HashMap<TaskId, usize>,
    values: &mut HashMap<TaskId, Value>,
    finished: TaskId,
) {
    let Some(node) = graph.get(finished) else {
        return;
    };
    for dep in node.dependencies() {
        let Some(uses) = pending_uses.get_mut(&dep) else {
            continue;
        };
        *uses = uses.saturating_sub(1);
        if *uses == 0 && !targets.contains(&dep) && values.remove(&dep).is_some() {
            tracing::debug!(task = %dep, "released intermediate value");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::expr::{compute_many, delay};
    use crate::func::{Func, Registry};
    use crate::sched::Serial;
    use crate::worker::execute_request;

    /// Executes submissions in-process against a registry.
    struct LocalWorker {
        registry: Registry,
    }

    impl LocalWorker {
        fn with(funcs: &[Func]) -> Self {
            let mut registry = Registry::new();
            for func in funcs {
                registry.register(func.clone());
            }
            Self { registry }
        }
    }

    impl RemoteWorker for LocalWorker {
        fn submit(&self, request: TaskRequest) -> Result<Value, WorkerFailure> {
            execute_request(&self.registry, &request)
                .map_err(|e| WorkerFailure::Task(format!("{e:#}")))
        }
    }

    /// Reports itself lost for the first `losses` submissions.
    struct FlakyWorker {
        inner: LocalWorker,
        losses: AtomicUsize,
        seen: AtomicUsize,
    }

    impl RemoteWorker for FlakyWorker {
        fn submit(&self, request: TaskRequest) -> Result<Value, WorkerFailure> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.losses.load(Ordering::SeqCst) > 0 {
                self.losses.fetch_sub(1, Ordering::SeqCst);
                return Err(WorkerFailure::Lost);
            }
            self.inner.submit(request)
        }
    }

    struct AlwaysLost;

    impl RemoteWorker for AlwaysLost {
        fn submit(&self, _request: TaskRequest) -> Result<Value, WorkerFailure> {
            Err(WorkerFailure::Lost)
        }
    }

    /// Runs out of memory once, then behaves after a restart.
    struct OomWorker {
        inner: LocalWorker,
        starved: AtomicBool,
        restarted: AtomicBool,
    }

    impl RemoteWorker for OomWorker {
        fn submit(&self, request: TaskRequest) -> Result<Value, WorkerFailure> {
            if self.starved.swap(false, Ordering::SeqCst) {
                return Err(WorkerFailure::OutOfMemory);
            }
            self.inner.submit(request)
        }

        fn restart(&self) {
            self.restarted.store(true, Ordering::SeqCst);
        }
    }

    fn seven() -> Func {
        Func::new("seven", |_, _| Ok(Value::Int(7)))
    }

    #[test]
    fn matches_serial_results() {
        let base = delay(seven()).call([]);
        let top = (base.clone() + 3i64) * (base - 5i64);

        let pool = RemotePool::new(vec![
            Arc::new(LocalWorker::with(&[seven()])),
            Arc::new(LocalWorker::with(&[seven()])),
        ]);
        assert_eq!(top.compute(&Serial).unwrap(), Value::Int(20));
        assert_eq!(top.compute(&pool).unwrap(), Value::Int(20));
    }

    #[test]
    fn lost_worker_task_is_rescheduled_elsewhere() {
        let flaky = Arc::new(FlakyWorker {
            inner: LocalWorker::with(&[seven()]),
            losses: AtomicUsize::new(2),
            seen: AtomicUsize::new(0),
        });
        // The flaky worker sits last, so the dispatcher tries it first.
        let pool = RemotePool::new(vec![
            Arc::new(LocalWorker::with(&[seven()])),
            flaky.clone(),
        ]);

        let task = delay(seven()).call([]) + 1i64;
        assert_eq!(task.compute(&pool).unwrap(), Value::Int(8));
        assert!(flaky.seen.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn rescheduling_is_bounded() {
        let pool = RemotePool::new(vec![
            Arc::new(AlwaysLost),
            Arc::new(AlwaysLost),
            Arc::new(AlwaysLost),
            Arc::new(AlwaysLost),
            Arc::new(AlwaysLost),
        ]);

        let task = delay(seven()).call([]);
        let options = ComputeOptions::default().with_retries(2);
        let err = task.compute_with(&pool, &options).unwrap_err();
        assert!(matches!(err, ComputeError::WorkerLost { attempts: 3, .. }));
    }

    #[test]
    fn oom_worker_is_restarted_and_the_task_retried() {
        let worker = Arc::new(OomWorker {
            inner: LocalWorker::with(&[seven()]),
            starved: AtomicBool::new(true),
            restarted: AtomicBool::new(false),
        });
        let pool = RemotePool::new(vec![worker.clone()]);

        let task = delay(seven()).call([]);
        assert_eq!(task.compute(&pool).unwrap(), Value::Int(7));
        assert!(worker.restarted.load(Ordering::SeqCst));
    }

    #[test]
    fn repeated_oom_exhausts_resources() {
        struct AlwaysOom;
        impl RemoteWorker for AlwaysOom {
            fn submit(&self, _request: TaskRequest) -> Result<Value, WorkerFailure> {
                Err(WorkerFailure::OutOfMemory)
            }
        }

        let pool = RemotePool::new(vec![Arc::new(AlwaysOom) as Arc<dyn RemoteWorker>]);
        let task = delay(seven()).call([]);
        let options = ComputeOptions::default().with_retries(1);
        let err = task.compute_with(&pool, &options).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::ResourceExhaustion { attempts: 2, .. }
        ));
    }

    #[test]
    fn intermediate_values_are_released() {
        let base = delay(seven()).call([]);
        let mid = base.clone() + 1i64;
        let top = mid.clone() * 2i64;

        let pool = RemotePool::new(vec![
            Arc::new(LocalWorker::with(&[seven()])) as Arc<dyn RemoteWorker>
        ]);
        let options = ComputeOptions::default();
        let result = compute_many(std::slice::from_ref(&top), &pool, &options).unwrap();

        assert_eq!(result.value(top.id()), Some(&Value::Int(16)));
        assert!(result.value(mid.id()).is_none());
        assert!(result.value(base.id()).is_none());
    }

    #[test]
    fn requested_outputs_are_never_released() {
        let base = delay(seven()).call([]);
        let top = base.clone() * base.clone();

        let pool = RemotePool::new(vec![
            Arc::new(LocalWorker::with(&[seven()])) as Arc<dyn RemoteWorker>
        ]);
        let options = ComputeOptions::default();
        let result = compute_many(&[base.clone(), top.clone()], &pool, &options).unwrap();

        assert_eq!(result.value(base.id()), Some(&Value::Int(7)));
        assert_eq!(result.value(top.id()), Some(&Value::Int(49)));
    }
}
