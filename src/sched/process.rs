//! Process-pool backend.
//!
//! Workers are child processes spawned from a caller-supplied command; the
//! host binary is expected to detect worker mode (see [`is_worker_process`])
//! and hand its stdin/stdout to [`run_worker_stdio`](crate::worker::run_worker_stdio).
//! Each task crosses the pipe as one [`TaskRequest`] frame with its
//! dependency values already resolved, so this backend favors CPU-bound
//! callables with small inputs and outputs. Only functions registered by
//! name on the worker side can run here.

use std::collections::{HashMap, VecDeque};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use crate::error::{ComputeError, TaskExecutionError};
use crate::graph::Graph;
use crate::hash::TaskId;
use crate::protocol::{TaskReply, TaskRequest, WireOp, read_frame, write_frame};
use crate::sched::{
    Backend, ComputeOptions, ExecutionResult, Poison, RunPlan, resolve_args,
};
use crate::value::Value;

const WORKER_ENV: &str = "TSUMUGI_WORKER";

/// True when the current process was spawned as a pool worker. Host binaries
/// check this early in `main` and branch into the worker loop.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// The command a [`ProcessPool`] uses to spawn its workers.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: vec![(WORKER_ENV.to_owned(), "1".to_owned())],
        }
    }

    /// Respawn the host's own executable as the worker.
    pub fn current_exe() -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe.to_string_lossy().into_owned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
    }
}

/// Events flowing from the per-worker reader threads to the scheduler.
enum Event {
    Reply(usize, u64, TaskReply),
    Dead(usize, u64),
}

struct WorkerSlot {
    child: Child,
    /// `None` once the pipe is closed or the worker became unusable.
    stdin: Option<ChildStdin>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
}

struct PoolState {
    command: WorkerCommand,
    workers: Vec<WorkerSlot>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    shut_down: bool,
}

/// A pool of worker processes with an explicit lifecycle: [`start`] spawns
/// the children, [`shutdown`] reaps them, and dropping the pool kills any
/// that remain. A worker that dies mid-task is respawned and its task
/// rescheduled up to `ComputeOptions::retries` times.
///
/// [`start`]: ProcessPool::start
/// [`shutdown`]: ProcessPool::shutdown
pub struct ProcessPool {
    state: Mutex<PoolState>,
}

impl ProcessPool {
    pub fn start(command: WorkerCommand, size: usize) -> Result<Self, ComputeError> {
        if size == 0 {
            return Err(ComputeError::Backend(
                "process pool needs at least one worker".into(),
            ));
        }

        let (events_tx, events_rx) = channel();
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            workers.push(spawn_worker(&command, index, 0, &events_tx)?);
        }

        tracing::debug!(size, program = %command.program, "process pool started");
        Ok(Self {
            state: Mutex::new(PoolState {
                command,
                workers,
                events_tx,
                events_rx,
                shut_down: false,
            }),
        })
    }

    /// Closes every worker's stdin, waits for the children to exit and joins
    /// the reader threads.
    pub fn shutdown(self) -> Result<(), ComputeError> {
        let mut state = self.lock();
        state.shut_down = true;

        for worker in &mut state.workers {
            drop(worker.stdin.take());
        }
        for worker in &mut state.workers {
            worker
                .child
                .wait()
                .map_err(|e| ComputeError::Backend(format!("failed to reap worker: {e}")))?;
            if let Some(reader) = worker.reader.take() {
                let _ = reader.join();
            }
        }

        tracing::debug!("process pool shut down");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        for worker in &mut state.workers {
            drop(worker.stdin.take());
            let _ = worker.child.kill();
            let _ = worker.child.wait();
        }
    }
}

fn spawn_worker(
    command: &WorkerCommand,
    index: usize,
    generation: u64,
    events_tx: &Sender<Event>,
) -> Result<WorkerSlot, ComputeError> {
    let mut child = command
        .spawn()
        .map_err(|e| ComputeError::Backend(format!("failed to spawn worker: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ComputeError::Backend("worker stdin was not piped".into()))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ComputeError::Backend("worker stdout was not piped".into()))?;

    let tx = events_tx.clone();
    let reader = std::thread::spawn(move || {
        loop {
            match read_frame::<TaskReply>(&mut stdout) {
                Ok(Some(reply)) => {
                    if tx.send(Event::Reply(index, generation, reply)).is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = tx.send(Event::Dead(index, generation));
                    break;
                }
            }
        }
    });

    Ok(WorkerSlot {
        child,
        stdin: Some(stdin),
        generation,
        reader: Some(reader),
    })
}

impl Backend for ProcessPool {
    fn execute(
        &self,
        graph: &Graph,
        targets: &[TaskId],
        options: &ComputeOptions,
    ) -> Result<ExecutionResult, ComputeError> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(ComputeError::Backend("process pool is shut down".into()));
        }

        let plan = RunPlan::build(graph, targets)?;
        let total = plan.total();
        if total == 0 {
            return Ok(ExecutionResult::default());
        }

        let mut ready: VecDeque<TaskId> = plan.seeds().into();
        let mut idle: Vec<usize> = (0..state.workers.len()).collect();
        let mut in_flight: HashMap<usize, TaskId> = HashMap::new();
        let mut attempts: HashMap<TaskId, u32> = HashMap::new();
        let mut dependency_counts = plan.dependency_counts.clone();
        let mut values: HashMap<TaskId, Value> = HashMap::new();
        let mut failures: HashMap<TaskId, TaskExecutionError> = HashMap::new();
        let mut poison = Poison::new();
        let mut first_failure: Option<TaskExecutionError> = None;
        let mut cancelled = false;
        let mut fatal: Option<ComputeError> = None;
        let mut completed = 0usize;

        while completed < total && fatal.is_none() {
            // Hand ready tasks to idle workers.
            while let Some(&id) = ready.front() {
                if options.is_cancelled() {
                    cancelled = true;
                    for id in ready.drain(..) {
                        if poison.mark(id) {
                            completed += 1 + poison.spread(&plan, id).len();
                        }
                    }
                    break;
                }
                let Some(worker) = idle.pop() else { break };
                ready.pop_front();

                match dispatch(&mut state, graph, &values, worker, id) {
                    Ok(()) => {
                        in_flight.insert(worker, id);
                    }
                    Err(_) => {
                        // The pipe broke before the task started; treat it as
                        // a lost worker and retry elsewhere.
                        ready.push_front(id);
                        handle_loss(
                            &mut state,
                            worker,
                            Some(id),
                            &mut attempts,
                            &mut idle,
                            &in_flight,
                            options,
                            &mut fatal,
                        );
                        if fatal.is_some() {
                            break;
                        }
                    }
                }
            }

            if completed >= total || fatal.is_some() {
                break;
            }
            if in_flight.is_empty() && ready.is_empty() {
                break;
            }

            let event = state
                .events_rx
                .recv()
                .expect("pool event channel closed with readers alive");

            match event {
                Event::Reply(worker, generation, reply) => {
                    if state.workers[worker].generation != generation {
                        continue; // reply from a replaced worker
                    }
                    let Some(id) = in_flight.remove(&worker) else {
                        continue;
                    };
                    idle.push(worker);
                    completed += 1;

                    match reply.outcome {
                        Ok(value) => {
                            values.insert(id, value);
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
                                    ready.push_back(dependent);
                                }
                            }
                        }
                        Err(message) => {
                            let label = graph
                                .get(id)
                                .map(|node| node.op.label())
                                .unwrap_or_else(|| "unknown".into());
                            let failure =
                                TaskExecutionError::new(id, label, anyhow::anyhow!(message));
                            tracing::warn!(task = %id, "task failed on worker: {failure}");
                            completed += poison.spread(&plan, id).len();
                            if first_failure.is_none() {
                                first_failure = Some(failure.clone());
                            }
                            failures.insert(id, failure);
                        }
                    }
                }
                Event::Dead(worker, generation) => {
                    if state.workers[worker].generation != generation {
                        continue;
                    }
                    let lost = in_flight.remove(&worker);
                    if let Some(id) = lost {
                        ready.push_front(id);
                    }
                    handle_loss(
                        &mut state,
                        worker,
                        lost,
                        &mut attempts,
                        &mut idle,
                        &in_flight,
                        options,
                        &mut fatal,
                    );
                }
            }
        }

        if fatal.is_some() {
            // Workers still chewing on tasks from this failed run are
            // replaced wholesale so their late replies cannot leak into the
            // next compute call.
            for (worker, _) in in_flight.drain() {
                replace_worker(&mut state, worker);
            }
        }

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

fn dispatch(
    state: &mut PoolState,
    graph: &Graph,
    values: &HashMap<TaskId, Value>,
    worker: usize,
    id: TaskId,
) -> Result<(), ComputeError> {
    let node = graph.get(id).expect("planned task exists in the graph");
    let request = TaskRequest {
        id,
        op: WireOp::from_op(&node.op),
        args: resolve_args(node, values),
    };

    let stdin = state.workers[worker]
        .stdin
        .as_mut()
        .ok_or_else(|| ComputeError::Backend("worker pipe is closed".into()))?;

    tracing::debug!(task = %id, worker, "shipping task to worker");
    write_frame(stdin, &request)
        .map_err(|e| ComputeError::Backend(format!("failed to ship task: {e}")))
}

/// Respawns a dead worker and accounts the retry for the task it was
/// running, if any. The caller already requeued the task.
fn handle_loss(
    state: &mut PoolState,
    worker: usize,
    lost_task: Option<TaskId>,
    attempts: &mut HashMap<TaskId, u32>,
    idle: &mut Vec<usize>,
    in_flight: &HashMap<usize, TaskId>,
    options: &ComputeOptions,
    fatal: &mut Option<ComputeError>,
) {
    if let Some(id) = lost_task {
        let tries = attempts.entry(id).or_insert(0);
        *tries += 1;
        if *tries > options.retries {
            *fatal = Some(ComputeError::WorkerLost {
                id,
                attempts: *tries,
            });
            return;
        }
        tracing::warn!(task = %id, worker, attempt = *tries, "worker died, rescheduling task");
    } else {
        tracing::warn!(worker, "idle worker died, respawning");
    }

    if replace_worker(state, worker) {
        if !idle.contains(&worker) {
            idle.push(worker);
        }
    } else {
        idle.retain(|&w| w != worker);
        // Busy workers can still finish and go idle; the pool is only
        // dead once nothing is usable and nothing is running.
        if pool_exhausted(idle, in_flight) {
            *fatal = Some(ComputeError::Backend(
                "all pool workers are gone".into(),
            ));
        }
    }
}

fn pool_exhausted(idle: &[usize], in_flight: &HashMap<usize, TaskId>) -> bool {
    idle.is_empty() && in_flight.is_empty()
}

/// Reaps the old child and spawns a replacement under a new generation.
/// Returns false when the replacement could not be spawned.
fn replace_worker(state: &mut PoolState, worker: usize) -> bool {
    let generation = state.workers[worker].generation + 1;
    {
        let slot = &mut state.workers[worker];
        drop(slot.stdin.take());
        let _ = slot.child.kill();
        let _ = slot.child.wait();
        if let Some(reader) = slot.reader.take() {
            let _ = reader.join();
        }
    }

    match spawn_worker(&state.command, worker, generation, &state.events_tx) {
        Ok(slot) => {
            state.workers[worker] = slot;
            true
        }
        Err(error) => {
            tracing::warn!(worker, "failed to respawn worker: {error}");
            state.workers[worker].generation = generation;
            false
        }
    }
}
