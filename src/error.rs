use std::sync::Arc;

use thiserror::Error;

use crate::hash::TaskId;

/// A structural defect in a task graph, detected before any task runs.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    #[error("task graph contains a cycle through task {0}")]
    Cycle(TaskId),

    #[error("task {task} references missing dependency {missing}")]
    MissingDependency { task: TaskId, missing: TaskId },

    #[error("requested output {0} is not present in the graph")]
    UnknownTarget(TaskId),
}

/// A userland callable failed while executing a task.
///
/// The wrapped error is the callable's own `anyhow` error; `id` and `name`
/// identify the failing task and its operation.
#[derive(Debug, Error, Clone)]
#[error("task {id} ({name}) failed: {error}")]
pub struct TaskExecutionError {
    pub id: TaskId,
    pub name: String,
    pub error: Arc<anyhow::Error>,
}

impl TaskExecutionError {
    pub(crate) fn new(id: TaskId, name: impl Into<String>, error: anyhow::Error) -> Self {
        Self {
            id,
            name: name.into(),
            error: Arc::new(error),
        }
    }
}

/// Everything a `compute()` call can fail with.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Task(#[from] TaskExecutionError),

    #[error("worker died while running task {id}, gave up after {attempts} attempts")]
    WorkerLost { id: TaskId, attempts: u32 },

    #[error("worker ran out of memory on task {id}, gave up after {attempts} attempts")]
    ResourceExhaustion { id: TaskId, attempts: u32 },

    #[error("computation was cancelled")]
    Cancelled,

    #[error("failed to start backend: {0}")]
    Backend(String),
}

/// A frame codec failure on a worker boundary.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("failed to decode frame: {0}")]
    Decode(String),
}
