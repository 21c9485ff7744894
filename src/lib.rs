#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod agg;
mod error;
mod eval;
mod expr;
mod func;
mod graph;
mod hash;
pub mod protocol;
pub mod sched;
pub mod source;
mod value;
pub mod worker;

pub use crate::error::{ComputeError, GraphError, TaskExecutionError, WireError};
pub use crate::expr::{Deferred, Delayed, Op, TaskArg, compute_many, delay, lit};
pub use crate::func::{Func, Kwargs, Registry};
pub use crate::graph::{Arg, Graph, TaskNode};
pub use crate::hash::{Hash32, TaskId};
pub use crate::sched::{Backend, CancelToken, ComputeOptions, ExecutionResult};
pub use crate::value::{BinOp, Value};

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`.
/// Binaries that want the library's logs call this once at startup.
#[cfg(feature = "logging")]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
