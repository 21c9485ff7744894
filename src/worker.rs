//! Worker-side execution loop for the process pool.
//!
//! A host binary spawned as a pool worker calls [`run_worker_stdio`] with its
//! function [`Registry`]; the loop decodes [`TaskRequest`] frames from stdin,
//! executes them through the shared evaluator, and writes [`TaskReply`]
//! frames to stdout until the pool closes the pipe.

use std::io::{Read, Write};

use anyhow::anyhow;

use crate::error::WireError;
use crate::eval::eval_op;
use crate::expr::Op;
use crate::func::Registry;
use crate::protocol::{TaskReply, TaskRequest, WireOp, read_frame, write_frame};
use crate::value::Value;

/// Serves task requests from `reader` until clean EOF.
///
/// Every request produces exactly one reply, success or failure; only codec
/// and I/O problems abort the loop.
pub fn worker_loop<R, W>(
    registry: &Registry,
    reader: &mut R,
    writer: &mut W,
) -> Result<(), WireError>
where
    R: Read,
    W: Write,
{
    while let Some(request) = read_frame::<TaskRequest>(reader)? {
        tracing::debug!(id = %request.id, op = %request.op.label(), "worker received task");

        let outcome = execute_request(registry, &request).map_err(|e| format!("{e:#}"));
        write_frame(
            writer,
            &TaskReply {
                id: request.id,
                outcome,
            },
        )?;
    }

    Ok(())
}

/// [`worker_loop`] over the process' own stdin/stdout, for host binaries
/// running as pool workers.
pub fn run_worker_stdio(registry: &Registry) -> Result<(), WireError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    worker_loop(registry, &mut stdin.lock(), &mut stdout.lock())
}

/// Resolves a request's function name against the registry and evaluates it.
/// [`RemoteWorker`](crate::sched::RemoteWorker) implementations that execute
/// in-process call this directly.
pub fn execute_request(registry: &Registry, request: &TaskRequest) -> anyhow::Result<Value> {
    let op = match &request.op {
        WireOp::Call { func, kwargs } => {
            let func = registry
                .get(func)
                .ok_or_else(|| anyhow!("function '{func}' is not registered on this worker"))?;
            Op::Call {
                func: func.clone(),
                kwargs: kwargs.clone(),
            }
        }
        WireOp::GetAttr { name } => Op::GetAttr { name: name.clone() },
        WireOp::GetItem => Op::GetItem,
        WireOp::BinOp { op } => Op::BinOp { op: *op },
    };

    eval_op(&op, &request.args)
}
