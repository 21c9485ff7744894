//! Frame codec for worker boundaries.
//!
//! The process pool ships each task to a worker as a length-prefixed CBOR
//! frame carrying the operation, its literal arguments and its already
//! resolved dependency values; the worker answers with a reply frame. The
//! same payload shape is what [`RemoteWorker`](crate::sched::RemoteWorker)
//! implementations receive, so a remote transport only has to move these
//! structs. Callables cross the boundary by *name* only.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::WireError;
use crate::expr::Op;
use crate::func::Kwargs;
use crate::hash::TaskId;
use crate::value::{BinOp, Value};

/// The serializable form of [`Op`]: `Call` is reduced to the function name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireOp {
    Call { func: String, kwargs: Kwargs },
    GetAttr { name: String },
    GetItem,
    BinOp { op: BinOp },
}

impl WireOp {
    pub(crate) fn from_op(op: &Op) -> Self {
        match op {
            Op::Call { func, kwargs } => WireOp::Call {
                func: func.name().to_owned(),
                kwargs: kwargs.clone(),
            },
            Op::GetAttr { name } => WireOp::GetAttr { name: name.clone() },
            Op::GetItem => WireOp::GetItem,
            Op::BinOp { op } => WireOp::BinOp { op: *op },
        }
    }

    pub(crate) fn label(&self) -> String {
        match self {
            WireOp::Call { func, .. } => func.clone(),
            WireOp::GetAttr { name } => format!("getattr '{name}'"),
            WireOp::GetItem => "getitem".to_owned(),
            WireOp::BinOp { op } => format!("operator '{}'", op.symbol()),
        }
    }
}

/// One task shipped to a worker, dependencies already substituted by values.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: TaskId,
    pub op: WireOp,
    pub args: Vec<Value>,
}

/// The worker's answer; errors are stringified since they cross a process
/// boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReply {
    pub id: TaskId,
    pub outcome: Result<Value, String>,
}

/// Writes one length-prefixed CBOR frame.
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;

    writer.write_all(&(buf.len() as u32).to_be_bytes())?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly
/// before a new frame started; EOF in the middle of a frame is an error.
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<Option<T>, WireError> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..])? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed inside a frame header",
                )));
            }
            n => filled += n,
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    ciborium::from_reader(buf.as_slice())
        .map(Some)
        .map_err(|e| WireError::Decode(e.to_string()))
}
