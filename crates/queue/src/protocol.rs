//! Wire protocol shared by peer links and worker links.
//!
//! Every frame is a JSON document behind a 4-byte big-endian length
//! prefix. A [`Frame::Call`] carries one [`Command`] and is answered by
//! exactly one [`Frame::Answer`] or [`Frame::Error`] with the same
//! `call_id`. Either side may issue calls.

use bytes::Bytes;
use peerwork_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::RpcError;

/// Largest frame accepted from the wire.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// The closed set of remote commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arguments")]
pub enum Command {
    /// Perform the work row `work_id` of `table`. Answered once the
    /// remote perform cycle finished.
    PerformWork { table: String, work_id: DbId },

    /// The sender's cumulative outstanding work. Peer links only.
    ReportLoad { load: u64 },

    /// Sent once by the dialling side so the listener can attribute the
    /// link to a registered node.
    IdentifyNode { host: String, port: u16 },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::PerformWork { .. } => "PerformWork",
            Command::ReportLoad { .. } => "ReportLoad",
            Command::IdentifyNode { .. } => "IdentifyNode",
        }
    }
}

/// One length-delimited message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Call { call_id: u64, command: Command },
    Answer { call_id: u64 },
    Error { call_id: u64, message: String },
}

/// Length-prefix codec configured for this protocol.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode_frame(frame: &Frame) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, RpcError> {
    Ok(serde_json::from_slice(bytes)?)
}
