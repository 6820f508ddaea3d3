//! Per-session protocol engine: state machine, request table, control
//! loop, and the capability handles passed to running handlers.

pub mod context;
pub mod engine;
pub mod phase;
pub mod table;

pub use context::RequestContext;
pub use engine::SessionEngine;
pub use phase::{PhaseCell, SessionPhase};
pub use table::{CancelToken, InboundStream, RequestTable, StreamVerdict};

use crate::protocol::{Encoding, RequestId, RpcMessage};
use tokio::sync::oneshot;

/// A frame queued for the Control Stream writer task.
///
/// The writer is the only task that touches the control write half, so
/// frames are never interleaved on the wire.
#[derive(Debug)]
pub enum Outbound {
    /// A notification or handshake-phase error frame.
    Message(RpcMessage),
    /// A response; the request completes (table-side) once the frame is
    /// actually written.
    Response { message: RpcMessage, id: RequestId },
    /// The `initialize` response: written under the current (JSON)
    /// encoding, after which the writer switches to `encoding`.
    ResponseThenSwitch {
        message: RpcMessage,
        encoding: Encoding,
    },
    /// Acknowledged once every earlier frame has been written. Used to
    /// flush final error frames before tearing the transport down.
    Barrier(oneshot::Sender<()>),
}
