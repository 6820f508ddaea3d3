//! Capability handle passed to request handlers.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::datagram::{Datagram, DatagramChannel, DatagramPlane, SendOutcome};
use crate::error::ProtocolResult;
use crate::protocol::{RequestId, StreamErrorParams};
use crate::session::table::{CancelToken, InboundStream, RequestTable};
use crate::streams::{ExecutionStreamWriter, StreamMux};
use tracing::debug;

/// Everything a handler may do on behalf of one in-flight request.
///
/// The stream opener and datagram sender are bound to the request id, so
/// there is no session-global "current request" state to get wrong.
pub struct RequestContext {
    id: RequestId,
    token: CancelToken,
    table: Arc<RequestTable>,
    mux: Arc<StreamMux>,
    datagrams: Arc<DatagramPlane>,
}

impl RequestContext {
    pub(crate) fn new(
        id: RequestId,
        token: CancelToken,
        table: Arc<RequestTable>,
        mux: Arc<StreamMux>,
        datagrams: Arc<DatagramPlane>,
    ) -> Self {
        Self {
            id,
            token,
            table,
            mux,
            datagrams,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the request is cancelled; never resolves otherwise.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Open an Execution Stream owned by this request.
    ///
    /// The returned writer has already sent its 8-byte header; the tag to
    /// declare in the response comes from
    /// [`tag`](ExecutionStreamWriter::tag).
    pub async fn open_stream(&self) -> ProtocolResult<ExecutionStreamWriter> {
        self.mux.open(&self.id).await
    }

    /// Send a datagram bound to this request.
    pub async fn send_datagram(&self, channel: DatagramChannel, payload: &[u8]) -> SendOutcome {
        let Some(wire_id) = self.id.as_wire_id() else {
            debug!(request_id = %self.id, "request id not datagram-addressable");
            return SendOutcome::Dropped;
        };
        self.datagrams.send(channel, wire_id, payload).await
    }

    /// Receive datagrams the peer addressed to this request.
    pub fn subscribe_datagrams(&self, channel: DatagramChannel) -> Option<mpsc::Receiver<Datagram>> {
        let wire_id = self.id.as_wire_id()?;
        Some(self.datagrams.subscribe(channel, wire_id))
    }

    /// Receive peer-opened Execution Streams bound to this request.
    pub fn inbound_streams(&self) -> Option<mpsc::Receiver<InboundStream>> {
        self.table.subscribe_inbound(&self.id)
    }

    /// Observe `$/streamError` notifications for this request's streams.
    pub fn stream_errors(&self) -> Option<mpsc::Receiver<StreamErrorParams>> {
        self.table.subscribe_stream_errors(&self.id)
    }

    /// The datagram plane's "please slow down" signal.
    pub fn throttle_signal(&self) -> watch::Receiver<bool> {
        self.datagrams.throttle_signal()
    }
}
