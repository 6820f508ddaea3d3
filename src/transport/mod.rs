//! WebTransport session surface.
//!
//! The QUIC/WebTransport stack (session upgrade, TLS, congestion control)
//! is an external collaborator. The session engine drives it exclusively
//! through these traits, so any implementation that can accept streams and
//! move datagrams can carry MCP-Flow. [`mem`] provides an in-process pair
//! used by the test suite and by embedders that want loopback sessions.
//!
//! Transports move bytes; they are not responsible for framing, request
//! routing, or lifecycle - that is the engine's business.

pub mod mem;

use crate::error::TransportResult;
use async_trait::async_trait;
use bytes::Bytes;

pub use mem::MemSession;

/// Write half of a QUIC stream.
#[async_trait]
pub trait StreamWriter: Send {
    /// Write the whole buffer, waiting out flow control.
    async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()>;

    /// Close the stream cleanly. EOF on the peer's reader marks
    /// end-of-payload.
    async fn finish(&mut self) -> TransportResult<()>;

    /// Abort the stream with an error code. Delivery of buffered bytes is
    /// not guaranteed afterwards.
    fn reset(&mut self, code: u32);
}

/// Read half of a QUIC stream.
#[async_trait]
pub trait StreamReader: Send {
    /// Read some bytes. `Ok(None)` is clean EOF: the writer finished.
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<Option<usize>>;

    /// Tell the peer to stop sending on this stream.
    fn stop(&mut self, code: u32);
}

/// A single WebTransport session, as the server engine sees it.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Accept the next peer-opened bidirectional stream.
    async fn accept_bi(
        &self,
    ) -> TransportResult<(Box<dyn StreamWriter>, Box<dyn StreamReader>)>;

    /// Open a unidirectional stream towards the peer.
    async fn open_uni(&self) -> TransportResult<Box<dyn StreamWriter>>;

    /// Accept the next peer-opened unidirectional stream.
    async fn accept_uni(&self) -> TransportResult<Box<dyn StreamReader>>;

    /// Send one datagram. Unreliable: the transport may drop it.
    async fn send_datagram(&self, payload: Bytes) -> TransportResult<()>;

    /// Receive the next datagram.
    async fn recv_datagram(&self) -> TransportResult<Bytes>;

    /// Close the whole session.
    async fn close(&self, code: u32, reason: &str);

    /// Resolves once the session is closed, by either side.
    async fn closed(&self);

    fn is_closed(&self) -> bool;
}
