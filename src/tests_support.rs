//! Shared fixtures for unit tests.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::MAX_DATAGRAM_PAYLOAD_SIZE;
use crate::datagram::DatagramPlane;
use crate::protocol::RequestId;
use crate::session::{Outbound, RequestContext, RequestTable};
use crate::streams::StreamMux;
use crate::transport::{MemSession, SessionTransport};

/// Keeps the far side of the fixture session (and its queues) alive.
pub struct TestContextGuard {
    pub client: MemSession,
    pub table: Arc<RequestTable>,
    pub outbound_rx: mpsc::Receiver<Outbound>,
}

/// A `RequestContext` for request `id`, wired over a fresh mem session.
pub fn test_context(id: i64) -> (RequestContext, TestContextGuard) {
    let (client, server) = MemSession::pair();
    let transport: Arc<dyn SessionTransport> = Arc::new(server);
    let table = Arc::new(RequestTable::new());
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    let mux = Arc::new(StreamMux::new(
        Arc::clone(&transport),
        Arc::clone(&table),
        outbound_tx,
        8,
    ));
    let datagrams = Arc::new(DatagramPlane::new(
        Arc::clone(&transport),
        true,
        MAX_DATAGRAM_PAYLOAD_SIZE,
    ));

    let token = table
        .register(RequestId::Number(id), "tools/call")
        .expect("fresh table");
    let ctx = RequestContext::new(
        RequestId::Number(id),
        token,
        Arc::clone(&table),
        mux,
        datagrams,
    );
    (
        ctx,
        TestContextGuard {
            client,
            table,
            outbound_rx,
        },
    )
}
