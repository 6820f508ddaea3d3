//! Execution Stream multiplexer.
//!
//! Every Execution Stream is a unidirectional QUIC stream that starts with
//! an 8-byte header binding it to an in-flight request: `requestId` (u32
//! BE) then `streamTag` (u32 BE). The mux writes that header before any
//! payload byte on outbound streams, validates it on inbound ones, and
//! keeps the per-session concurrency budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProtocolError, ProtocolResult, TransportError, TransportResult};
use crate::protocol::{RequestId, RpcMessage, StreamErrorParams};
use crate::session::{InboundStream, Outbound, RequestTable, StreamVerdict};
use crate::transport::{SessionTransport, StreamReader, StreamWriter};

/// Length of the Execution Stream header.
pub const STREAM_HEADER_LEN: usize = 8;

/// Reset code used when aborting a rejected peer stream.
const REJECT_STREAM_CODE: u32 = 1;

/// The 8-byte Execution Stream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub request_id: u32,
    pub stream_tag: u32,
}

impl StreamHeader {
    pub fn encode(&self) -> [u8; STREAM_HEADER_LEN] {
        let mut buf = [0u8; STREAM_HEADER_LEN];
        buf[..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..].copy_from_slice(&self.stream_tag.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; STREAM_HEADER_LEN]) -> Self {
        Self {
            request_id: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            stream_tag: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Opens, accepts, and accounts for Execution Streams on one session.
pub struct StreamMux {
    transport: Arc<dyn SessionTransport>,
    table: Arc<RequestTable>,
    /// Control Stream outbound queue, used for `$/streamError`.
    outbound: mpsc::Sender<Outbound>,
    max_streams: u32,
    active: AtomicU32,
    refuse_new: AtomicBool,
}

impl StreamMux {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        table: Arc<RequestTable>,
        outbound: mpsc::Sender<Outbound>,
        max_streams: u32,
    ) -> Self {
        Self {
            transport,
            table,
            outbound,
            max_streams,
            active: AtomicU32::new(0),
            refuse_new: AtomicBool::new(false),
        }
    }

    /// Streams currently counted against the session budget.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop admitting new streams in either direction (DRAINING).
    pub fn refuse_new_streams(&self) {
        self.refuse_new.store(true, Ordering::SeqCst);
    }

    /// Open an Execution Stream bound to `id` and write its header.
    ///
    /// Fails synchronously with the stream-limit error when the budget is
    /// exhausted; the caller surfaces that as the request error.
    pub async fn open(self: &Arc<Self>, id: &RequestId) -> ProtocolResult<ExecutionStreamWriter> {
        if self.refuse_new.load(Ordering::SeqCst) {
            return Err(ProtocolError::InvalidRequest(
                "session is draining; no new streams".into(),
            ));
        }
        let wire_id = id.as_wire_id().ok_or(ProtocolError::InvalidRequest(
            "request id cannot be referenced from a stream header".into(),
        ))?;

        self.try_acquire()?;

        let tag = match self.table.allocate_stream_tag(id) {
            Ok(tag) => tag,
            Err(e) => {
                self.release();
                return Err(e);
            }
        };

        let mut inner = match self.transport.open_uni().await {
            Ok(writer) => writer,
            Err(e) => {
                self.release();
                return Err(ProtocolError::InternalError(e.to_string().into()));
            }
        };

        let header = StreamHeader {
            request_id: wire_id,
            stream_tag: tag,
        };
        if let Err(e) = inner.write_all(&header.encode()).await {
            self.release();
            return Err(ProtocolError::InternalError(e.to_string().into()));
        }

        self.table.bind_stream(id, tag);
        debug!(request_id = %id, tag, "execution stream opened");

        Ok(ExecutionStreamWriter {
            mux: Arc::clone(self),
            id: id.clone(),
            tag,
            inner,
            closed: false,
        })
    }

    /// Accept peer-opened unidirectional streams until the session closes.
    pub async fn run_accept_loop(self: Arc<Self>) {
        loop {
            let reader = match self.transport.accept_uni().await {
                Ok(reader) => reader,
                Err(_) => break,
            };

            if self.refuse_new.load(Ordering::SeqCst) {
                let mut reader = reader;
                reader.stop(REJECT_STREAM_CODE);
                continue;
            }

            let mux = Arc::clone(&self);
            tokio::spawn(async move {
                mux.handle_inbound(reader).await;
            });
        }
    }

    async fn handle_inbound(self: &Arc<Self>, mut reader: Box<dyn StreamReader>) {
        let header = match read_header(reader.as_mut()).await {
            Ok(Some(header)) => header,
            Ok(None) => {
                warn!("peer stream ended before the 8-byte header; dropping");
                return;
            }
            Err(e) => {
                debug!(error = %e, "peer stream failed before the header");
                return;
            }
        };

        match self.table.judge_inbound_stream(header.request_id, header.stream_tag) {
            StreamVerdict::Injection => {
                warn!(
                    request_id = header.request_id,
                    tag = header.stream_tag,
                    "stream injection"
                );
                reader.stop(REJECT_STREAM_CODE);
                self.emit_stream_error(header, ProtocolError::StreamInjection {
                    request_id: header.request_id,
                    stream_tag: header.stream_tag,
                });
            }
            StreamVerdict::InvalidRef => {
                warn!(
                    request_id = header.request_id,
                    tag = header.stream_tag,
                    "invalid stream reference"
                );
                reader.stop(REJECT_STREAM_CODE);
                self.emit_stream_error(header, ProtocolError::InvalidStreamRef {
                    request_id: header.request_id,
                    stream_tag: header.stream_tag,
                });
            }
            StreamVerdict::Accept(id) => {
                if self.try_acquire().is_err() {
                    reader.stop(REJECT_STREAM_CODE);
                    self.emit_stream_error(header, ProtocolError::StreamLimitExceeded);
                    return;
                }
                self.table.bind_stream(&id, header.stream_tag);

                let tracked = TrackedReader {
                    inner: Some(reader),
                    mux: Arc::clone(self),
                    id: id.clone(),
                    tag: header.stream_tag,
                };
                let delivered = self.table.deliver_inbound(
                    &id,
                    InboundStream {
                        stream_tag: header.stream_tag,
                        reader: Box::new(tracked),
                    },
                );
                if !delivered {
                    // No subscriber: the TrackedReader drop unbinds and
                    // releases the budget.
                    warn!(request_id = %id, tag = header.stream_tag, "inbound stream had no subscriber");
                }
            }
        }
    }

    /// Best-effort `$/streamError` for every live stream at teardown.
    pub fn abort_all(&self, message: &str) {
        for (request_id, stream_tag) in self.table.live_streams() {
            let params = StreamErrorParams {
                request_id,
                stream_tag,
                code: -32000,
                message: message.to_string(),
            };
            let _ = self
                .outbound
                .try_send(Outbound::Message(RpcMessage::Request(
                    params.into_notification(),
                )));
        }
    }

    fn emit_stream_error(&self, header: StreamHeader, error: ProtocolError) {
        let params = StreamErrorParams {
            request_id: header.request_id,
            stream_tag: header.stream_tag,
            code: error.code(),
            message: error.to_string(),
        };
        // Best-effort: a full outbound queue loses the notification, not
        // the session.
        let _ = self
            .outbound
            .try_send(Outbound::Message(RpcMessage::Request(
                params.into_notification(),
            )));
    }

    fn try_acquire(&self) -> ProtocolResult<()> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max_streams {
                return Err(ProtocolError::StreamLimitExceeded);
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn read_header(reader: &mut dyn StreamReader) -> TransportResult<Option<StreamHeader>> {
    let mut buf = [0u8; STREAM_HEADER_LEN];
    let mut filled = 0;
    while filled < STREAM_HEADER_LEN {
        match reader.read(&mut buf[filled..]).await? {
            Some(n) => filled += n,
            None => return Ok(None),
        }
    }
    Ok(Some(StreamHeader::decode(&buf)))
}

/// Write handle for an Execution Stream the server opened.
///
/// Closing the writer signals end-of-payload. Dropping it unclosed resets
/// the stream at the transport level.
pub struct ExecutionStreamWriter {
    mux: Arc<StreamMux>,
    id: RequestId,
    tag: u32,
    inner: Box<dyn StreamWriter>,
    closed: bool,
}

impl std::fmt::Debug for ExecutionStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStreamWriter")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ExecutionStreamWriter {
    /// The tag to declare in the response's `ref/stream` content element.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.inner.write_all(buf).await
    }

    /// Finish the stream cleanly, marking end-of-payload.
    pub async fn finish(mut self) -> TransportResult<()> {
        let result = self.inner.finish().await;
        self.closed = true;
        self.mux.table.unbind_stream(&self.id, self.tag);
        self.mux.release();
        result
    }
}

impl Drop for ExecutionStreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.inner.reset(0);
            self.mux.table.unbind_stream(&self.id, self.tag);
            self.mux.release();
        }
    }
}

/// Inbound reader that returns its budget slot and table binding on drop.
struct TrackedReader {
    inner: Option<Box<dyn StreamReader>>,
    mux: Arc<StreamMux>,
    id: RequestId,
    tag: u32,
}

#[async_trait]
impl StreamReader for TrackedReader {
    async fn read(&mut self, buf: &mut [u8]) -> TransportResult<Option<usize>> {
        match self.inner.as_mut() {
            Some(reader) => reader.read(buf).await,
            None => Ok(None),
        }
    }

    fn stop(&mut self, code: u32) {
        if let Some(reader) = self.inner.as_mut() {
            reader.stop(code);
        }
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        self.mux.table.unbind_stream(&self.id, self.tag);
        self.mux.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemSession;
    use tokio::sync::mpsc;

    fn setup(
        max_streams: u32,
    ) -> (
        Arc<StreamMux>,
        MemSession,
        Arc<RequestTable>,
        mpsc::Receiver<Outbound>,
    ) {
        let (client, server) = MemSession::pair();
        let table = Arc::new(RequestTable::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let mux = Arc::new(StreamMux::new(
            Arc::new(server),
            Arc::clone(&table),
            outbound_tx,
            max_streams,
        ));
        (mux, client, table, outbound_rx)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = StreamHeader {
            request_id: 42,
            stream_tag: 1,
        };
        let encoded = header.encode();
        assert_eq!(encoded, [0, 0, 0, 42, 0, 0, 0, 1]);
        assert_eq!(StreamHeader::decode(&encoded), header);
    }

    #[tokio::test]
    async fn test_open_writes_header_first() {
        let (mux, client, table, _outbound) = setup(10);
        table.register(RequestId::Number(7), "tools/call").unwrap();

        let mut writer = mux.open(&RequestId::Number(7)).await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        writer.finish().await.unwrap();

        let mut reader = client.accept_uni().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 32];
        while let Some(n) = reader.read(&mut chunk).await.unwrap() {
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&buf[..8], &[0, 0, 0, 7, 0, 0, 0, 1]);
        assert_eq!(&buf[8..], b"payload");
    }

    #[tokio::test]
    async fn test_stream_limit_is_synchronous() {
        let (mux, _client, table, _outbound) = setup(1);
        table.register(RequestId::Number(1), "tools/call").unwrap();

        let _first = mux.open(&RequestId::Number(1)).await.unwrap();
        let err = mux.open(&RequestId::Number(1)).await.unwrap_err();
        assert!(matches!(err, ProtocolError::StreamLimitExceeded));
    }

    #[tokio::test]
    async fn test_finish_releases_budget_and_completes() {
        let (mux, _client, table, _outbound) = setup(1);
        table.register(RequestId::Number(1), "tools/call").unwrap();

        let writer = mux.open(&RequestId::Number(1)).await.unwrap();
        assert_eq!(mux.active(), 1);
        writer.finish().await.unwrap();
        assert_eq!(mux.active(), 0);

        table.mark_response_sent(&RequestId::Number(1));
        assert_eq!(table.in_flight(), 0);

        // Budget is free again.
        table.register(RequestId::Number(2), "tools/call").unwrap();
        assert!(mux.open(&RequestId::Number(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_resets_and_releases() {
        let (mux, _client, table, _outbound) = setup(1);
        table.register(RequestId::Number(1), "tools/call").unwrap();

        let writer = mux.open(&RequestId::Number(1)).await.unwrap();
        drop(writer);
        assert_eq!(mux.active(), 0);
    }

    #[tokio::test]
    async fn test_injection_emits_stream_error() {
        let (mux, client, _table, mut outbound) = setup(10);
        tokio::spawn(Arc::clone(&mux).run_accept_loop());

        // requestId=42 was never registered.
        let mut writer = client.open_uni().await.unwrap();
        writer
            .write_all(&[0, 0, 0, 42, 0, 0, 0, 1])
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let Outbound::Message(RpcMessage::Request(notification)) = outbound.recv().await.unwrap()
        else {
            panic!("expected notification");
        };
        assert_eq!(notification.method, "$/streamError");
        let params = notification.params.unwrap();
        assert_eq!(params["requestId"], 42);
        assert_eq!(params["streamTag"], 1);
        assert_eq!(params["code"], -32002);
    }

    #[tokio::test]
    async fn test_undeclared_tag_emits_invalid_ref() {
        let (mux, client, table, mut outbound) = setup(10);
        table.register(RequestId::Number(9), "tools/call").unwrap();
        tokio::spawn(Arc::clone(&mux).run_accept_loop());

        let mut writer = client.open_uni().await.unwrap();
        writer.write_all(&[0, 0, 0, 9, 0, 0, 0, 5]).await.unwrap();
        writer.finish().await.unwrap();

        let Outbound::Message(RpcMessage::Request(notification)) = outbound.recv().await.unwrap()
        else {
            panic!("expected notification");
        };
        let params = notification.params.unwrap();
        assert_eq!(params["code"], -32001);
    }

    #[tokio::test]
    async fn test_accepted_stream_reaches_subscriber() {
        let (mux, client, table, _outbound) = setup(10);
        let id = RequestId::Number(3);
        table.register(id.clone(), "tools/call").unwrap();
        let tag = table.allocate_stream_tag(&id).unwrap();
        let mut inbound = table.subscribe_inbound(&id).unwrap();
        tokio::spawn(Arc::clone(&mux).run_accept_loop());

        let header = StreamHeader {
            request_id: 3,
            stream_tag: tag,
        };
        let mut writer = client.open_uni().await.unwrap();
        writer.write_all(&header.encode()).await.unwrap();
        writer.write_all(b"upload").await.unwrap();
        writer.finish().await.unwrap();

        let mut stream = inbound.recv().await.unwrap();
        assert_eq!(stream.stream_tag, tag);

        let mut buf = Vec::new();
        let mut chunk = [0u8; 16];
        while let Some(n) = stream.reader.read(&mut chunk).await.unwrap() {
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(&buf, b"upload");
    }
}
