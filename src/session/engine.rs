//! Per-session protocol engine.
//!
//! One engine per WebTransport session. The engine accepts the single
//! Control Stream, runs the encoding handshake, then loops: decode frame,
//! dispatch. Handlers run concurrently, one task per request; their
//! responses funnel through a single writer task, so control frames are
//! never interleaved on the wire.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::datagram::DatagramPlane;
use crate::error::{McpFlowError, ProtocolError, Result, TransportError};
use crate::protocol::{
    CancelParams, Dispatcher, Encoding, FrameCodec, FrameDecoder, Handler, InitializeParams,
    MCP_FLOW_VERSION, Method, RequestId, RpcError, RpcMessage, RpcRequest, RpcResponse,
    ServerTransportInfo, StreamErrorParams, TRANSPORT_TYPE, decode_message, methods,
};
use crate::session::{Outbound, PhaseCell, RequestContext, RequestTable};
use crate::streams::StreamMux;
use crate::transport::{SessionTransport, StreamReader, StreamWriter};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reset code handed to refused bidirectional streams.
const REFUSED_BI_STREAM_CODE: u32 = 1;

/// How long teardown waits for the writer to flush a final error frame.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives one MCP-Flow session to completion.
pub struct SessionEngine<H: Handler> {
    transport: Arc<dyn SessionTransport>,
    handler: Arc<H>,
    config: SessionConfig,
}

impl<H: Handler + 'static> SessionEngine<H> {
    pub fn new(
        transport: Arc<dyn SessionTransport>,
        handler: Arc<H>,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            handler,
            config,
        }
    }

    /// Run the session until it closes. `Ok` is an orderly close; `Err`
    /// carries the fatal protocol or transport error that ended it.
    pub async fn run(self) -> Result<()> {
        let Self {
            transport,
            handler,
            config,
        } = self;

        let phase = Arc::new(PhaseCell::new());
        phase.on_session_established()?;

        let (control_writer, control_reader) = transport.accept_bi().await?;
        phase.on_control_stream_opened()?;
        info!("control stream opened");

        // Exactly one bidirectional stream per session; refuse the rest.
        tokio::spawn(refuse_bi_streams(Arc::clone(&transport)));

        let table = Arc::new(RequestTable::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(config.response_queue_depth);
        let codec = FrameCodec::new(config.max_frame_size);
        let writer_handle = tokio::spawn(run_writer(
            control_writer,
            outbound_rx,
            codec,
            Arc::clone(&table),
        ));

        let mux = Arc::new(StreamMux::new(
            Arc::clone(&transport),
            Arc::clone(&table),
            outbound_tx.clone(),
            config.max_concurrent_streams,
        ));
        let datagrams = Arc::new(DatagramPlane::new(
            Arc::clone(&transport),
            config.datagrams_supported,
            config.max_datagram_size,
        ));
        tokio::spawn(Arc::clone(&mux).run_accept_loop());
        tokio::spawn(Arc::clone(&datagrams).run_recv_loop());

        let runtime = SessionRuntime {
            transport: Arc::clone(&transport),
            handler,
            config,
            phase: Arc::clone(&phase),
            table: Arc::clone(&table),
            mux: Arc::clone(&mux),
            datagrams,
            outbound: outbound_tx.clone(),
        };

        let mut reader = ControlReader::new(
            control_reader,
            Arc::clone(&transport),
            runtime.config.max_frame_size,
        );

        let outcome = runtime.drive(&mut reader).await;

        table.cancel_all("session closed");
        mux.abort_all("Transport reset");
        flush_writer(&outbound_tx).await;
        drop(outbound_tx);
        transport.close(0, "session closed").await;
        phase.on_closed();
        writer_handle.abort();
        info!("session closed");

        outcome
    }
}

/// Shared state for the running session, cloned into spawned tasks.
struct SessionRuntime<H: Handler> {
    transport: Arc<dyn SessionTransport>,
    handler: Arc<H>,
    config: SessionConfig,
    phase: Arc<PhaseCell>,
    table: Arc<RequestTable>,
    mux: Arc<StreamMux>,
    datagrams: Arc<DatagramPlane>,
    outbound: mpsc::Sender<Outbound>,
}

impl<H: Handler + 'static> SessionRuntime<H> {
    /// Handshake then main loop.
    async fn drive(&self, reader: &mut ControlReader) -> Result<()> {
        let encoding = match timeout(self.config.handshake_timeout, reader.next_body()).await {
            Err(_) => {
                warn!("handshake timeout; closing session");
                return Err(ProtocolError::InvalidRequest("handshake timeout".into()).into());
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(None)) => {
                debug!("peer closed before initialize");
                return Ok(());
            }
            Ok(Ok(Some(body))) => match self.handshake(body).await {
                Ok(encoding) => encoding,
                Err(e) => {
                    self.send(RpcMessage::Response(RpcResponse::error(
                        None,
                        RpcError::new(e.code(), e.to_string()),
                    )))
                    .await;
                    return Err(e.into());
                }
            },
        };

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&self.handler)));

        loop {
            match reader.next_body().await {
                Ok(Some(body)) => {
                    if let Err(e) = self.handle_body(&body, encoding, &dispatcher).await {
                        self.send(RpcMessage::Response(RpcResponse::error(
                            None,
                            RpcError::new(e.code(), e.to_string()),
                        )))
                        .await;
                        return Err(e.into());
                    }
                }
                Ok(None) => {
                    info!("control stream ended");
                    return Ok(());
                }
                Err(McpFlowError::Protocol(e)) => {
                    self.send(RpcMessage::Response(RpcResponse::error(
                        None,
                        RpcError::new(e.code(), e.to_string()),
                    )))
                    .await;
                    return Err(e.into());
                }
                Err(e) => {
                    error!("control stream failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Validate the first frame and negotiate the session encoding.
    ///
    /// The `initialize` request and its response are always JSON.
    async fn handshake(&self, body: Bytes) -> std::result::Result<Encoding, ProtocolError> {
        let message = decode_message(&body, Encoding::Json)?;
        let RpcMessage::Request(request) = message else {
            return Err(ProtocolError::InvalidRequest(
                "first frame must be an initialize request".into(),
            ));
        };
        if request.method != methods::INITIALIZE || request.id.is_none() {
            return Err(ProtocolError::InvalidRequest(
                "first frame must be an initialize request".into(),
            ));
        }
        self.phase.on_initialize_received()?;

        let params: InitializeParams = request
            .params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))?
            .ok_or_else(|| ProtocolError::InvalidParams("Missing params".into()))?;

        if let Some(transport) = params.transport.as_ref() {
            if transport.transport_type != TRANSPORT_TYPE {
                return Err(ProtocolError::InvalidRequest(
                    format!("unknown transport type: {}", transport.transport_type).into(),
                ));
            }
        }

        let preferences = params
            .transport
            .as_ref()
            .and_then(|t| t.encodings.as_deref());
        let encoding = self
            .config
            .select_encoding(preferences)
            .ok_or(ProtocolError::EncodingMismatch { expected: "json" })?;

        let transport_info = ServerTransportInfo {
            transport_type: TRANSPORT_TYPE.into(),
            version: MCP_FLOW_VERSION.into(),
            encoding: encoding.as_str().to_string(),
            max_concurrent_streams: self.config.max_concurrent_streams,
            datagrams_supported: self.config.datagrams_supported,
        };

        let result = self.handler.initialize(params, transport_info).await?;
        let result = serde_json::to_value(result)
            .map_err(|e| ProtocolError::InternalError(e.to_string().into()))?;

        let response = RpcResponse::success(request.id, result);
        let _ = self
            .outbound
            .send(Outbound::ResponseThenSwitch {
                message: RpcMessage::Response(response),
                encoding,
            })
            .await;
        self.phase.on_initialize_responded()?;
        info!(encoding = %encoding, "session ready");
        Ok(encoding)
    }

    /// Decode and route one post-handshake frame.
    ///
    /// `Err` means the session must close; recoverable conditions are
    /// answered on the wire and swallowed here.
    async fn handle_body(
        &self,
        body: &[u8],
        encoding: Encoding,
        dispatcher: &Arc<Dispatcher<H>>,
    ) -> std::result::Result<(), ProtocolError> {
        let message = match decode_message(body, encoding) {
            Ok(message) => message,
            Err(ProtocolError::ParseError) => {
                // Diagnose: a body that parses under the other encoding is
                // an encoding mismatch (-32003, recoverable), not garbage.
                let other = match encoding {
                    Encoding::Json => Encoding::Cbor,
                    Encoding::Cbor => Encoding::Json,
                };
                match decode_message(body, other) {
                    Ok(RpcMessage::Request(request)) => {
                        warn!(method = %request.method, "frame in wrong encoding");
                        self.send(RpcMessage::Response(RpcResponse::error(
                            request.id,
                            RpcError::encoding_mismatch(encoding.as_str()),
                        )))
                        .await;
                        return Ok(());
                    }
                    Ok(RpcMessage::Response(_)) => {
                        self.send(RpcMessage::Response(RpcResponse::error(
                            None,
                            RpcError::encoding_mismatch(encoding.as_str()),
                        )))
                        .await;
                        return Ok(());
                    }
                    Err(_) => return Err(ProtocolError::ParseError),
                }
            }
            Err(e) => return Err(e),
        };

        let request = match message {
            RpcMessage::Request(request) => request,
            RpcMessage::Response(response) => {
                warn!(id = ?response.id, "unexpected response frame");
                return Ok(());
            }
        };

        match Method::parse(&request.method) {
            Some(Method::Cancel) => self.on_cancel(request).await,
            Some(Method::Shutdown) => self.on_shutdown(request).await,
            Some(Method::StreamError) => self.on_stream_error(request).await,
            Some(Method::Initialized) | None if request.is_notification() => {
                dispatcher.dispatch_notification(request).await;
            }
            _ => self.on_request(request, dispatcher).await,
        }
        Ok(())
    }

    /// `$/cancel`: signal the token; the handler owns the response.
    async fn on_cancel(&self, request: RpcRequest) {
        let id = request.id.clone();
        match request
            .params
            .map(serde_json::from_value::<CancelParams>)
            .transpose()
        {
            Ok(Some(params)) => {
                debug!(request_id = %params.request_id, "cancel requested");
                self.table.cancel(&params.request_id, params.reason);
                self.ack_lifecycle(id).await;
            }
            Ok(None) | Err(_) => {
                warn!("malformed $/cancel params");
                if id.is_some() {
                    self.send(RpcMessage::Response(RpcResponse::error(
                        id,
                        RpcError::invalid_params("Invalid $/cancel params"),
                    )))
                    .await;
                }
            }
        }
    }

    /// `$/shutdown`: enter DRAINING and arm the drain watcher.
    async fn on_shutdown(&self, request: RpcRequest) {
        match self.phase.on_shutdown() {
            Ok(()) => {
                info!("shutdown requested; draining");
                self.mux.refuse_new_streams();
                tokio::spawn(drain_watch(
                    Arc::clone(&self.table),
                    Arc::clone(&self.mux),
                    Arc::clone(&self.transport),
                    self.config.drain_timeout,
                ));
            }
            Err(_) => debug!("redundant $/shutdown ignored"),
        }
        self.ack_lifecycle(request.id).await;
    }

    /// Peer `$/streamError`: notify the owning handler.
    async fn on_stream_error(&self, request: RpcRequest) {
        if let Ok(Some(params)) = request
            .params
            .map(serde_json::from_value::<StreamErrorParams>)
            .transpose()
        {
            debug!(
                request_id = params.request_id,
                tag = params.stream_tag,
                code = params.code,
                "peer stream error"
            );
            self.table.notify_stream_error(params);
        }
        self.ack_lifecycle(request.id).await;
    }

    /// Register an id-carrying request and run its handler concurrently.
    async fn on_request(&self, request: RpcRequest, dispatcher: &Arc<Dispatcher<H>>) {
        let Some(id) = request.id.clone() else {
            // Unknown notification: ignored.
            debug!("ignoring notification: {}", request.method);
            return;
        };

        if self.phase.is_draining() {
            self.send(RpcMessage::Response(RpcResponse::error(
                Some(id),
                RpcError::invalid_request("session is draining"),
            )))
            .await;
            return;
        }

        let token = match self.table.register(id.clone(), &request.method) {
            Ok(token) => token,
            Err(e) => {
                self.send(RpcMessage::Response(RpcResponse::error(
                    Some(id),
                    RpcError::new(e.code(), e.to_string()),
                )))
                .await;
                return;
            }
        };

        let ctx = RequestContext::new(
            id.clone(),
            token,
            Arc::clone(&self.table),
            Arc::clone(&self.mux),
            Arc::clone(&self.datagrams),
        );
        let dispatcher = Arc::clone(dispatcher);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let response = dispatcher.dispatch(request, ctx).await;
            let _ = outbound
                .send(Outbound::Response {
                    message: RpcMessage::Response(response),
                    id,
                })
                .await;
        });
    }

    /// Lifecycle methods are notifications in practice, but an id-carrying
    /// variant still gets its one response.
    async fn ack_lifecycle(&self, id: Option<RequestId>) {
        if id.is_some() {
            self.send(RpcMessage::Response(RpcResponse::success(
                id,
                serde_json::json!({}),
            )))
            .await;
        }
    }

    async fn send(&self, message: RpcMessage) {
        let _ = self.outbound.send(Outbound::Message(message)).await;
    }
}

/// Control Stream reader: transport chunks in, frame bodies out.
struct ControlReader {
    inner: Box<dyn StreamReader>,
    transport: Arc<dyn SessionTransport>,
    decoder: FrameDecoder,
}

impl ControlReader {
    fn new(
        inner: Box<dyn StreamReader>,
        transport: Arc<dyn SessionTransport>,
        max_frame_size: u32,
    ) -> Self {
        Self {
            inner,
            transport,
            decoder: FrameDecoder::new(max_frame_size),
        }
    }

    /// Next complete frame body. `Ok(None)` is a clean end of session.
    async fn next_body(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(body) = self.decoder.try_next_body()? {
                return Ok(Some(body));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = tokio::select! {
                read = self.inner.read(&mut chunk) => read,
                _ = self.transport.closed() => return Ok(None),
            };
            match read {
                Ok(Some(n)) => self.decoder.feed(&chunk[..n]),
                Ok(None) => {
                    if self.decoder.has_partial_frame() {
                        return Err(ProtocolError::TruncatedFrame.into());
                    }
                    return Ok(None);
                }
                Err(TransportError::Closed) => return Ok(None),
                Err(TransportError::Reset(_)) => {
                    return Err(ProtocolError::TruncatedFrame.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The single Control Stream writer. Owns the write half and the current
/// encoding; the switch lands exactly at the initialize-response boundary.
async fn run_writer(
    mut writer: Box<dyn StreamWriter>,
    mut rx: mpsc::Receiver<Outbound>,
    codec: FrameCodec,
    table: Arc<RequestTable>,
) {
    let mut encoding = Encoding::Json;

    while let Some(outbound) = rx.recv().await {
        let (message, response_id, switch_to) = match outbound {
            Outbound::Message(message) => (message, None, None),
            Outbound::Response { message, id } => (message, Some(id), None),
            Outbound::ResponseThenSwitch {
                message,
                encoding: next,
            } => (message, None, Some(next)),
            Outbound::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        let frame = match codec.encode(&message, encoding) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode outbound frame: {}", e);
                // A response that cannot be encoded still owes its id an
                // answer.
                match (&message, &response_id) {
                    (RpcMessage::Response(_), Some(id)) => {
                        let fallback = RpcMessage::Response(RpcResponse::error(
                            Some(id.clone()),
                            RpcError::internal_error("response could not be encoded"),
                        ));
                        match codec.encode(&fallback, encoding) {
                            Ok(frame) => frame,
                            Err(_) => continue,
                        }
                    }
                    _ => continue,
                }
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            debug!("control stream write failed: {}", e);
            break;
        }
        if let Some(id) = response_id {
            table.mark_response_sent(&id);
        }
        if let Some(next) = switch_to {
            encoding = next;
        }
    }

    let _ = writer.finish().await;
}

/// Refuse every bidirectional stream after the Control Stream.
async fn refuse_bi_streams(transport: Arc<dyn SessionTransport>) {
    loop {
        match transport.accept_bi().await {
            Ok((mut writer, mut reader)) => {
                warn!("refusing extra bidirectional stream");
                writer.reset(REFUSED_BI_STREAM_CODE);
                reader.stop(REFUSED_BI_STREAM_CODE);
            }
            Err(_) => break,
        }
    }
}

/// DRAINING: close the session once the table is empty and every stream
/// has ended, or when the drain timer fires.
async fn drain_watch(
    table: Arc<RequestTable>,
    mux: Arc<StreamMux>,
    transport: Arc<dyn SessionTransport>,
    drain_timeout: Duration,
) {
    let wait = async {
        let mut drained = table.drained();
        loop {
            if *drained.borrow() && mux.active() == 0 {
                return;
            }
            tokio::select! {
                changed = drained.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    };

    if timeout(drain_timeout, wait).await.is_err() {
        warn!("drain timeout; forcing close");
    }
    transport.close(0, "drained").await;
}

/// Wait for every queued frame to hit the wire, bounded by [`FLUSH_TIMEOUT`].
async fn flush_writer(outbound: &mpsc::Sender<Outbound>) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if outbound.send(Outbound::Barrier(ack_tx)).await.is_ok() {
        let _ = timeout(FLUSH_TIMEOUT, ack_rx).await;
    }
}
