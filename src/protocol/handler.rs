//! Request handler trait and method dispatcher.

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::types::*;
use crate::session::RequestContext;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Handler trait for processing MCP requests.
///
/// Lifecycle methods (`$/cancel`, `$/shutdown`, `$/streamError`) never
/// reach a handler; the session engine owns them.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle the `initialize` request. `transport` carries the outcome of
    /// encoding negotiation for the handler to embed in its result.
    async fn initialize(
        &self,
        params: InitializeParams,
        transport: ServerTransportInfo,
    ) -> ProtocolResult<InitializeResult>;

    /// Handle the `notifications/initialized` notification.
    async fn initialized(&self) -> ProtocolResult<()>;

    /// List available tools.
    async fn list_tools(&self) -> ProtocolResult<ListToolsResult>;

    /// Call a tool. The context is the handler's capability to open
    /// Execution Streams and send datagrams under this request's id, and
    /// to observe cancellation.
    async fn call_tool(
        &self,
        ctx: RequestContext,
        params: CallToolParams,
    ) -> ProtocolResult<CallToolResult>;

    /// Handle a ping request.
    async fn ping(&self) -> ProtocolResult<Value> {
        Ok(serde_json::json!({}))
    }
}

/// Method dispatcher that routes READY-phase requests to the handler.
pub struct Dispatcher<H: Handler> {
    handler: Arc<H>,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Dispatch a request that owes exactly one response.
    #[instrument(skip(self, request, ctx), fields(method = %request.method))]
    pub async fn dispatch(&self, request: RpcRequest, ctx: RequestContext) -> RpcResponse {
        debug!(id = %ctx.request_id(), "dispatching request");

        let result = match Method::parse(&request.method) {
            Some(Method::ToolsList) => self.handle_list_tools().await,
            Some(Method::ToolsCall) => self.handle_call_tool(ctx, request.params.clone()).await,
            Some(Method::Ping) => self.handler.ping().await,
            Some(Method::Initialize) => Err(ProtocolError::InvalidRequest(
                "initialize is only valid as the first frame".into(),
            )),
            Some(
                Method::Initialized | Method::Cancel | Method::Shutdown | Method::StreamError,
            ) => Err(ProtocolError::InvalidRequest(
                "lifecycle method routed past the session engine".into(),
            )),
            None => {
                warn!("unknown method: {}", request.method);
                Err(ProtocolError::MethodNotFound(request.method.clone()))
            }
        };

        match result {
            Ok(value) => RpcResponse::success(request.id, value),
            Err(e) => {
                error!("request failed: {}", e);
                RpcResponse::error(request.id, RpcError::new(e.code(), e.to_string()))
            }
        }
    }

    /// Route a handler-facing notification. Never replies.
    pub async fn dispatch_notification(&self, request: RpcRequest) {
        match Method::parse(&request.method) {
            Some(Method::Initialized) => {
                if let Err(e) = self.handler.initialized().await {
                    warn!("initialized hook failed: {}", e);
                }
            }
            _ => {
                debug!("ignoring notification: {}", request.method);
            }
        }
    }

    async fn handle_list_tools(&self) -> ProtocolResult<Value> {
        let result = self.handler.list_tools().await?;
        serde_json::to_value(result).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
    }

    async fn handle_call_tool(
        &self,
        ctx: RequestContext,
        params: Option<Value>,
    ) -> ProtocolResult<Value> {
        let params: CallToolParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProtocolError::InvalidParams(e.to_string().into()))?
            .ok_or_else(|| ProtocolError::InvalidParams("Missing params".into()))?;

        let result = self.handler.call_tool(ctx, params).await?;
        serde_json::to_value(result).map_err(|e| ProtocolError::InternalError(e.to_string().into()))
    }
}
