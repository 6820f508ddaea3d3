//! MCP-Flow request handler implementation.

use crate::error::{McpFlowError, ProtocolError, ProtocolResult};
use crate::protocol::{
    CallToolParams, CallToolResult, Handler, InitializeParams, InitializeResult, ListToolsResult,
    MCP_VERSION, ServerCapabilities, ServerInfo, ServerTransportInfo, ToolsCapability,
};
use crate::server::state::ServerState;
use crate::session::RequestContext;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Handler that serves the tool registry over MCP-Flow.
pub struct McpFlowHandler {
    state: Arc<ServerState>,
}

impl McpFlowHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    fn instructions(&self) -> String {
        if let Some(instructions) = self.state.config.instructions.as_deref() {
            return instructions.to_string();
        }
        let mut names: Vec<String> = self
            .state
            .tools
            .list()
            .into_iter()
            .map(|t| t.name)
            .collect();
        names.sort();
        format!(
            "MCP-Flow tool server. Available tools: {}.",
            names.join(", ")
        )
    }
}

#[async_trait]
impl Handler for McpFlowHandler {
    async fn initialize(
        &self,
        params: InitializeParams,
        transport: ServerTransportInfo,
    ) -> ProtocolResult<InitializeResult> {
        info!(
            "initialize request from {} v{}",
            params.client_info.name, params.client_info.version
        );
        debug!(encoding = %transport.encoding, "negotiated transport");

        self.state.set_initialized(params.client_info);

        let capabilities = ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(false),
            }),
        };

        Ok(InitializeResult {
            protocol_version: MCP_VERSION.into(),
            capabilities,
            server_info: ServerInfo {
                name: self.state.config.name.to_string(),
                version: self.state.config.version.to_string(),
            },
            instructions: Some(self.instructions()),
            transport,
        })
    }

    async fn initialized(&self) -> ProtocolResult<()> {
        info!("client initialized");
        Ok(())
    }

    async fn list_tools(&self) -> ProtocolResult<ListToolsResult> {
        let tools = self.state.tools.list();
        debug!("listing {} tools", tools.len());

        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        ctx: RequestContext,
        params: CallToolParams,
    ) -> ProtocolResult<CallToolResult> {
        debug!("tool call: {}", params.name);

        let execution = self.state.tools.execute(&ctx, params);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ProtocolError::Cancelled),
            result = execution => match result {
                Ok(result) => Ok(result),
                // Stream exhaustion and cancellation surface as the
                // request error; anything else is a tool-level failure
                // wrapped per MCP convention.
                Err(McpFlowError::Protocol(e @ ProtocolError::StreamLimitExceeded)) => Err(e),
                Err(McpFlowError::Protocol(e @ ProtocolError::Cancelled)) => Err(e),
                Err(e) => {
                    tracing::error!("tool execution error: {}", e);
                    Ok(CallToolResult::error(e.to_string()))
                }
            },
        }
    }
}
