//! JSON-RPC 2.0, MCP, and MCP-Flow envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// JSON-RPC version constant.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol version.
pub const MCP_VERSION: &str = "2024-11-05";

/// MCP-Flow transport binding version.
pub const MCP_FLOW_VERSION: &str = "0.1";

/// Transport discriminator carried in `initialize` capability envelopes.
pub const TRANSPORT_TYPE: &str = "mcp-flow";

/// Recommended WebTransport upgrade path.
pub const UPGRADE_PATH: &str = "/mcp-flow";

/// ALPN identifier for the underlying HTTP/3 connection.
pub const ALPN: &str = "h3";

/// Minimum TLS version the transport must enforce.
pub const MIN_TLS_VERSION: &str = "1.3";

/// Well-known method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
    pub const CANCEL: &str = "$/cancel";
    pub const SHUTDOWN: &str = "$/shutdown";
    pub const STREAM_ERROR: &str = "$/streamError";
}

/// Known method discriminator.
///
/// Unknown methods are not an error at this layer; the dispatcher decides
/// whether a reply is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Initialized,
    ToolsList,
    ToolsCall,
    Ping,
    Cancel,
    Shutdown,
    StreamError,
}

impl Method {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            methods::INITIALIZE => Some(Self::Initialize),
            methods::INITIALIZED => Some(Self::Initialized),
            methods::TOOLS_LIST => Some(Self::ToolsList),
            methods::TOOLS_CALL => Some(Self::ToolsCall),
            methods::PING => Some(Self::Ping),
            methods::CANCEL => Some(Self::Cancel),
            methods::SHUTDOWN => Some(Self::Shutdown),
            methods::STREAM_ERROR => Some(Self::StreamError),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => methods::INITIALIZE,
            Self::Initialized => methods::INITIALIZED,
            Self::ToolsList => methods::TOOLS_LIST,
            Self::ToolsCall => methods::TOOLS_CALL,
            Self::Ping => methods::PING,
            Self::Cancel => methods::CANCEL,
            Self::Shutdown => methods::SHUTDOWN,
            Self::StreamError => methods::STREAM_ERROR,
        }
    }
}

/// JSON-RPC request ID - a string or an integer, unique per direction
/// until the matching response is written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl RequestId {
    /// The numeric form used in Execution Stream and datagram headers.
    ///
    /// String ids cannot be referenced from stream headers; requests with
    /// string ids simply cannot own Execution Streams or datagrams.
    pub fn as_wire_id(&self) -> Option<u32> {
        match self {
            Self::Number(n) => u32::try_from(*n).ok(),
            Self::String(_) => None,
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Number(n) => write!(f, "{}", n),
        }
    }
}

/// JSON-RPC 2.0 Request or Notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.into(),
            params: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Check if this is a notification (no id, no reply owed).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: Cow<'static, str>,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    // Standard JSON-RPC 2.0 errors
    pub fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::new(-32600, msg)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("Method not found: {}", method))
    }

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self::new(-32602, msg)
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::new(-32603, msg)
    }

    // MCP-Flow transport errors
    pub fn cancelled() -> Self {
        Self::new(-32000, "Cancelled")
    }

    pub fn stream_limit_exceeded() -> Self {
        Self::new(-32000, "Stream limit exceeded")
    }

    pub fn encoding_mismatch(expected: &str) -> Self {
        Self::new(-32003, format!("Encoding mismatch: expected {}", expected))
    }
}

/// Incoming message - either request/notification or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

/// MCP Server information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// MCP Client information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Server capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// Client half of the transport capability handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTransportInfo {
    #[serde(rename = "type")]
    pub transport_type: String,
    pub version: String,
    /// Encodings ordered by client preference. Absent means JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encodings: Option<Vec<String>>,
}

/// Server half of the transport capability handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTransportInfo {
    #[serde(rename = "type")]
    pub transport_type: Cow<'static, str>,
    pub version: Cow<'static, str>,
    /// The encoding chosen for all post-initialize frames.
    pub encoding: String,
    pub max_concurrent_streams: u32,
    pub datagrams_supported: bool,
}

/// Initialize request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: ClientInfo,
    /// Absent for plain-MCP clients; such sessions stay on JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<ClientTransportInfo>,
}

/// Initialize response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub transport: ServerTransportInfo,
}

/// `$/cancel` notification params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelParams {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `$/streamError` notification params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamErrorParams {
    pub request_id: u32,
    pub stream_tag: u32,
    pub code: i32,
    pub message: String,
}

impl StreamErrorParams {
    /// Build the `$/streamError` notification carrying these params.
    pub fn into_notification(self) -> RpcRequest {
        RpcRequest::new(methods::STREAM_ERROR)
            .with_params(serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

/// Tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Tool list response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Tool call request params.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Tool call result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: Some(true),
        }
    }

    /// A result referencing an Execution Stream the server has opened.
    pub fn stream_ref(stream_tag: u32, mime_type: Option<String>) -> Self {
        Self {
            content: vec![ToolContent::StreamRef {
                stream_tag,
                mime_type,
            }],
            is_error: None,
        }
    }

    /// Stream tags declared by this result's content elements.
    pub fn declared_stream_tags(&self) -> impl Iterator<Item = u32> + '_ {
        self.content.iter().filter_map(|c| match c {
            ToolContent::StreamRef { stream_tag, .. } => Some(*stream_tag),
            _ => None,
        })
    }
}

/// Tool content elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    #[serde(rename_all = "camelCase")]
    Image { data: String, mime_type: String },
    /// Reference to an Execution Stream carrying the payload out of band.
    #[serde(rename = "ref/stream")]
    #[serde(rename_all = "camelCase")]
    StreamRef {
        stream_tag: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = RpcRequest::new("initialize")
            .with_id(1)
            .with_params(serde_json::json!({"test": "value"}));

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn test_notification_has_no_id() {
        let notification = RpcRequest::new(methods::INITIALIZED);
        assert!(notification.is_notification());

        let json = serde_json::to_string(&notification).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_response_success() {
        let response = RpcResponse::success(Some(1i64.into()), serde_json::json!({"ok": true}));
        assert!(response.result.is_some());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_response_error() {
        let response = RpcResponse::error(Some(1i64.into()), RpcError::method_not_found("nope"));
        let error = response.error.unwrap();
        assert_eq!(error.code, -32601);
        assert!(error.message.contains("nope"));
    }

    #[test]
    fn test_method_discrimination() {
        assert_eq!(Method::parse("initialize"), Some(Method::Initialize));
        assert_eq!(Method::parse("$/cancel"), Some(Method::Cancel));
        assert_eq!(Method::parse("$/streamError"), Some(Method::StreamError));
        assert_eq!(Method::parse("tools/call"), Some(Method::ToolsCall));
        assert_eq!(Method::parse("made/up"), None);
    }

    #[test]
    fn test_wire_id() {
        assert_eq!(RequestId::Number(42).as_wire_id(), Some(42));
        assert_eq!(RequestId::Number(-1).as_wire_id(), None);
        assert_eq!(RequestId::Number(i64::MAX).as_wire_id(), None);
        assert_eq!(RequestId::from("abc").as_wire_id(), None);
    }

    #[test]
    fn test_initialize_params_without_transport() {
        let json = r#"{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"}}"#;
        let params: InitializeParams = serde_json::from_str(json).unwrap();
        assert!(params.transport.is_none());
    }

    #[test]
    fn test_initialize_params_with_encodings() {
        let json = r#"{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t","version":"1"},"transport":{"type":"mcp-flow","version":"0.1","encodings":["cbor","json"]}}"#;
        let params: InitializeParams = serde_json::from_str(json).unwrap();
        let transport = params.transport.unwrap();
        assert_eq!(transport.transport_type, TRANSPORT_TYPE);
        assert_eq!(
            transport.encodings.as_deref(),
            Some(&["cbor".to_string(), "json".to_string()][..])
        );
    }

    #[test]
    fn test_stream_ref_content() {
        let result = CallToolResult::stream_ref(3, Some("audio/ogg".into()));
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"type\":\"ref/stream\""));
        assert!(json.contains("\"streamTag\":3"));

        let tags: Vec<u32> = result.declared_stream_tags().collect();
        assert_eq!(tags, vec![3]);
    }

    #[test]
    fn test_stream_error_notification() {
        let notification = StreamErrorParams {
            request_id: 42,
            stream_tag: 1,
            code: -32002,
            message: "Stream injection".into(),
        }
        .into_notification();

        assert!(notification.is_notification());
        assert_eq!(notification.method, methods::STREAM_ERROR);
        let params = notification.params.unwrap();
        assert_eq!(params["requestId"], 42);
        assert_eq!(params["streamTag"], 1);
    }
}
