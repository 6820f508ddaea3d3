//! Error types for the MCP-Flow transport binding.
//!
//! Uses `thiserror` for ergonomic error definitions with automatic `From` conversions.

use std::borrow::Cow;
use thiserror::Error;

/// Main error type for the MCP-Flow session engine.
#[derive(Debug, Error)]
pub enum McpFlowError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: Cow<'static, str> },
}

/// JSON-RPC 2.0 and MCP-Flow protocol errors.
///
/// Every variant maps to a wire error code via [`ProtocolError::code`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Parse error: invalid frame body")]
    ParseError,

    #[error("Truncated frame: peer closed mid-frame")]
    TruncatedFrame,

    #[error("Frame too large: {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    #[error("Duplicate request id")]
    DuplicateRequestId,

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(Cow<'static, str>),

    #[error("Internal error: {0}")]
    InternalError(Cow<'static, str>),

    #[error("Cancelled")]
    Cancelled,

    #[error("Stream limit exceeded")]
    StreamLimitExceeded,

    #[error("Invalid stream reference: request {request_id} tag {stream_tag}")]
    InvalidStreamRef { request_id: u32, stream_tag: u32 },

    #[error("Stream injection: no in-flight request {request_id}")]
    StreamInjection { request_id: u32, stream_tag: u32 },

    #[error("Encoding mismatch: expected {expected}")]
    EncodingMismatch { expected: &'static str },

    #[error("Datagrams not supported by this session")]
    DatagramsNotSupported,
}

impl ProtocolError {
    /// Returns the JSON-RPC 2.0 / MCP-Flow error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError | Self::TruncatedFrame | Self::FrameTooLarge { .. } => -32700,
            Self::InvalidRequest(_) | Self::DuplicateRequestId => -32600,
            Self::MethodNotFound(_) => -32601,
            Self::InvalidParams(_) => -32602,
            Self::InternalError(_) => -32603,
            Self::Cancelled | Self::StreamLimitExceeded => -32000,
            Self::InvalidStreamRef { .. } => -32001,
            Self::StreamInjection { .. } => -32002,
            Self::EncodingMismatch { .. } => -32003,
            Self::DatagramsNotSupported => -32004,
        }
    }

    /// True for errors that terminate the session rather than one request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ParseError | Self::TruncatedFrame | Self::FrameTooLarge { .. }
        )
    }
}

/// Errors surfaced by the underlying WebTransport session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Session closed")]
    Closed,

    #[error("Stream reset by peer (code {0})")]
    Reset(u32),

    #[error("Datagram queue full")]
    DatagramQueueFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(Cow<'static, str>),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        field: Cow<'static, str>,
        message: Cow<'static, str>,
    },
}

/// Tool execution errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Missing required argument: {0}")]
    MissingArgument(Cow<'static, str>),
}

/// Result type alias for McpFlowError.
pub type Result<T> = std::result::Result<T, McpFlowError>;

/// Result type alias for ProtocolError.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Result type alias for TransportError.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(ProtocolError::ParseError.code(), -32700);
        assert_eq!(ProtocolError::InvalidRequest("test".into()).code(), -32600);
        assert_eq!(ProtocolError::MethodNotFound("test".into()).code(), -32601);
        assert_eq!(ProtocolError::InvalidParams("test".into()).code(), -32602);
        assert_eq!(ProtocolError::InternalError("test".into()).code(), -32603);
        assert_eq!(ProtocolError::Cancelled.code(), -32000);
        assert_eq!(ProtocolError::StreamLimitExceeded.code(), -32000);
        assert_eq!(
            ProtocolError::InvalidStreamRef {
                request_id: 1,
                stream_tag: 1
            }
            .code(),
            -32001
        );
        assert_eq!(
            ProtocolError::StreamInjection {
                request_id: 42,
                stream_tag: 1
            }
            .code(),
            -32002
        );
        assert_eq!(
            ProtocolError::EncodingMismatch { expected: "json" }.code(),
            -32003
        );
        assert_eq!(ProtocolError::DatagramsNotSupported.code(), -32004);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::ParseError.is_fatal());
        assert!(
            ProtocolError::FrameTooLarge {
                size: 1 << 30,
                max: 1 << 24
            }
            .is_fatal()
        );
        assert!(!ProtocolError::MethodNotFound("nope".into()).is_fatal());
        assert!(!ProtocolError::Cancelled.is_fatal());
    }

    #[test]
    fn test_error_conversion() {
        let proto = ProtocolError::ParseError;
        let err: McpFlowError = proto.into();
        assert!(matches!(err, McpFlowError::Protocol(_)));
    }
}
