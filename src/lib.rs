//! MCP over WebTransport: a multiplexed transport binding for the Model
//! Context Protocol.
//!
//! A single HTTP/3 session carries one bidirectional Control Stream of
//! length-prefixed JSON-RPC frames (JSON or CBOR after negotiation),
//! unidirectional Execution Streams for bulk payloads, and datagrams for
//! lossy side traffic, so a slow tool result never blocks control
//! messages.
//!
//! The crate is the server-side protocol engine. The QUIC/WebTransport
//! stack itself stays behind [`transport::SessionTransport`]; anything
//! that can accept streams and move datagrams can carry a session.
//!
//! # Example
//!
//! ```no_run
//! use mcp_flow::server::{McpFlowHandler, ServerStateBuilder};
//! use mcp_flow::session::SessionEngine;
//! use mcp_flow::transport::MemSession;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mcp_flow::Result<()> {
//!     let state = Arc::new(
//!         ServerStateBuilder::new()
//!             .build()
//!             .expect("default state"),
//!     );
//!     let handler = Arc::new(McpFlowHandler::new(state));
//!
//!     // In production the transport comes from the WebTransport upgrade
//!     // at /mcp-flow; the mem pair is for embedding and tests.
//!     let (client, server) = MemSession::pair();
//!     # let _ = client;
//!
//!     SessionEngine::new(Arc::new(server), handler, Default::default())
//!         .run()
//!         .await
//! }
//! ```

pub mod config;
pub mod datagram;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod streams;
pub mod tools;
pub mod transport;

#[cfg(test)]
pub(crate) mod tests_support;

pub use config::{ServerConfig, SessionConfig};
pub use error::{McpFlowError, ProtocolError, Result};
pub use protocol::{Encoding, Handler};
pub use server::{McpFlowHandler, ServerState, ServerStateBuilder};
pub use session::{RequestContext, SessionEngine};
pub use transport::{MemSession, SessionTransport};
