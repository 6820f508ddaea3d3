//! MCP-Flow protocol layer: message model, frame codec, and dispatch.

pub mod codec;
pub mod handler;
pub mod types;

pub use codec::{Encoding, FrameCodec, FrameDecoder, decode_message};
pub use handler::{Dispatcher, Handler};
pub use types::*;
