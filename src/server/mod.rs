//! Server assembly: shared state and the default handler.

pub mod handler;
pub mod state;

pub use handler::McpFlowHandler;
pub use state::{ServerState, ServerStateBuilder};
