//! Tool registration and built-in tools.

pub mod echo;
pub mod registry;

pub use echo::{EchoJokeTool, EchoStreamTool};
pub use registry::{ToolHandler, ToolRegistry};

/// Create a registry populated with the built-in echo tools.
pub fn create_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(EchoJokeTool::new());
    registry.register(EchoStreamTool);
    registry
}
