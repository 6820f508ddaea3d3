//! Server state management.

use crate::config::ServerConfig;
use crate::protocol::ClientInfo;
use crate::tools::ToolRegistry;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// State shared by every session of one server.
pub struct ServerState {
    pub config: ServerConfig,
    pub tools: ToolRegistry,
    initialized: AtomicBool,
    client_info: RwLock<Option<ClientInfo>>,
    session_count: AtomicU64,
}

impl ServerState {
    pub fn new(config: ServerConfig, tools: ToolRegistry) -> Self {
        Self {
            config,
            tools,
            initialized: AtomicBool::new(false),
            client_info: RwLock::new(None),
            session_count: AtomicU64::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self, client_info: ClientInfo) {
        *self.client_info.write() = Some(client_info);
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client_info.read().clone()
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn session_count(&self) -> u64 {
        self.session_count.load(Ordering::SeqCst)
    }
}

/// Builder for [`ServerState`].
pub struct ServerStateBuilder {
    config: Option<ServerConfig>,
    tools: Option<ToolRegistry>,
}

impl ServerStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            tools: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn build(self) -> Result<ServerState, &'static str> {
        let config = self.config.unwrap_or_default();
        let tools = self.tools.unwrap_or_else(crate::tools::create_registry);

        Ok(ServerState::new(config, tools))
    }
}

impl Default for ServerStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let state = ServerStateBuilder::new().build().unwrap();
        assert!(!state.is_initialized());
        assert_eq!(state.tools.len(), 2);
    }

    #[test]
    fn test_set_initialized() {
        let state = ServerStateBuilder::new().build().unwrap();
        state.set_initialized(ClientInfo {
            name: "test-client".into(),
            version: "1.0".into(),
        });

        assert!(state.is_initialized());
        assert_eq!(state.client_info().unwrap().name, "test-client");
    }
}
