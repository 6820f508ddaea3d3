//! Configuration types and builders.

use crate::error::{ConfigError, Result};
use crate::protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::env;
use std::time::Duration;

/// Default maximum Control Stream frame body size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Default cap on open Execution Streams per session, both directions combined.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

/// Maximum datagram payload size, header included.
pub const MAX_DATAGRAM_PAYLOAD_SIZE: usize = 1200;

/// Per-session protocol limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Largest accepted Control Stream frame body, in bytes.
    pub max_frame_size: u32,
    /// Cap on concurrently open Execution Streams (Control Stream excluded).
    pub max_concurrent_streams: u32,
    /// Largest datagram, header plus payload. Oversize sends are dropped locally.
    pub max_datagram_size: usize,
    /// Whether this server advertises and routes datagrams.
    pub datagrams_supported: bool,
    /// Encodings the server is willing to negotiate, server preference last resort.
    pub supported_encodings: Vec<Encoding>,
    /// Time allowed between control stream accept and the `initialize` frame.
    pub handshake_timeout: Duration,
    /// Hard cap on the DRAINING phase after `$/shutdown`.
    pub drain_timeout: Duration,
    /// Bound on queued-but-unwritten response frames per session.
    pub response_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            max_datagram_size: MAX_DATAGRAM_PAYLOAD_SIZE,
            datagrams_supported: true,
            supported_encodings: vec![Encoding::Json, Encoding::Cbor],
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(30),
            response_queue_depth: 64,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Pick the encoding for a session from the client's ordered preferences.
    ///
    /// Absent or empty preferences fall back to JSON.
    pub fn select_encoding(&self, preferences: Option<&[String]>) -> Option<Encoding> {
        let Some(preferences) = preferences else {
            return Some(Encoding::Json);
        };
        if preferences.is_empty() {
            return Some(Encoding::Json);
        }
        preferences
            .iter()
            .filter_map(|name| Encoding::parse(name))
            .find(|enc| self.supported_encodings.contains(enc))
    }
}

/// Builder for [`SessionConfig`] with fluent API.
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_frame_size(mut self, bytes: u32) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    pub fn max_concurrent_streams(mut self, limit: u32) -> Self {
        self.config.max_concurrent_streams = limit;
        self
    }

    pub fn max_datagram_size(mut self, bytes: usize) -> Self {
        self.config.max_datagram_size = bytes;
        self
    }

    pub fn datagrams_supported(mut self, supported: bool) -> Self {
        self.config.datagrams_supported = supported;
        self
    }

    pub fn supported_encodings(mut self, encodings: Vec<Encoding>) -> Self {
        self.config.supported_encodings = encodings;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn response_queue_depth(mut self, depth: usize) -> Self {
        self.config.response_queue_depth = depth;
        self
    }

    /// Apply `MCP_FLOW_*` environment overrides.
    pub fn from_env(mut self) -> Result<Self> {
        if let Ok(size) = env::var("MCP_FLOW_MAX_FRAME_SIZE") {
            self.config.max_frame_size = size.parse().map_err(|_| ConfigError::InvalidValue {
                field: "MCP_FLOW_MAX_FRAME_SIZE".into(),
                message: "Invalid frame size".into(),
            })?;
        }

        if let Ok(limit) = env::var("MCP_FLOW_MAX_STREAMS") {
            self.config.max_concurrent_streams =
                limit.parse().map_err(|_| ConfigError::InvalidValue {
                    field: "MCP_FLOW_MAX_STREAMS".into(),
                    message: "Invalid stream limit".into(),
                })?;
        }

        if let Ok(datagrams) = env::var("MCP_FLOW_DATAGRAMS") {
            self.config.datagrams_supported = datagrams.parse().unwrap_or(true);
        }

        if let Ok(secs) = env::var("MCP_FLOW_HANDSHAKE_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::InvalidValue {
                field: "MCP_FLOW_HANDSHAKE_TIMEOUT_SECS".into(),
                message: "Invalid timeout".into(),
            })?;
            self.config.handshake_timeout = Duration::from_secs(secs);
        }

        if let Ok(secs) = env::var("MCP_FLOW_DRAIN_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::InvalidValue {
                field: "MCP_FLOW_DRAIN_TIMEOUT_SECS".into(),
                message: "Invalid timeout".into(),
            })?;
            self.config.drain_timeout = Duration::from_secs(secs);
        }

        Ok(self)
    }

    pub fn build(self) -> Result<SessionConfig> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<()> {
        if self.config.max_frame_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_frame_size".into(),
                message: "Frame size must be greater than 0".into(),
            }
            .into());
        }
        if self.config.supported_encodings.is_empty() {
            return Err(ConfigError::MissingField("supported_encodings".into()).into());
        }
        if self.config.response_queue_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "response_queue_depth".into(),
                message: "Queue depth must be greater than 0".into(),
            }
            .into());
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: Cow<'static, str>,
    pub version: Cow<'static, str>,
    /// Instructions string advertised in the `initialize` result.
    pub instructions: Option<Cow<'static, str>>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-flow".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            instructions: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<Cow<'static, str>>) -> Self {
        self.config.version = version.into();
        self
    }

    pub fn instructions(mut self, instructions: impl Into<Cow<'static, str>>) -> Self {
        self.config.instructions = Some(instructions.into());
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.max_concurrent_streams, DEFAULT_MAX_CONCURRENT_STREAMS);
        assert_eq!(config.max_datagram_size, MAX_DATAGRAM_PAYLOAD_SIZE);
        assert!(config.datagrams_supported);
    }

    #[test]
    fn test_select_encoding_prefers_client_order() {
        let config = SessionConfig::default();
        let prefs = vec!["cbor".to_string(), "json".to_string()];
        assert_eq!(config.select_encoding(Some(&prefs)), Some(Encoding::Cbor));
    }

    #[test]
    fn test_select_encoding_defaults_to_json() {
        let config = SessionConfig::default();
        assert_eq!(config.select_encoding(None), Some(Encoding::Json));
        assert_eq!(config.select_encoding(Some(&[])), Some(Encoding::Json));
    }

    #[test]
    fn test_select_encoding_skips_unknown() {
        let config = SessionConfig::default();
        let prefs = vec!["msgpack".to_string(), "json".to_string()];
        assert_eq!(config.select_encoding(Some(&prefs)), Some(Encoding::Json));
    }

    #[test]
    fn test_select_encoding_none_supported() {
        let config = SessionConfig::builder()
            .supported_encodings(vec![Encoding::Json])
            .build()
            .unwrap();
        let prefs = vec!["msgpack".to_string()];
        assert_eq!(config.select_encoding(Some(&prefs)), None);
    }

    #[test]
    fn test_builder_validation() {
        assert!(SessionConfig::builder().max_frame_size(0).build().is_err());
        assert!(
            SessionConfig::builder()
                .supported_encodings(vec![])
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::builder()
            .name("test-server")
            .version("0.1.0")
            .instructions("echo server")
            .build();

        assert_eq!(config.name, "test-server");
        assert_eq!(config.version, "0.1.0");
        assert!(config.instructions.is_some());
    }
}
