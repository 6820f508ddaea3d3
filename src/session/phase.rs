//! Session lifecycle state machine.

use parking_lot::RwLock;

use crate::error::{ProtocolError, ProtocolResult};

/// Phase of one MCP-Flow session.
///
/// CLOSED -> CONNECTED -> CONTROL_STREAM_OPENED -> INITIALIZING -> READY
/// -> DRAINING -> CLOSED, with CLOSED reachable from anywhere on fatal
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No transport session, or the session has terminated.
    Closed,
    /// Transport session established, Control Stream not yet open.
    Connected,
    /// Control Stream accepted, awaiting the `initialize` frame.
    ControlStreamOpened,
    /// `initialize` received, response not yet written.
    Initializing,
    /// Fully operational; frames decode under the negotiated encoding.
    Ready,
    /// `$/shutdown` observed; in-flight work completes, nothing new starts.
    Draining,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Connected => "connected",
            Self::ControlStreamOpened => "control-stream-opened",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Shared, guarded phase value.
pub struct PhaseCell {
    phase: RwLock<SessionPhase>,
}

impl PhaseCell {
    pub fn new() -> Self {
        Self {
            phase: RwLock::new(SessionPhase::Closed),
        }
    }

    pub fn current(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub fn is_draining(&self) -> bool {
        self.current() == SessionPhase::Draining
    }

    /// Transport session established.
    pub fn on_session_established(&self) -> ProtocolResult<()> {
        self.transition(SessionPhase::Closed, SessionPhase::Connected)
    }

    /// The one Control Stream accepted.
    pub fn on_control_stream_opened(&self) -> ProtocolResult<()> {
        self.transition(SessionPhase::Connected, SessionPhase::ControlStreamOpened)
    }

    /// First frame arrived and was a JSON `initialize` request.
    pub fn on_initialize_received(&self) -> ProtocolResult<()> {
        self.transition(SessionPhase::ControlStreamOpened, SessionPhase::Initializing)
    }

    /// The `initialize` response was written; encoding switches here.
    pub fn on_initialize_responded(&self) -> ProtocolResult<()> {
        self.transition(SessionPhase::Initializing, SessionPhase::Ready)
    }

    /// `$/shutdown` received or sent.
    pub fn on_shutdown(&self) -> ProtocolResult<()> {
        self.transition(SessionPhase::Ready, SessionPhase::Draining)
    }

    /// Terminal: clean close, transport error, or fatal protocol error.
    pub fn on_closed(&self) {
        *self.phase.write() = SessionPhase::Closed;
    }

    fn transition(&self, from: SessionPhase, to: SessionPhase) -> ProtocolResult<()> {
        let mut phase = self.phase.write();
        if *phase != from {
            return Err(ProtocolError::InvalidRequest(
                format!("illegal in session phase '{}'", phase).into(),
            ));
        }
        *phase = to;
        Ok(())
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = PhaseCell::new();
        assert_eq!(cell.current(), SessionPhase::Closed);

        cell.on_session_established().unwrap();
        cell.on_control_stream_opened().unwrap();
        cell.on_initialize_received().unwrap();
        cell.on_initialize_responded().unwrap();
        assert_eq!(cell.current(), SessionPhase::Ready);

        cell.on_shutdown().unwrap();
        assert!(cell.is_draining());

        cell.on_closed();
        assert_eq!(cell.current(), SessionPhase::Closed);
    }

    #[test]
    fn test_initialize_only_once() {
        let cell = PhaseCell::new();
        cell.on_session_established().unwrap();
        cell.on_control_stream_opened().unwrap();
        cell.on_initialize_received().unwrap();
        cell.on_initialize_responded().unwrap();

        let err = cell.on_initialize_received().unwrap_err();
        assert_eq!(err.code(), -32600);
    }

    #[test]
    fn test_shutdown_requires_ready() {
        let cell = PhaseCell::new();
        cell.on_session_established().unwrap();
        assert!(cell.on_shutdown().is_err());
    }

    #[test]
    fn test_close_from_anywhere() {
        let cell = PhaseCell::new();
        cell.on_session_established().unwrap();
        cell.on_control_stream_opened().unwrap();
        cell.on_closed();
        assert_eq!(cell.current(), SessionPhase::Closed);
    }
}
