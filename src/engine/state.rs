//! Connection state machine for the analysis engine.

/// State of the engine connection.
///
/// Transitions:
/// - Disconnected -> Starting (on `start()`)
/// - Starting -> Ready (on `server.connected`)
/// - Starting -> Disconnected (handshake timeout or early EOF)
/// - Ready -> Degraded (fatal `server.error` or transport EOF)
/// - any -> Disconnected (on `stop()`)
/// - Degraded -> Starting (restart)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No engine running
    Disconnected,
    /// Launched, awaiting `server.connected`
    Starting,
    /// Handshake complete, accepting requests
    Ready,
    /// The engine failed; cached data is still served but may be stale
    Degraded,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }

    /// True while a transport is attached.
    pub fn is_running(self) -> bool {
        matches!(self, ConnectionState::Starting | ConnectionState::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Starting => "starting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ready_accepts_requests() {
        assert!(ConnectionState::Ready.is_ready());
        assert!(!ConnectionState::Starting.is_ready());
        assert!(!ConnectionState::Degraded.is_ready());
        assert!(!ConnectionState::Disconnected.is_ready());
    }

    #[test]
    fn running_states() {
        assert!(ConnectionState::Starting.is_running());
        assert!(ConnectionState::Ready.is_running());
        assert!(!ConnectionState::Degraded.is_running());
        assert!(!ConnectionState::Disconnected.is_running());
    }
}
