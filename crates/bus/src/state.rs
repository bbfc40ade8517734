//! Connection state tracking for the bus link.
//!
//! The network thread maintains a `LinkState` that the application can
//! inspect for logging and tests. Transitions are driven by the session
//! lifecycle: `Disconnected -> Connecting -> Connected`, with `Lost` entered
//! on any session failure until the automatic reconnect restores the link.

use std::fmt;

/// Current state of the bus link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// No session and no attempt in flight. Initial state before `connect()`.
    Disconnected,

    /// CONNECT sent, waiting for the broker's CONNACK.
    Connecting,

    /// Session established; publishes and subscriptions are live.
    Connected,

    /// Session was lost. The reason is kept for diagnostics; the network
    /// thread keeps retrying with backoff until the session is restored.
    Lost(String),
}

impl LinkState {
    /// Short identifier for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "Disconnected",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Lost(_) => "Lost",
        }
    }

    /// True only when the session is established.
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        if let LinkState::Lost(reason) = self {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_str_covers_all_states() {
        assert_eq!(LinkState::Disconnected.as_str(), "Disconnected");
        assert_eq!(LinkState::Connecting.as_str(), "Connecting");
        assert_eq!(LinkState::Connected.as_str(), "Connected");
        assert_eq!(LinkState::Lost("timeout".into()).as_str(), "Lost");
    }

    #[test]
    fn display_appends_loss_reason() {
        assert_eq!(LinkState::Connected.to_string(), "Connected");
        assert_eq!(
            LinkState::Lost("broker closed".into()).to_string(),
            "Lost (broker closed)"
        );
    }

    #[test]
    fn only_connected_counts_as_connected() {
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(!LinkState::Disconnected.is_connected());
        assert!(!LinkState::Lost("x".into()).is_connected());
    }
}
