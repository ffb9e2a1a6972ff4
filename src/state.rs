//! Connection state of a notification channel.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link and no attempt in flight (initial, stopped, waiting for a
    /// retry, or given up)
    #[default]
    Disconnected,
    /// Initial connect in progress
    Connecting,
    Connected,
    /// An established link dropped and is being re-established
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// A link exists or is being re-established
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
