//! Error types for the notification channel.
//!
//! These never reach UI callers of [`crate::NotificationChannel`]; the channel
//! turns them into log records. Transport, negotiation and config code return
//! them so failures can be classified before they are logged.

use thiserror::Error;

/// Result type for channel internals
pub type Result<T> = std::result::Result<T, ChannelError>;

#[derive(Error, Debug)]
pub enum ChannelError {
    /// Negotiate request failed or returned an unusable response
    #[error("Negotiation failed: {0}")]
    Negotiate(String),

    /// Hub handshake rejected or timed out
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Transport-level failure after the connection was established
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed hub message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// None of the offered transports could be started
    #[error("No usable transport: {0}")]
    NoTransport(String),

    /// Server refused the credential
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Operation on a link that has already been closed
    #[error("Connection closed")]
    Closed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for ChannelError {
    fn from(err: toml::de::Error) -> Self {
        ChannelError::Config(err.to_string())
    }
}

impl ChannelError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Used only to pick the log level; the retry policy itself retries every
    /// failure up to the attempt limit.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ChannelError::Unauthorized(_) | ChannelError::Config(_) | ChannelError::Url(_)
        )
    }
}
