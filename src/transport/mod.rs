//! Transports carrying hub records.
//!
//! Preference order is fixed: WebSockets, then Server-Sent Events, then Long
//! Polling. A transport is only tried when the server offers it and the
//! configuration enables it.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod connector;
pub mod long_polling;
pub mod sse;
pub mod websocket;

pub use connector::{Connector, HubConnector};
pub use long_polling::LongPollingTransport;
pub use sse::{SseParser, SseTransport};
pub use websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    /// All transports in preference order
    pub const ALL: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    /// Wire name used by negotiate responses
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::WebSockets => "WebSockets",
            TransportKind::ServerSentEvents => "ServerSentEvents",
            TransportKind::LongPolling => "LongPolling",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }

    pub fn flag(&self) -> TransportFlags {
        match self {
            TransportKind::WebSockets => TransportFlags::WEB_SOCKETS,
            TransportKind::ServerSentEvents => TransportFlags::SERVER_SENT_EVENTS,
            TransportKind::LongPolling => TransportFlags::LONG_POLLING,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags::bitflags! {
    /// Set of enabled transports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransportFlags: u8 {
        const WEB_SOCKETS = 1 << 0;
        const SERVER_SENT_EVENTS = 1 << 1;
        const LONG_POLLING = 1 << 2;
    }
}

/// Transports to try, in preference order: offered by the server and enabled locally.
pub fn select_transports(offered: &[TransportKind], enabled: TransportFlags) -> Vec<TransportKind> {
    TransportKind::ALL
        .into_iter()
        .filter(|kind| enabled.contains(kind.flag()) && offered.contains(kind))
        .collect()
}

/// An open transport. Carries raw text; record framing is the hub layer's job.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn send(&mut self, data: String) -> Result<()>;

    /// Next chunk of text from the server, `None` once the server ended the
    /// stream. Must be cancel-safe: dropping the future loses no data.
    async fn receive(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}
