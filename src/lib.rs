//! Live notification channel for the veterinary practice backend.
//!
//! Holds one long-lived connection to the backend's notification hub,
//! negotiating the best available transport (WebSockets, Server-Sent Events,
//! long polling). Callers register callbacks and receive every notification
//! the server pushes:
//!
//! ```no_run
//! use std::sync::Arc;
//! use vet_notify::{ChannelConfig, NotificationChannel, StaticToken};
//!
//! # async fn run() -> vet_notify::Result<()> {
//! let config = ChannelConfig::new("https://clinic.example.com/api");
//! let channel = NotificationChannel::builder(config, Arc::new(StaticToken::new("jwt"))).build()?;
//! channel.on_notification(|n| println!("{}", n));
//! channel.init();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod channel;
pub mod clock;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod notification;
pub mod registry;
pub mod state;
pub mod transport;

pub use backoff::{LiveReconnectSchedule, ReconnectController, ReconnectPolicy};
pub use channel::{NotificationChannel, NotificationChannelBuilder};
pub use clock::{Clock, TokioClock};
pub use config::ChannelConfig;
pub use credentials::{EnvToken, SessionCookies, StaticToken, TokenSource};
pub use error::{ChannelError, Result};
pub use notification::{Notification, NotificationCallback};
pub use state::ConnectionState;
pub use transport::{Connector, HubConnector, Transport, TransportKind};
