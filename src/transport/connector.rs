//! Opening a transport to the notification hub.

use super::{
    select_transports, LongPollingTransport, SseTransport, Transport, TransportFlags, TransportKind,
    WebSocketTransport,
};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::hub::negotiate::{negotiate, Negotiated};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Produces an open transport for a credential.
///
/// The channel calls this once per connection attempt with a freshly pulled
/// token. The hub handshake is performed by the caller on the returned
/// transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>>;
}

/// Negotiates with the hub and opens the first transport that works.
pub struct HubConnector {
    client: reqwest::Client,
    hub_url: Url,
    enabled: TransportFlags,
}

impl HubConnector {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, config.hub_url()?, config.transport_flags()))
    }

    pub fn with_client(client: reqwest::Client, hub_url: Url, enabled: TransportFlags) -> Self {
        Self {
            client,
            hub_url,
            enabled,
        }
    }

    async fn open(&self, kind: TransportKind, negotiated: &Negotiated) -> Result<Box<dyn Transport>> {
        let url = negotiated.connection_url();
        let token = negotiated.access_token.as_str();
        let transport: Box<dyn Transport> = match kind {
            TransportKind::WebSockets => Box::new(WebSocketTransport::connect(&url, token).await?),
            TransportKind::ServerSentEvents => {
                Box::new(SseTransport::connect(&self.client, &url, token).await?)
            }
            TransportKind::LongPolling => {
                Box::new(LongPollingTransport::connect(&self.client, &url, token).await?)
            }
        };
        Ok(transport)
    }
}

#[async_trait]
impl Connector for HubConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>> {
        let mut negotiated = negotiate(&self.client, &self.hub_url, token).await?;
        let candidates = select_transports(&negotiated.transports, self.enabled);
        if candidates.is_empty() {
            return Err(ChannelError::NoTransport(format!(
                "server offers {:?}, client allows {:?}",
                negotiated.transports, self.enabled
            )));
        }

        let mut failures = Vec::new();
        for (index, kind) in candidates.iter().enumerate() {
            // A connection token is single use; fetch a new one for each fallback
            if index > 0 {
                negotiated = negotiate(&self.client, &self.hub_url, token).await?;
            }
            match self.open(*kind, &negotiated).await {
                Ok(transport) => {
                    tracing::info!("Connected to {} using {}", self.hub_url, kind);
                    return Ok(transport);
                }
                Err(ChannelError::Unauthorized(msg)) => {
                    return Err(ChannelError::Unauthorized(msg));
                }
                Err(e) => {
                    tracing::warn!("{} transport failed: {}", kind, e);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }

        Err(ChannelError::NoTransport(failures.join("; ")))
    }
}
