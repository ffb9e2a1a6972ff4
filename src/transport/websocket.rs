//! WebSocket transport.

use super::{Transport, TransportKind};
use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

/// `http(s)://` -> `ws(s)://`, plus `access_token` for servers that cannot
/// read headers on the upgrade request
pub fn websocket_url(connection_url: &Url, token: &str) -> Result<Url> {
    let mut url = connection_url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChannelError::Config(format!(
                "Unsupported URL scheme for WebSockets: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::Config(format!("Cannot use scheme {} on {}", scheme, url)))?;
    url.query_pairs_mut().append_pair("access_token", token);
    Ok(url)
}

impl WebSocketTransport {
    pub async fn connect(connection_url: &Url, token: &str) -> Result<Self> {
        let url = websocket_url(connection_url, token)?;
        let mut request = url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ChannelError::Unauthorized("Token is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!("WebSocket connected ({})", response.status());

        Ok(Self {
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
    }

    async fn send(&mut self, data: String) -> Result<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.stream.send(Message::Text(data)).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8(data).map_err(|_| {
                        ChannelError::Protocol("Binary frame is not UTF-8 text".to_string())
                    })?;
                    return Ok(Some(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        tracing::debug!("WebSocket closed by server: {} {}", frame.code, frame.reason);
                    }
                    self.closed = true;
                    return Ok(None);
                }
                // Pongs are queued by tungstenite and flushed on the next write
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(e.into());
                }
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.close(None).await?;
        Ok(())
    }
}
