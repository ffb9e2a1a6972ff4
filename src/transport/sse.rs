//! Server-Sent Events transport.
//!
//! Receives over a long-lived `GET` with `Accept: text/event-stream`; sends
//! each record with a separate `POST` to the same URL. A background task
//! reads the event stream so [`Transport::receive`] stays cancel-safe.

use super::{Transport, TransportKind};
use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Incremental `text/event-stream` parser yielding the `data` of each event.
#[derive(Debug, Default)]
pub struct SseParser {
    line: String,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the events it completed
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut events = Vec::new();
        for c in chunk.chars() {
            if c != '\n' {
                self.line.push(c);
                continue;
            }
            let line = std::mem::take(&mut self.line);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Comments (":...") and other fields carry nothing the hub uses
        }
        events
    }
}

/// Drain the decodable prefix of `pending`, keeping an incomplete trailing
/// character for the next chunk
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(text) => text.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
    pending.drain(..valid);
    text
}

pub struct SseTransport {
    client: reqwest::Client,
    url: Url,
    token: String,
    events: mpsc::Receiver<Result<String>>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    pub async fn connect(client: &reqwest::Client, connection_url: &Url, token: &str) -> Result<Self> {
        let response = client
            .get(connection_url.clone())
            .bearer_auth(token)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ChannelError::Unauthorized(format!(
                    "Event stream returned {}",
                    response.status()
                )))
            }
            status if !status.is_success() => {
                return Err(ChannelError::Transport(format!(
                    "Event stream returned {}",
                    status
                )))
            }
            _ => {}
        }

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::new();
            let mut pending = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                pending.extend_from_slice(&chunk);
                for event in parser.push(&take_utf8(&mut pending)) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!("Event stream ended");
        });

        Ok(Self {
            client: client.clone(),
            url: connection_url.clone(),
            token: token.to_string(),
            events,
            reader,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
    }

    async fn send(&mut self, data: String) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.token)
            .body(data)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChannelError::Transport(format!(
                "Send returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        self.events.recv().await.transpose()
    }

    async fn close(&mut self) -> Result<()> {
        self.reader.abort();
        self.events.close();
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
