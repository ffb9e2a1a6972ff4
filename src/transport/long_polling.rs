//! Long polling transport.
//!
//! A background task issues back-to-back `GET`s; each `200` body carries zero
//! or more records, `204` means the server closed the connection. Sends are
//! `POST`s, close is a `DELETE`.

use super::{Transport, TransportKind};
use crate::error::{ChannelError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

const POLL_CHANNEL_SIZE: usize = 64;

/// Server holds a poll for up to ~100s; give it some headroom
const POLL_TIMEOUT: Duration = Duration::from_secs(120);

pub struct LongPollingTransport {
    client: reqwest::Client,
    url: Url,
    token: String,
    polls: mpsc::Receiver<Result<String>>,
    poller: JoinHandle<()>,
    closed: bool,
}

/// Poll URL with a cache-busting timestamp
fn poll_url(connection_url: &Url) -> Url {
    let mut url = connection_url.clone();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    url.query_pairs_mut().append_pair("_", &now.to_string());
    url
}

enum Poll {
    Data(String),
    Closed,
}

async fn poll_once(client: &reqwest::Client, connection_url: &Url, token: &str) -> Result<Poll> {
    let response = client
        .get(poll_url(connection_url))
        .bearer_auth(token)
        .timeout(POLL_TIMEOUT)
        .send()
        .await?;

    match response.status() {
        StatusCode::NO_CONTENT => Ok(Poll::Closed),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ChannelError::Unauthorized(
            format!("Poll returned {}", response.status()),
        )),
        status if status.is_success() => Ok(Poll::Data(response.text().await?)),
        status => Err(ChannelError::Transport(format!("Poll returned {}", status))),
    }
}

impl LongPollingTransport {
    /// The first poll must succeed before the transport counts as connected
    pub async fn connect(client: &reqwest::Client, connection_url: &Url, token: &str) -> Result<Self> {
        let first = match poll_once(client, connection_url, token).await? {
            Poll::Data(body) => body,
            Poll::Closed => {
                return Err(ChannelError::Transport(
                    "Server closed the connection on the first poll".to_string(),
                ))
            }
        };

        let (tx, polls) = mpsc::channel(POLL_CHANNEL_SIZE);
        let poll_client = client.clone();
        let poll_target = connection_url.clone();
        let poll_token = token.to_string();

        let poller = tokio::spawn(async move {
            if !first.is_empty() && tx.send(Ok(first)).await.is_err() {
                return;
            }
            loop {
                match poll_once(&poll_client, &poll_target, &poll_token).await {
                    Ok(Poll::Data(body)) => {
                        if body.is_empty() {
                            continue;
                        }
                        if tx.send(Ok(body)).await.is_err() {
                            return;
                        }
                    }
                    Ok(Poll::Closed) => {
                        tracing::debug!("Long polling ended by server");
                        return;
                    }
                    Err(ChannelError::Http(e)) if e.is_timeout() => {
                        tracing::trace!("Poll timed out, polling again");
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        Ok(Self {
            client: client.clone(),
            url: connection_url.clone(),
            token: token.to_string(),
            polls,
            poller,
            closed: false,
        })
    }
}

#[async_trait]
impl Transport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    async fn send(&mut self, data: String) -> Result<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
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
        self.polls.recv().await.transpose()
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.poller.abort();
        self.polls.close();

        let response = self
            .client
            .delete(self.url.clone())
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            return Err(ChannelError::Transport(format!(
                "Close returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl Drop for LongPollingTransport {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
