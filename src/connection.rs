//! A single established hub link.
//!
//! `HubLink` owns an open transport after the handshake and turns its raw
//! text into hub messages. `HubLink::run` drives the link until it ends,
//! serving commands from the channel and pushing notifications to a sink.

use crate::error::{ChannelError, Result};
use crate::hub::protocol::{encode_handshake, encode_ping, parse_handshake_response, HubMessage, RecordBuffer};
use crate::notification::Notification;
use crate::transport::{Transport, TransportKind};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Requests from the channel to the task driving a link
#[derive(Debug)]
pub enum LinkCommand {
    /// Pre-encoded record to write
    Send(String),
    /// Close the link; acknowledged once the transport is shut
    Close(oneshot::Sender<()>),
}

/// Why a link stopped running
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkExit {
    /// The channel asked for it
    Requested,
    /// Transport error, end of stream or server timeout
    Dropped(String),
    /// The server sent a Close message
    ServerClosed {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

/// Timing and routing for a running link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Invocation target carrying notifications (matched case-insensitively)
    pub event_name: String,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub server_timeout: Duration,
}

pub struct HubLink {
    transport: Box<dyn Transport>,
    records: RecordBuffer,
}

impl HubLink {
    /// Perform the hub handshake on a freshly opened transport.
    ///
    /// Records that arrive in the same chunk as the handshake response are
    /// kept and delivered by `next_message`. On failure the transport is
    /// closed before the error is returned.
    pub async fn handshake(transport: Box<dyn Transport>, timeout: Duration) -> Result<Self> {
        let mut link = Self {
            transport,
            records: RecordBuffer::new(),
        };

        match tokio::time::timeout(timeout, link.exchange_handshake()).await {
            Ok(Ok(())) => Ok(link),
            Ok(Err(e)) => {
                link.close_quietly().await;
                Err(e)
            }
            Err(_) => {
                link.close_quietly().await;
                Err(ChannelError::Handshake(format!(
                    "No handshake response within {:?}",
                    timeout
                )))
            }
        }
    }

    async fn exchange_handshake(&mut self) -> Result<()> {
        self.transport.send(encode_handshake()).await?;
        loop {
            if let Some(record) = self.records.next_record()? {
                return parse_handshake_response(&record);
            }
            match self.transport.receive().await? {
                Some(chunk) => self.records.extend(chunk.as_bytes()),
                None => {
                    return Err(ChannelError::Handshake(
                        "Connection closed before handshake response".to_string(),
                    ))
                }
            }
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Next decoded message, `None` when the server ended the stream.
    ///
    /// Cancel-safe: partial records stay buffered across calls. Records that
    /// fail to decode are logged and skipped.
    pub async fn next_message(&mut self) -> Result<Option<HubMessage>> {
        loop {
            while let Some(record) = self.records.next_record()? {
                match HubMessage::decode(&record) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => tracing::warn!("Skipping hub record: {}", e),
                }
            }
            match self.transport.receive().await? {
                Some(chunk) => self.records.extend(chunk.as_bytes()),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    async fn close_quietly(&mut self) {
        if let Err(e) = self.transport.close().await {
            tracing::debug!("Error closing {} transport: {}", self.kind(), e);
        }
    }

    /// Drive the link until it ends.
    ///
    /// Notifications for `settings.event_name` are decoded and handed to
    /// `on_notification`. A ping goes out whenever nothing was written for
    /// `keepalive_interval`; silence from the server for `server_timeout`
    /// counts as a drop.
    pub async fn run(
        &mut self,
        commands: &mut mpsc::Receiver<LinkCommand>,
        settings: &LinkSettings,
        on_notification: &(dyn Fn(Notification) + Send + Sync),
    ) -> LinkExit {
        let mut last_received = Instant::now();
        let mut next_ping = Instant::now() + settings.keepalive_interval;

        loop {
            let server_deadline = last_received + settings.server_timeout;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Send(record)) => {
                        match self.transport.send(record).await {
                            Ok(()) => next_ping = Instant::now() + settings.keepalive_interval,
                            Err(e) => tracing::warn!("Failed to send on {} link: {}", self.kind(), e),
                        }
                    }
                    Some(LinkCommand::Close(ack)) => {
                        if let Err(e) = self.close().await {
                            tracing::error!("Failed to close {} link: {}", self.kind(), e);
                        }
                        let _ = ack.send(());
                        return LinkExit::Requested;
                    }
                    None => {
                        self.close_quietly().await;
                        return LinkExit::Requested;
                    }
                },
                _ = tokio::time::sleep_until(next_ping) => {
                    if let Err(e) = self.transport.send(encode_ping()).await {
                        self.close_quietly().await;
                        return LinkExit::Dropped(format!("Keepalive failed: {}", e));
                    }
                    next_ping = Instant::now() + settings.keepalive_interval;
                }
                _ = tokio::time::sleep_until(server_deadline) => {
                    self.close_quietly().await;
                    return LinkExit::Dropped(format!(
                        "Nothing received from server for {:?}",
                        settings.server_timeout
                    ));
                }
                message = self.next_message() => {
                    last_received = Instant::now();
                    match message {
                        Ok(Some(HubMessage::Invocation { target, arguments, .. })) => {
                            if target.eq_ignore_ascii_case(&settings.event_name) {
                                deliver(arguments, on_notification);
                            } else {
                                tracing::debug!("No handler for hub method '{}'", target);
                            }
                        }
                        Ok(Some(HubMessage::Close { error, allow_reconnect })) => {
                            self.close_quietly().await;
                            return LinkExit::ServerClosed { error, allow_reconnect };
                        }
                        Ok(Some(HubMessage::Ping)) => {}
                        Ok(Some(other)) => tracing::trace!("Ignoring hub message {:?}", other),
                        Ok(None) => {
                            self.close_quietly().await;
                            return LinkExit::Dropped("Server ended the stream".to_string());
                        }
                        Err(e) => {
                            self.close_quietly().await;
                            return LinkExit::Dropped(e.to_string());
                        }
                    }
                }
            }
        }
    }
}

fn deliver(arguments: Vec<serde_json::Value>, on_notification: &(dyn Fn(Notification) + Send + Sync)) {
    let Some(payload) = arguments.into_iter().next() else {
        tracing::warn!("Notification invocation without arguments");
        return;
    };
    match Notification::from_value(payload) {
        Ok(notification) => on_notification(notification),
        Err(e) => tracing::warn!("Notification payload is not a JSON object: {}", e),
    }
}

/// Run `fut` unless a close request arrives first, in which case it is
/// acknowledged and `None` returned. Sends issued meanwhile are dropped.
pub async fn unless_closed<F: Future>(
    fut: F,
    commands: &mut mpsc::Receiver<LinkCommand>,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            output = &mut fut => return Some(output),
            command = commands.recv() => match command {
                Some(LinkCommand::Send(_)) => {
                    tracing::warn!("Dropping send while the link is down");
                }
                Some(LinkCommand::Close(ack)) => {
                    let _ = ack.send(());
                    return None;
                }
                None => return None,
            },
        }
    }
}
