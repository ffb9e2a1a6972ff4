//! In-memory hub for channel tests.
//!
//! `MockHub` is a `Connector` that follows a script of outcomes, one per
//! connect call. Accepted connections get a `MockTransport` that answers the
//! handshake on its own; the test drives the server side through the
//! matching `ServerHandle`.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use vet_notify::error::{ChannelError, Result};
use vet_notify::{Clock, Connector, Transport, TransportKind};

const RS: char = '\u{1e}';

pub enum Step {
    Accept,
    Fail(&'static str),
    /// Accept once the notify fires
    Gated(Arc<Notify>),
}

enum ServerEvent {
    Chunk(String),
    Fail(String),
}

pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<ServerEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
    }

    async fn send(&mut self, data: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        match self.incoming.recv().await {
            Some(ServerEvent::Chunk(chunk)) => Ok(Some(chunk)),
            Some(ServerEvent::Fail(reason)) => Err(ChannelError::Transport(reason)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Server side of one accepted connection
#[derive(Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<ServerEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ServerHandle {
    pub fn push_notification(&self, payload: Value) {
        let invocation = json!({
            "type": 1,
            "target": "ReceiveNotification",
            "arguments": [payload],
        });
        let _ = self.events.send(ServerEvent::Chunk(format!("{}{}", invocation, RS)));
    }

    pub fn push_message(&self, message: &str) {
        let _ = self.events.send(ServerEvent::Chunk(message.to_string()));
    }

    /// Simulate a network failure
    pub fn drop_link(&self) {
        let _ = self.events.send(ServerEvent::Fail("connection reset".to_string()));
    }

    /// Send a hub Close message
    pub fn close_hub(&self, allow_reconnect: bool) {
        let close = json!({ "type": 7, "error": "server shutting down", "allowReconnect": allow_reconnect });
        let _ = self.events.send(ServerEvent::Chunk(format!("{}{}", close, RS)));
    }

    /// Records written by the client, handshake included
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Scripted connector. An exhausted script fails every further connect.
#[derive(Default)]
pub struct MockHub {
    script: Mutex<VecDeque<Step>>,
    tokens: Mutex<Vec<String>>,
    servers: Mutex<Vec<ServerHandle>>,
}

impl MockHub {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Number of connect calls so far
    pub fn connects(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// Token passed to each connect call, in order
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn server(&self, index: usize) -> ServerHandle {
        self.servers.lock().unwrap()[index].clone()
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }

    fn open(&self) -> Box<dyn Transport> {
        let (events, incoming) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let _ = events.send(ServerEvent::Chunk(format!("{{}}{}", RS)));

        self.servers.lock().unwrap().push(ServerHandle {
            events,
            sent: sent.clone(),
            closed: closed.clone(),
        });
        Box::new(MockTransport {
            incoming,
            sent,
            closed,
        })
    }
}

#[async_trait]
impl Connector for MockHub {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>> {
        self.tokens.lock().unwrap().push(token.to_string());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Accept) => Ok(self.open()),
            Some(Step::Gated(gate)) => {
                gate.notified().await;
                Ok(self.open())
            }
            Some(Step::Fail(reason)) => Err(ChannelError::Transport(reason.to_string())),
            None => Err(ChannelError::Transport("hub unreachable".to_string())),
        }
    }
}

/// Records every requested delay and returns at once
#[derive(Default)]
pub struct RecordingClock {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delays_ms(&self) -> Vec<u128> {
        self.delays.lock().unwrap().iter().map(|d| d.as_millis()).collect()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Poll `condition` until it holds, failing the test after a few seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let spawned tasks run for a moment
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
