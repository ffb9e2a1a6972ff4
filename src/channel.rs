//! The notification channel facade.
//!
//! One `NotificationChannel` owns at most one live hub link. It decides when
//! to connect, retries failed initial connects with exponential backoff,
//! re-establishes dropped links on a fixed schedule, and fans notifications
//! out to subscribed callbacks.
//!
//! All mutable state sits behind a single `std::sync::Mutex` that is never
//! held across an `.await`. Every connection attempt bumps a generation
//! counter; async completions compare the generation they captured with the
//! current one and discard their result when it moved on (the channel was
//! stopped or restarted meanwhile).

use crate::backoff::{LiveReconnectSchedule, ReconnectController, ReconnectPolicy};
use crate::clock::{Clock, TokioClock};
use crate::config::ChannelConfig;
use crate::connection::{unless_closed, HubLink, LinkCommand, LinkExit, LinkSettings};
use crate::credentials::TokenSource;
use crate::error::{ChannelError, Result};
use crate::hub::protocol::encode_invocation;
use crate::notification::{Notification, NotificationCallback};
use crate::registry::{dispatch, CallbackRegistry};
use crate::state::ConnectionState;
use crate::transport::{Connector, HubConnector};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How long `stop()` waits for the link task to acknowledge a close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings the channel needs at runtime, resolved from [`ChannelConfig`]
#[derive(Debug, Clone)]
struct ChannelSettings {
    link: LinkSettings,
    test_method: String,
    policy: ReconnectPolicy,
    live_schedule: LiveReconnectSchedule,
    command_buffer: usize,
}

impl From<&ChannelConfig> for ChannelSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            link: LinkSettings {
                event_name: config.event_name.clone(),
                handshake_timeout: config.handshake_timeout(),
                keepalive_interval: config.keepalive_interval(),
                server_timeout: config.server_timeout(),
            },
            test_method: config.test_method.clone(),
            policy: config.reconnect_policy(),
            live_schedule: config.live_reconnect_schedule(),
            command_buffer: config.command_buffer,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Configures a [`NotificationChannel`]; created by [`NotificationChannel::builder`]
pub struct NotificationChannelBuilder {
    config: ChannelConfig,
    tokens: Arc<dyn TokenSource>,
    connector: Option<Arc<dyn Connector>>,
    clock: Option<Arc<dyn Clock>>,
}

impl NotificationChannelBuilder {
    /// Replace the default [`HubConnector`]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the default [`TokioClock`] used for retry delays
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config and create the channel. No connection is opened yet.
    pub fn build(self) -> Result<NotificationChannel> {
        self.config.validate()?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(HubConnector::new(&self.config)?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let settings = ChannelSettings::from(&self.config);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Shared {
            state: ConnectionState::Disconnected,
            is_connecting: false,
            retry_scheduled: false,
            exhausted: false,
            generation: 0,
            controller: ReconnectController::new(settings.policy),
            registry: CallbackRegistry::new(),
            link: None,
        };

        Ok(NotificationChannel {
            inner: Arc::new(Inner {
                settings,
                tokens: self.tokens,
                connector,
                clock,
                shared: Mutex::new(shared),
                state_tx,
            }),
        })
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Shared {
    state: ConnectionState,
    /// An initial connect attempt is in flight
    is_connecting: bool,
    /// A backoff retry is sleeping
    retry_scheduled: bool,
    /// Retries or live reconnects ran out; only an explicit start connects again
    exhausted: bool,
    generation: u64,
    controller: ReconnectController,
    registry: CallbackRegistry,
    link: Option<LinkHandle>,
}

/// Handle to the task driving the live link
struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
    task: JoinHandle<()>,
}

impl LinkHandle {
    /// Ask the link task to close and wait for it; abort it if it does not answer
    async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            if self.commands.send(LinkCommand::Close(ack_tx)).await.is_ok() {
                // Err means the task ended without acknowledging, which is fine
                let _ = ack_rx.await;
            }
        })
        .await;

        if closed.is_err() {
            tracing::error!("Notification link did not close within {:?}, aborting", CLOSE_TIMEOUT);
            self.task.abort();
        }
    }
}

/// What started a connection attempt
#[derive(Debug, Clone, Copy)]
enum Trigger {
    /// `init()` or `start()`
    Explicit,
    /// A callback was registered while disconnected
    Subscribe,
    /// A backoff timer scheduled by the attempt of this generation
    Retry(u64),
}

/// A connection attempt that passed its preconditions
struct Attempt {
    generation: u64,
    token: String,
}

enum Outcome {
    Done,
    Retry { generation: u64, delay: Duration },
}

struct Inner {
    settings: ChannelSettings,
    tokens: Arc<dyn TokenSource>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state != state {
            tracing::debug!("Notification channel {} -> {}", shared.state, state);
            shared.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Check preconditions and claim a new attempt. Runs under the lock so
    /// concurrent triggers start at most one attempt.
    fn begin_attempt(&self, shared: &mut Shared, trigger: Trigger) -> Option<Attempt> {
        if let Trigger::Retry(generation) = trigger {
            if shared.generation != generation {
                tracing::debug!("Discarding retry from a superseded attempt");
                return None;
            }
            shared.retry_scheduled = false;
        }

        if shared.is_connecting || shared.state.is_live() || shared.link.is_some() {
            tracing::debug!("Notification channel already {}, not starting", shared.state);
            return None;
        }

        match trigger {
            Trigger::Explicit => {
                shared.exhausted = false;
                if shared.controller.is_exhausted() {
                    shared.controller.reset();
                }
            }
            Trigger::Subscribe => {
                if shared.exhausted || shared.retry_scheduled {
                    return None;
                }
            }
            Trigger::Retry(_) => {}
        }

        let Some(token) = self.tokens.token() else {
            tracing::warn!("No credential available, notification channel stays disconnected");
            return None;
        };

        shared.generation += 1;
        shared.is_connecting = true;
        shared.retry_scheduled = false;
        self.set_state(shared, ConnectionState::Connecting);
        Some(Attempt {
            generation: shared.generation,
            token,
        })
    }

    /// Open a transport and complete the hub handshake on it
    async fn establish(&self, token: &str) -> Result<HubLink> {
        let transport = self.connector.connect(token).await?;
        HubLink::handshake(transport, self.settings.link.handshake_timeout).await
    }

    async fn attempt(self: &Arc<Self>, attempt: Attempt) -> Outcome {
        match self.establish(&attempt.token).await {
            Ok(link) => {
                self.accept_connection(attempt.generation, link).await;
                Outcome::Done
            }
            Err(e) => self.fail_attempt(attempt.generation, &e),
        }
    }

    /// Run an attempt and any retries it schedules
    async fn run_attempt(self: Arc<Self>, attempt: Attempt) {
        if let Outcome::Retry { generation, delay } = self.attempt(attempt).await {
            self.retry_after(generation, delay).await;
        }
    }

    async fn retry_after(self: Arc<Self>, mut generation: u64, mut delay: Duration) {
        loop {
            self.clock.sleep(delay).await;
            let attempt = {
                let mut shared = self.lock();
                self.begin_attempt(&mut shared, Trigger::Retry(generation))
            };
            let Some(attempt) = attempt else { return };
            generation = attempt.generation;
            match self.attempt(attempt).await {
                Outcome::Done => return,
                Outcome::Retry { delay: next, .. } => delay = next,
            }
        }
    }

    /// Install a freshly connected link, or close it if the attempt went stale
    async fn accept_connection(self: &Arc<Self>, generation: u64, link: HubLink) {
        let kind = link.kind();
        let orphan = {
            let mut shared = self.lock();
            if shared.generation != generation {
                Some(link)
            } else {
                shared.is_connecting = false;
                shared.exhausted = false;
                shared.controller.reset();
                let drained = shared.registry.drain_pending();
                self.set_state(&mut shared, ConnectionState::Connected);

                let (commands, rx) = mpsc::channel(self.settings.command_buffer);
                let task = tokio::spawn(self.clone().supervise(generation, link, rx));
                shared.link = Some(LinkHandle { commands, task });
                tracing::info!(
                    "Notification channel connected via {} ({} queued subscriber(s) attached)",
                    kind,
                    drained
                );
                None
            }
        };

        if let Some(mut link) = orphan {
            tracing::debug!("Closing {} link from a superseded attempt", kind);
            if let Err(e) = link.close().await {
                tracing::error!("Failed to close superseded {} link: {}", kind, e);
            }
        }
    }

    /// Record a failed initial connect and decide whether to retry
    fn fail_attempt(&self, generation: u64, err: &ChannelError) -> Outcome {
        let mut shared = self.lock();
        if shared.generation != generation {
            tracing::debug!("Ignoring failure of a superseded attempt: {}", err);
            return Outcome::Done;
        }
        shared.is_connecting = false;
        self.set_state(&mut shared, ConnectionState::Disconnected);

        let max_attempts = shared.controller.policy().max_attempts;
        match shared.controller.next_delay() {
            Some(delay) => {
                shared.retry_scheduled = true;
                let attempt = shared.controller.attempts();
                if err.is_transient() {
                    tracing::warn!(
                        "Notification channel connect failed: {}; retrying in {:?} ({}/{})",
                        err,
                        delay,
                        attempt,
                        max_attempts
                    );
                } else {
                    tracing::error!(
                        "Notification channel rejected: {}; retrying in {:?} ({}/{})",
                        err,
                        delay,
                        attempt,
                        max_attempts
                    );
                }
                Outcome::Retry { generation, delay }
            }
            None => {
                shared.exhausted = true;
                tracing::error!(
                    "Notification channel connect failed: {}; giving up after {} retries",
                    err,
                    max_attempts
                );
                Outcome::Done
            }
        }
    }

    /// Fan a notification out to the attached callbacks, outside the lock
    fn deliver(&self, generation: u64, notification: Notification) {
        let callbacks = {
            let shared = self.lock();
            if shared.generation != generation {
                return;
            }
            shared.registry.snapshot()
        };
        dispatch(&callbacks, &notification);
    }

    /// Drive the live link, re-establishing it when it drops
    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        mut link: HubLink,
        mut commands: mpsc::Receiver<LinkCommand>,
    ) {
        loop {
            let exit = link
                .run(&mut commands, &self.settings.link, &|notification| {
                    self.deliver(generation, notification)
                })
                .await;

            let reason = match exit {
                LinkExit::Requested => return,
                LinkExit::ServerClosed {
                    error,
                    allow_reconnect: false,
                } => {
                    let reason = error.unwrap_or_else(|| "no reason given".to_string());
                    self.give_up(generation, &format!("server closed the connection: {}", reason));
                    return;
                }
                LinkExit::ServerClosed { error, .. } => {
                    error.unwrap_or_else(|| "server closed the connection".to_string())
                }
                LinkExit::Dropped(reason) => reason,
            };

            match self.reconnect(generation, &reason, &mut commands).await {
                Some(next) => link = next,
                None => return,
            }
        }
    }

    /// Walk the live reconnect schedule. Returns the new link, or `None` when
    /// the channel was stopped or the schedule ran out.
    async fn reconnect(
        &self,
        generation: u64,
        reason: &str,
        commands: &mut mpsc::Receiver<LinkCommand>,
    ) -> Option<HubLink> {
        {
            let mut shared = self.lock();
            if shared.generation != generation {
                return None;
            }
            self.set_state(&mut shared, ConnectionState::Reconnecting);
        }
        tracing::warn!("Notification link lost: {}; reconnecting", reason);

        let schedule = &self.settings.live_schedule;
        for index in 0..schedule.len() {
            let delay = schedule.delay(index).unwrap_or_default();
            unless_closed(self.clock.sleep(delay), commands).await?;
            if !self.is_current(generation) {
                return None;
            }

            let Some(token) = self.tokens.token() else {
                self.give_up(generation, "credential no longer available");
                return None;
            };

            match unless_closed(self.establish(&token), commands).await? {
                Ok(mut link) => {
                    let accepted = {
                        let mut shared = self.lock();
                        if shared.generation == generation {
                            shared.controller.reset();
                            let drained = shared.registry.drain_pending();
                            self.set_state(&mut shared, ConnectionState::Connected);
                            tracing::info!(
                                "Notification link re-established via {} ({} queued subscriber(s) attached)",
                                link.kind(),
                                drained
                            );
                            true
                        } else {
                            false
                        }
                    };
                    if accepted {
                        return Some(link);
                    }
                    if let Err(e) = link.close().await {
                        tracing::error!("Failed to close superseded {} link: {}", link.kind(), e);
                    }
                    return None;
                }
                Err(e) => {
                    tracing::warn!(
                        "Reconnect attempt {}/{} failed: {}",
                        index + 1,
                        schedule.len(),
                        e
                    );
                }
            }
        }

        self.give_up(generation, "reconnect attempts exhausted");
        None
    }

    /// Terminal disconnect of the current link
    fn give_up(&self, generation: u64, reason: &str) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }
        shared.link = None;
        shared.exhausted = true;
        self.set_state(&mut shared, ConnectionState::Disconnected);
        tracing::error!("Notification channel disconnected: {}", reason);
    }
}

// =============================================================================
// Facade
// =============================================================================

/// Live notification channel. Cheap to clone; clones share one connection.
///
/// Create one per process with [`NotificationChannel::builder`], register
/// callbacks with [`on_notification`](Self::on_notification) and call
/// [`stop`](Self::stop) on logout or shutdown.
#[derive(Clone)]
pub struct NotificationChannel {
    inner: Arc<Inner>,
}

impl NotificationChannel {
    pub fn builder(config: ChannelConfig, tokens: Arc<dyn TokenSource>) -> NotificationChannelBuilder {
        NotificationChannelBuilder {
            config,
            tokens,
            connector: None,
            clock: None,
        }
    }

    /// Start connecting in the background. Returns immediately; a no-op when
    /// a connection exists or is being made, or when no credential is
    /// available. Must be called inside a tokio runtime.
    pub fn init(&self) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("init() called outside a tokio runtime, not connecting");
            return;
        };
        let attempt = {
            let mut shared = self.inner.lock();
            self.inner.begin_attempt(&mut shared, Trigger::Explicit)
        };
        if let Some(attempt) = attempt {
            runtime.spawn(self.inner.clone().run_attempt(attempt));
        }
    }

    /// Connect and wait for the first attempt to finish. A failed attempt
    /// schedules its retries in the background; nothing is returned to the
    /// caller, check [`state`](Self::state) instead.
    pub async fn start(&self) {
        let attempt = {
            let mut shared = self.inner.lock();
            self.inner.begin_attempt(&mut shared, Trigger::Explicit)
        };
        let Some(attempt) = attempt else { return };
        if let Outcome::Retry { generation, delay } = self.inner.attempt(attempt).await {
            tokio::spawn(self.inner.clone().retry_after(generation, delay));
        }
    }

    /// Register a callback for every future notification.
    ///
    /// When connected the callback is attached right away. Otherwise it is
    /// queued until the next successful connect, and a connect is started if
    /// none is underway.
    pub fn on_notification<F>(&self, callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(callback));
    }

    pub fn subscribe(&self, callback: NotificationCallback) {
        let runtime = Handle::try_current().ok();
        let attempt = {
            let mut shared = self.inner.lock();
            if shared.state == ConnectionState::Connected {
                shared.registry.attach(callback);
                return;
            }
            shared.registry.queue(callback);
            match runtime {
                Some(_) => self.inner.begin_attempt(&mut shared, Trigger::Subscribe),
                None => None,
            }
        };

        match (attempt, runtime) {
            (Some(attempt), Some(runtime)) => {
                runtime.spawn(self.inner.clone().run_attempt(attempt));
            }
            (_, None) => {
                tracing::warn!("Callback queued outside a tokio runtime; call init() to connect");
            }
            _ => {}
        }
    }

    /// Disconnect and forget all callbacks. Never fails; safe to call twice.
    pub async fn stop(&self) {
        let link = {
            let mut shared = self.inner.lock();
            shared.generation += 1;
            shared.is_connecting = false;
            shared.retry_scheduled = false;
            shared.exhausted = false;
            shared.controller.reset();
            shared.registry.clear();
            self.inner.set_state(&mut shared, ConnectionState::Disconnected);
            shared.link.take()
        };
        if let Some(link) = link {
            link.shutdown().await;
            tracing::info!("Notification channel stopped");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Consecutive failed initial connects since the last success or stop
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().controller.attempts()
    }

    /// Callbacks waiting for the next connect
    pub fn pending_callbacks(&self) -> usize {
        self.inner.lock().registry.pending_len()
    }

    /// Callbacks receiving notifications on the live link
    pub fn attached_callbacks(&self) -> usize {
        self.inner.lock().registry.attached_len()
    }

    /// Invoke a hub method. Fire and forget: dropped with a warning when not
    /// connected, and write failures are only logged.
    pub async fn send(&self, target: &str, arguments: Vec<Value>) {
        let commands = {
            let shared = self.inner.lock();
            match (&shared.link, shared.state) {
                (Some(link), ConnectionState::Connected) => link.commands.clone(),
                (_, state) => {
                    tracing::warn!("Cannot invoke '{}' while {}, dropped", target, state);
                    return;
                }
            }
        };

        let record = match encode_invocation(target, &arguments) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Cannot encode invocation of '{}': {}", target, e);
                return;
            }
        };
        if commands.send(LinkCommand::Send(record)).await.is_err() {
            tracing::warn!("Notification link closed before '{}' was sent", target);
        }
    }

    /// Ask the hub to push a test notification back to this client
    pub async fn send_test_notification(&self) {
        let method = self.inner.settings.test_method.clone();
        self.send(&method, Vec::new()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticToken;
    use crate::transport::Transport;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _token: &str) -> Result<Box<dyn Transport>> {
            Err(ChannelError::Transport("connection refused".to_string()))
        }
    }

    fn channel(tokens: StaticToken) -> NotificationChannel {
        NotificationChannel::builder(ChannelConfig::default(), Arc::new(tokens))
            .connector(Arc::new(Unreachable))
            .build()
            .unwrap()
    }

    #[test]
    fn test_subscribe_without_runtime_queues() {
        let channel = channel(StaticToken::new("jwt"));
        channel.on_notification(|_| {});
        assert_eq!(channel.pending_callbacks(), 1);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_credential_is_noop() {
        let channel = channel(StaticToken::none());
        channel.start().await;
        channel.init();
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(channel.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let channel = channel(StaticToken::new("jwt"));
        channel.send_test_notification().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let channel = channel(StaticToken::new("jwt"));
        channel.stop().await;
        channel.stop().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = ChannelConfig::new("::not a url::");
        let result = NotificationChannel::builder(config, Arc::new(StaticToken::new("jwt"))).build();
        assert!(result.is_err());
    }
}
