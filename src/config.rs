//! Channel configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! api_base = "https://clinic.example.com/api"
//! transports = ["WebSockets", "ServerSentEvents"]
//!
//! [reconnect]
//! base_delay_ms = 1000
//! max_delay_ms = 30000
//! max_attempts = 5
//! ```

use crate::backoff::{LiveReconnectSchedule, ReconnectPolicy};
use crate::credentials::DEFAULT_COOKIE_NAME;
use crate::error::{ChannelError, Result};
use crate::transport::{TransportFlags, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Overrides `api_base`
pub const ENV_API_BASE: &str = "VET_API_BASE";

/// Overrides `transports` (comma separated, e.g. `WebSockets,LongPolling`)
pub const ENV_TRANSPORTS: &str = "VET_NOTIFY_TRANSPORTS";

/// Server-side method name for pushed notifications
pub const DEFAULT_EVENT_NAME: &str = "ReceiveNotification";

/// Hub method the debug helper invokes to get a notification echoed back
pub const DEFAULT_TEST_METHOD: &str = "SendTestNotification";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Backend base URL, e.g. `https://clinic.example.com/api`
    pub api_base: String,

    /// Hub path appended to `api_base`
    pub hub_path: String,

    /// Invocation target carrying notifications
    pub event_name: String,

    /// Invocation target used by `send_test_notification`
    pub test_method: String,

    /// Cookie holding the bearer token
    pub cookie_name: String,

    /// Transports the client may use, tried in fixed preference order
    pub transports: Vec<TransportKind>,

    /// Backoff for failed initial connects
    pub reconnect: ReconnectSettings,

    /// Delays before each reconnect attempt after an established link drops
    pub live_reconnect_delays_ms: Vec<u64>,

    /// Time allowed for the hub handshake response
    pub handshake_timeout_ms: u64,

    /// Client ping interval while the link is idle
    pub keepalive_interval_ms: u64,

    /// Link counts as dropped when nothing arrives for this long
    pub server_timeout_ms: u64,

    /// Capacity of the per-link command queue
    pub command_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5000/api".to_string(),
            hub_path: "/notificationHub".to_string(),
            event_name: DEFAULT_EVENT_NAME.to_string(),
            test_method: DEFAULT_TEST_METHOD.to_string(),
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            transports: TransportKind::ALL.to_vec(),
            reconnect: ReconnectSettings::default(),
            live_reconnect_delays_ms: vec![0, 2000, 10_000, 30_000],
            handshake_timeout_ms: 15_000,
            keepalive_interval_ms: 15_000,
            server_timeout_ms: 30_000,
            command_buffer: 64,
        }
    }
}

impl ChannelConfig {
    /// Config for `api_base` with everything else defaulted
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Default::default()
        }
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ChannelConfig = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults plus environment overrides
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::debug!("Config file {} not found, using defaults", path.display());
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// `~/.config/vet-notify/config.toml` (platform config dir)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vet-notify").join("config.toml"))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(base) = std::env::var(ENV_API_BASE) {
            if !base.trim().is_empty() {
                self.api_base = base.trim().to_string();
            }
        }
        if let Ok(list) = std::env::var(ENV_TRANSPORTS) {
            let mut kinds = Vec::new();
            for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let kind = TransportKind::from_name(name).ok_or_else(|| {
                    ChannelError::Config(format!("Unknown transport in {}: {}", ENV_TRANSPORTS, name))
                })?;
                kinds.push(kind);
            }
            self.transports = kinds;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.hub_url()?;
        if self.transports.is_empty() {
            return Err(ChannelError::Config("At least one transport must be enabled".to_string()));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ChannelError::Config("reconnect.base_delay_ms must be positive".to_string()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ChannelError::Config(
                "reconnect.max_delay_ms must not be below base_delay_ms".to_string(),
            ));
        }
        if self.keepalive_interval_ms == 0 || self.server_timeout_ms <= self.keepalive_interval_ms {
            return Err(ChannelError::Config(
                "server_timeout_ms must exceed a positive keepalive_interval_ms".to_string(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(ChannelError::Config("command_buffer must be positive".to_string()));
        }
        Ok(())
    }

    /// `api_base` joined with `hub_path`
    pub fn hub_url(&self) -> Result<Url> {
        let base = self.api_base.trim_end_matches('/');
        let path = self.hub_path.trim_start_matches('/');
        Ok(Url::parse(&format!("{}/{}", base, path))?)
    }

    pub fn transport_flags(&self) -> TransportFlags {
        self.transports
            .iter()
            .fold(TransportFlags::empty(), |flags, kind| flags | kind.flag())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn live_reconnect_schedule(&self) -> LiveReconnectSchedule {
        LiveReconnectSchedule::new(
            self.live_reconnect_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }
}
