//! Configuration for the softphone session engine
//!
//! [`PhoneConfig`] groups one sub-configuration per component. Every field has a
//! default, so a TOML file only needs the values it wants to change:
//!
//! ```rust
//! use rvoip_softphone_core::PhoneConfig;
//!
//! let config = PhoneConfig::from_toml_str(r#"
//!     monitored_extensions = ["201", "202"]
//!
//!     [transport]
//!     server_uri = "wss://pbx.example.com:8089/ws"
//!
//!     [credentials]
//!     username = "1001"
//!     password = "secret"
//!
//!     [presence]
//!     batch_size = 5
//! "#).unwrap();
//!
//! assert_eq!(config.presence.batch_size, 5);
//! assert_eq!(config.registration.max_attempts, 4);
//! ```
//!
//! Durations are stored as integer `*_ms` / `*_secs` fields and exposed through
//! `Duration` accessors.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PhoneError, PhoneResult};
use crate::recovery::RetryConfig;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    pub transport: TransportConfig,
    pub registration: RegistrationConfig,
    pub calls: CallConfig,
    pub presence: PresenceConfig,
    pub agent: AgentConfig,
    pub credentials: Credentials,
    /// Extensions whose presence is monitored once registered
    pub monitored_extensions: Vec<String>,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            registration: RegistrationConfig::default(),
            calls: CallConfig::default(),
            presence: PresenceConfig::default(),
            agent: AgentConfig::default(),
            credentials: Credentials::default(),
            monitored_extensions: Vec::new(),
            event_capacity: 256,
        }
    }
}

impl PhoneConfig {
    pub fn new(server_uri: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.transport.server_uri = server_uri.into();
        config
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials.username = username.into();
        self.credentials.password = password.into();
        self
    }

    pub fn with_monitored_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.monitored_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_focus_incoming_calls(mut self, focus: bool) -> Self {
        self.calls.focus_incoming_calls = focus;
        self
    }

    pub fn from_toml_str(content: &str) -> PhoneResult<Self> {
        let config: PhoneConfig = toml::from_str(content)
            .map_err(|e| PhoneError::invalid_configuration("toml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PhoneResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PhoneError::invalid_configuration(path.display().to_string(), e.to_string())
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> PhoneResult<()> {
        if self.transport.server_uri.trim().is_empty() {
            return Err(PhoneError::invalid_configuration(
                "transport.server_uri",
                "must not be empty",
            ));
        }
        if self.transport.heartbeat_interval_secs == 0 {
            return Err(PhoneError::invalid_configuration(
                "transport.heartbeat_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.registration.max_attempts == 0 {
            return Err(PhoneError::invalid_configuration(
                "registration.max_attempts",
                "at least one attempt is required",
            ));
        }
        if self.presence.batch_size == 0 {
            return Err(PhoneError::invalid_configuration(
                "presence.batch_size",
                "must be greater than zero",
            ));
        }
        if self.presence.health_check_interval_secs == 0 {
            return Err(PhoneError::invalid_configuration(
                "presence.health_check_interval_secs",
                "must be greater than zero",
            ));
        }
        for (field, ratio) in [
            ("presence.refresh_ratio", self.presence.refresh_ratio),
            ("registration.refresh_ratio", self.registration.refresh_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(PhoneError::invalid_configuration(
                    field,
                    format!("{} is outside (0, 1]", ratio),
                ));
            }
        }
        if self.event_capacity == 0 {
            return Err(PhoneError::invalid_configuration(
                "event_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// SIP credentials used for registration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub display_name: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("realm", &self.realm)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Signaling connection and keep-alive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub server_uri: String,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    /// Spread reconnect delays by up to 10%
    pub reconnect_jitter: bool,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            connect_timeout_ms: 10_000,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 10,
            reconnect_jitter: false,
            heartbeat_interval_secs: 90,
            heartbeat_timeout_ms: 10_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.reconnect_max_attempts,
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            backoff_multiplier: 2.0,
            use_jitter: self.reconnect_jitter,
        }
    }
}

/// Registration retry and refresh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Fraction of the granted expiry after which the binding is refreshed
    pub refresh_ratio: f64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_retry_delay_ms: 2_000,
            max_retry_delay_ms: 30_000,
            request_timeout_ms: 10_000,
            refresh_ratio: 0.9,
        }
    }
}

impl RegistrationConfig {
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Call handling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub request_timeout_ms: u64,
    /// A call still establishing after this long is terminated
    pub establish_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    /// Give media focus to an incoming call as soon as it is bound to a line
    pub focus_incoming_calls: bool,
    /// Response code used when the user declines an incoming call
    pub decline_code: u16,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            establish_timeout_secs: 60,
            transfer_timeout_secs: 30,
            focus_incoming_calls: true,
            decline_code: 603,
        }
    }
}

impl CallConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn establish_timeout(&self) -> Duration {
        Duration::from_secs(self.establish_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

/// Presence (BLF) subscription settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub event_package: String,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub refresh_ratio: f64,
    pub health_check_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub request_timeout_ms: u64,
    /// Expiry assumed when the server does not advertise one
    pub default_expires_secs: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            event_package: "dialog".to_string(),
            max_retries: 3,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            batch_size: 10,
            batch_delay_ms: 500,
            refresh_ratio: 0.9,
            health_check_interval_secs: 60,
            stale_threshold_secs: 300,
            request_timeout_ms: 10_000,
            default_expires_secs: 3600,
        }
    }
}

impl PresenceConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff used by `subscribe_with_retry`
    pub fn retry_policy(&self, max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: max_retries.saturating_add(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }
}

/// Agent queue settings
///
/// The in-band sequences are dialed on a background line when the admin API is
/// unavailable. `{agent}` and `{reason}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: Option<String>,
    pub api_timeout_ms: u64,
    pub login_sequence: String,
    pub logout_sequence: String,
    pub pause_sequence: String,
    pub resume_sequence: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: None,
            api_timeout_ms: 5_000,
            login_sequence: "*45{agent}#".to_string(),
            logout_sequence: "*46{agent}#".to_string(),
            pause_sequence: "*47{agent}*{reason}#".to_string(),
            resume_sequence: "*48{agent}#".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

/// Source of the settings the engine reads once at startup
pub trait ConfigStore: Send + Sync {
    fn credentials(&self) -> Credentials;

    fn monitored_extensions(&self) -> Vec<String>;

    fn agent_id(&self) -> Option<String>;
}

/// [`ConfigStore`] backed by a [`PhoneConfig`]
#[derive(Debug, Clone)]
pub struct StaticConfigStore {
    credentials: Credentials,
    monitored_extensions: Vec<String>,
    agent_id: Option<String>,
}

impl StaticConfigStore {
    pub fn from_config(config: &PhoneConfig) -> Self {
        Self {
            credentials: config.credentials.clone(),
            monitored_extensions: config.monitored_extensions.clone(),
            agent_id: config.agent.agent_id.clone(),
        }
    }
}

impl ConfigStore for StaticConfigStore {
    fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }

    fn monitored_extensions(&self) -> Vec<String> {
        self.monitored_extensions.clone()
    }

    fn agent_id(&self) -> Option<String> {
        self.agent_id.clone()
    }
}
