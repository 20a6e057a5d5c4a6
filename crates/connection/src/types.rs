//! Public types for the connection manager.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hassdash_protocol::ChangeEvent;
use hassdash_protocol::constants::{
    INGRESS_MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY,
};

/// Connection status reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No channel and nothing scheduled yet, or the channel was just lost.
    Disconnected,
    /// Opening the channel or running the auth handshake.
    Connecting,
    /// Authenticated and subscribed.
    Connected,
    /// Waiting out the backoff before attempt number `attempt`.
    Reconnecting { attempt: u32 },
    /// Closed by the user. Terminal.
    Closed,
    /// The last attempt failed (transport, auth, or retries exhausted).
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting { .. } => "reconnecting",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// How the dashboard is embedded. Picks the default reconnect policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Lovelace custom card with an explicit URL and token.
    #[default]
    Card,
    /// Sidebar panel with an explicit URL and token.
    Panel,
    /// Add-on behind the ingress proxy; no credential needed.
    Ingress,
}

impl DeploymentMode {
    /// Default reconnect policy for this mode: unbounded for card and panel,
    /// capped for ingress.
    pub fn reconnect_config(self) -> ReconnectConfig {
        match self {
            DeploymentMode::Card | DeploymentMode::Panel => ReconnectConfig::default(),
            DeploymentMode::Ingress => ReconnectConfig {
                max_attempts: Some(INGRESS_MAX_RECONNECT_ATTEMPTS),
                ..ReconnectConfig::default()
            },
        }
    }
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Base delay; attempt `n` waits `initial_delay * backoff_factor^n`.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Give up after this many consecutive failed attempts. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: RECONNECT_BASE_DELAY,
            max_delay: RECONNECT_MAX_DELAY,
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Calculates the delay before attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether attempt number `attempt` is beyond the configured cap.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Why a live channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The hub sent a close frame.
    Closed { code: Option<u16>, reason: String },
    /// The transport reported an error.
    Transport(String),
    /// Nothing arrived within the read deadline.
    IdleTimeout,
    /// The stream ended without a close frame.
    StreamEnded,
    /// Torn down locally (close or forced reconnect).
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed { code, reason } => match code {
                Some(code) => write!(f, "closed by hub ({code}): {reason}"),
                None => write!(f, "closed by hub: {reason}"),
            },
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
            DisconnectReason::IdleTimeout => f.write_str("read deadline expired"),
            DisconnectReason::StreamEnded => f.write_str("stream ended"),
            DisconnectReason::Shutdown => f.write_str("shut down locally"),
        }
    }
}

/// Errors reported through [`ConnectionEvent::Error`]. These never reach
/// the caller as a failed call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("background request failed: {0}")]
    Request(String),

    #[error("gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Events emitted by the connection manager, in order.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Status transition.
    Status(ConnectionStatus),
    /// Handshake completed and the `state_changed` subscription was issued.
    Opened { ha_version: Option<String> },
    /// An entity changed state.
    StateChanged(ChangeEvent),
    /// Full state list fetched right after the subscription.
    Snapshot(Vec<Value>),
    /// The live channel ended.
    Closed(DisconnectReason),
    /// Something failed without a caller to return it to.
    Error(ConnectionError),
}

/// Parameters for [`ConnectionHandle::open`](crate::ConnectionHandle::open).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Hub address; `http(s)`, `ws(s)` or a full `/api/websocket` URL.
    pub url: String,
    /// Long-lived access token. Empty when the proxy authenticates.
    pub credential: String,
    pub mode: DeploymentMode,
    pub reconnect: ReconnectConfig,
    /// Issue `get_states` after subscribing and emit a snapshot.
    pub fetch_initial_states: bool,
    /// Capacity of the event channel.
    pub event_capacity: usize,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: credential.into(),
            mode: DeploymentMode::default(),
            reconnect: ReconnectConfig::default(),
            fetch_initial_states: true,
            event_capacity: 256,
        }
    }

    /// Sets the deployment mode and its default reconnect policy.
    pub fn with_mode(mut self, mode: DeploymentMode) -> Self {
        self.mode = mode;
        self.reconnect = mode.reconnect_config();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Overrides only the attempt cap of the current policy.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self
    }

    pub fn without_initial_states(mut self) -> Self {
        self.fetch_initial_states = false;
        self
    }
}
