use std::time::Duration;

/// Path of the WebSocket API on a Home Assistant instance.
pub const WEBSOCKET_PATH: &str = "/api/websocket";

/// Event type carrying entity state transitions.
pub const EVENT_STATE_CHANGED: &str = "state_changed";

/// Time allowed for the hub to complete the auth exchange after the
/// channel opens.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for request/response operations.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often to send protocol-level `ping` commands.
pub const PING_PERIOD: Duration = Duration::from_secs(20);

/// Read deadline: if nothing arrives within this window (no pong, no
/// result, no event) the channel is considered dead.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum inbound message size in bytes (16 MB). `get_states` on a large
/// installation is the biggest frame we expect.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Base delay of the reconnect backoff.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound of the reconnect backoff.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Reconnect attempts allowed in ingress mode before giving up.
pub const INGRESS_MAX_RECONNECT_ATTEMPTS: u32 = 10;
