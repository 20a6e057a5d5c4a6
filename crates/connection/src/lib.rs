//! Connection manager for the Home Assistant WebSocket API.
//!
//! Owns a single channel to the hub, performs the auth handshake,
//! subscribes to `state_changed`, correlates requests with their results,
//! and reconnects with exponential backoff on unexpected loss.

pub mod endpoint;
mod handshake;
pub mod manager;
mod pumps;
pub(crate) mod reconnection;
mod services;
pub mod state;
pub mod transport;
pub mod types;
pub mod ws_client;

pub use manager::ConnectionHandle;
pub use state::{ConnectionState, TransitionError};
pub use transport::{Connector, FrameSink, FrameStream, TungsteniteConnector};
pub use types::{
    ConnectOptions, ConnectionError, ConnectionEvent, ConnectionStatus, DeploymentMode,
    DisconnectReason, ReconnectConfig,
};
pub use ws_client::WsError;
