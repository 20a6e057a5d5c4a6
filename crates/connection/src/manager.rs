//! Public handle to a supervised hub connection.
//!
//! [`ConnectionHandle::open`] starts connecting immediately and returns the
//! handle together with the receiver of [`ConnectionEvent`]s. The current
//! status is also observable through [`ConnectionHandle::watch_status`].

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint;
use crate::reconnection::{Shared, SupervisorConfig, supervise};
use crate::state::ConnectionState;
use crate::transport::{Connector, TungsteniteConnector};
use crate::types::{ConnectOptions, ConnectionEvent, ConnectionStatus};
use crate::ws_client::WsError;

/// Handle to one logical connection. Dropping it stops the connection.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<ConnectionStatus>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    /// Opens a connection over the real WebSocket transport.
    ///
    /// Must be called inside a Tokio runtime. Fails only when the URL cannot
    /// be turned into a WebSocket endpoint; everything after that is
    /// reported through the returned event stream.
    pub fn open(
        options: ConnectOptions,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), WsError> {
        Self::open_with(options, Arc::new(TungsteniteConnector))
    }

    /// Same as [`open`](Self::open) with a custom transport.
    pub fn open_with(
        options: ConnectOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), WsError> {
        let url = endpoint::websocket_url(&options.url)?;

        let (events_tx, events_rx) = mpsc::channel(options.event_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared::new(status_tx, events_tx));

        info!(url = %url, mode = ?options.mode, "opening hub connection");
        let state = ConnectionState::new(url, options.credential);
        let config = SupervisorConfig {
            reconnect: options.reconnect,
            fetch_initial_states: options.fetch_initial_states,
        };
        let supervisor = tokio::spawn(supervise(state, config, connector, shared.clone()));

        Ok((
            Self {
                shared,
                status_rx,
                supervisor: Mutex::new(Some(supervisor)),
            },
            events_rx,
        ))
    }

    pub fn current_status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status_rx.borrow() == ConnectionStatus::Connected
    }

    /// Best-effort send of a raw frame. When the channel is not open the
    /// frame is dropped with a warning.
    pub fn send(&self, message: Value) {
        match self.shared.live_channel() {
            Some(channel) => {
                if let Err(e) = channel.send(&message) {
                    warn!(error = %e, "dropping outbound frame");
                }
            }
            None => warn!(
                status = %self.current_status(),
                "not connected, dropping outbound frame"
            ),
        }
    }

    /// Sends a request frame (an id is assigned) and waits for its `result`.
    ///
    /// Rejects with [`WsError::NotConnected`] when the channel is not open,
    /// [`WsError::Timeout`] after 30 seconds, and [`WsError::Service`] when
    /// the hub reports a failure.
    pub async fn request(&self, body: Value) -> Result<Value, WsError> {
        let channel = self.shared.live_channel().ok_or(WsError::NotConnected)?;
        channel.request(body).await
    }

    /// Drops the current channel (if any) and connects again right away
    /// with a fresh backoff.
    pub fn reconnect(&self) {
        if self.shared.cancel.is_cancelled() {
            warn!("reconnect requested after close, ignoring");
            return;
        }
        self.shared.reconnect.notify_one();
    }

    /// Switches to a new hub address and credential, then reconnects.
    pub fn reconnect_with(
        &self,
        url: &str,
        credential: impl Into<String>,
    ) -> Result<(), WsError> {
        let url = endpoint::websocket_url(url)?;
        self.shared.set_retarget(url, credential.into());
        self.reconnect();
        Ok(())
    }

    /// Closes the connection for good. Pending reconnect timers and
    /// requests are cancelled; the last status reported is `Closed`.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        self.shared.cancel.cancel();
        let supervisor = self.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                warn!(error = %e, "supervisor task failed");
            }
            debug!("connection handle closed");
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
