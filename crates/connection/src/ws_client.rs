//! One live, authenticated channel to the hub.
//!
//! Implements the request-response pattern with integer id correlation,
//! protocol-level ping keepalive and `state_changed` dispatching.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use hassdash_protocol::constants::{HANDSHAKE_TIMEOUT, REQUEST_TIMEOUT};
use hassdash_protocol::frames::with_id;
use hassdash_protocol::{InboundFrame, ProtocolError};

use crate::transport::Connector;
use crate::types::{ConnectionEvent, DisconnectReason};

/// Errors from the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid hub URL: {0}")]
    InvalidUrl(String),

    #[error("authentication rejected: {0}")]
    AuthInvalid(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("request {id} timed out")]
    Timeout { id: u64 },

    #[error("connection closed")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("hub error {code}: {message}")]
    Service { code: String, message: String },
}

/// Outstanding requests keyed by correlation id.
pub(crate) type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<InboundFrame>>>>;

const WRITE_QUEUE: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Cloneable sending side of a live channel.
#[derive(Clone)]
pub(crate) struct RequestChannel {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Pending,
    ids: Arc<AtomicU64>,
}

/// A request that was written to the channel and awaits its `result`.
pub(crate) struct PendingRequest {
    id: u64,
    rx: oneshot::Receiver<InboundFrame>,
    pending: Pending,
}

impl RequestChannel {
    fn new(write_tx: mpsc::Sender<tungstenite::Message>) -> Self {
        Self {
            write_tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Queues a frame as-is. Fails only when the channel is gone or full.
    pub(crate) fn send(&self, message: &Value) -> Result<(), WsError> {
        self.write_tx
            .try_send(tungstenite::Message::Text(message.to_string().into()))
            .map_err(|_| WsError::Closed)
    }

    /// Stamps an id onto `body`, registers it and writes it.
    pub(crate) async fn start(&self, body: Value) -> Result<PendingRequest, WsError> {
        let id = self.next_id();
        let frame = with_id(id, body)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self
            .write_tx
            .send(tungstenite::Message::Text(frame.to_string().into()))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(WsError::Closed);
        }

        trace!(id, "request sent");
        Ok(PendingRequest {
            id,
            rx,
            pending: self.pending.clone(),
        })
    }

    /// Sends a request and waits for the response.
    pub(crate) async fn request(&self, body: Value) -> Result<Value, WsError> {
        self.start(body).await?.wait().await
    }

    /// Wakes every waiting requester with [`WsError::Closed`].
    async fn fail_pending(&self) {
        let mut map = self.pending.lock().await;
        if !map.is_empty() {
            debug!(count = map.len(), "dropping pending requests");
        }
        map.clear();
    }
}

impl PendingRequest {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Waits up to [`REQUEST_TIMEOUT`] for the response. The slot is
    /// released on every exit path.
    pub(crate) async fn wait(self) -> Result<Value, WsError> {
        let result = tokio::time::timeout(REQUEST_TIMEOUT, self.rx).await;

        self.pending.lock().await.remove(&self.id);

        match result {
            Ok(Ok(frame)) => frame.into_response().map_err(|e| WsError::Service {
                code: e.code,
                message: e.message,
            }),
            Ok(Err(_)) => Err(WsError::Closed),
            Err(_) => {
                warn!(id = self.id, "request timed out");
                Err(WsError::Timeout { id: self.id })
            }
        }
    }
}

/// Authenticated channel with its pumps running.
///
/// Inbound frames are held back until [`deliver`](Self::deliver) is called,
/// so no event reaches the caller before the status change that announces
/// the channel.
pub(crate) struct WsClient {
    requests: RequestChannel,
    inbound_gate: Option<oneshot::Sender<()>>,
    read_handle: JoinHandle<DisconnectReason>,
    write_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WsClient {
    /// Opens a channel through `connector`, authenticates with `credential`
    /// and starts the pumps. Returns the hub version from `auth_ok`.
    pub(crate) async fn connect(
        connector: &dyn Connector,
        url: &str,
        credential: &str,
        events_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Result<(Self, Option<String>), WsError> {
        let (mut sink, mut stream) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(url))
            .await
            .map_err(|_| WsError::HandshakeTimeout)??;

        let ha_version = crate::handshake::authenticate(&mut sink, &mut stream, credential).await?;
        Ok((Self::start(sink, stream, events_tx), ha_version))
    }

    fn start(
        sink: crate::transport::FrameSink,
        stream: crate::transport::FrameStream,
        events_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(WRITE_QUEUE);
        let requests = RequestChannel::new(write_tx.clone());
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(sink, write_rx, cancel))
        };

        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let read_handle = {
            let pending = requests.pending.clone();
            let write_tx = write_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return DisconnectReason::Shutdown,
                    _ = gate_rx => {}
                }
                crate::pumps::read::read_pump(stream, pending, events_tx, write_tx, cancel).await
            })
        };

        let ping_handle = {
            let ids = requests.ids.clone();
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::ping::ping_pump(write_tx, ids, cancel))
        };

        Self {
            requests,
            inbound_gate: Some(gate_tx),
            read_handle,
            write_handle,
            ping_handle,
            cancel,
        }
    }

    /// Starts dispatching inbound frames. Later calls do nothing.
    pub(crate) fn deliver(&mut self) {
        if let Some(gate) = self.inbound_gate.take() {
            let _ = gate.send(());
        }
    }

    pub(crate) fn requests(&self) -> RequestChannel {
        self.requests.clone()
    }

    /// Token cancelled when this channel is torn down.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves when the read pump exits. Poll at most once to completion.
    pub(crate) async fn closed(&mut self) -> DisconnectReason {
        match (&mut self.read_handle).await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::Transport(format!("read pump failed: {e}")),
        }
    }

    /// Stops the pumps, sends a close frame and fails outstanding requests.
    pub(crate) async fn shutdown(mut self) {
        self.cancel.cancel();
        self.requests.fail_pending().await;
        if tokio::time::timeout(CLOSE_GRACE, &mut self.write_handle)
            .await
            .is_err()
        {
            debug!("write pump did not stop in time");
        }
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.write_handle.abort();
        self.ping_handle.abort();
    }
}
