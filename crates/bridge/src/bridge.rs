//! Connection → history wiring.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hassdash_connection::{
    ConnectOptions, ConnectionEvent, ConnectionHandle, Connector, DeploymentMode,
    TungsteniteConnector, endpoint,
};
use hassdash_history::{HistoryStore, KvStore, Settings};
use hassdash_protocol::ChangeEvent;

use crate::error::BridgeError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Events surfaced by the bridge, in arrival order.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// Forwarded unchanged from the connection.
    Connection(ConnectionEvent),
    /// A state change could not be persisted. Follows the matching
    /// `Connection(StateChanged)`.
    StorageFailed { entity_id: String, error: String },
}

/// A running connection whose state changes are recorded in `history`.
pub struct Bridge<S> {
    history: Arc<HistoryStore<S>>,
    connection: ConnectionHandle,
    mode: DeploymentMode,
    pump: JoinHandle<()>,
}

impl<S: KvStore> Bridge<S> {
    /// Starts the bridge over the real WebSocket transport.
    ///
    /// `bootstrap` supplies the mode, reconnect policy and fallback target;
    /// a URL or credential already saved in the settings record wins, and
    /// missing fields are seeded from `bootstrap`.
    pub async fn start(
        history: Arc<HistoryStore<S>>,
        bootstrap: ConnectOptions,
    ) -> Result<(Self, mpsc::Receiver<BridgeEvent>), BridgeError> {
        Self::start_with(history, bootstrap, Arc::new(TungsteniteConnector)).await
    }

    pub async fn start_with(
        history: Arc<HistoryStore<S>>,
        bootstrap: ConnectOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::Receiver<BridgeEvent>), BridgeError> {
        let settings = resolve_settings(&history, &bootstrap).await?;
        let Some(url) = settings.connection_url.clone() else {
            return Err(BridgeError::MissingUrl);
        };
        let mode = bootstrap.mode;
        let credential = credential_for(mode, &settings);

        let capacity = bootstrap.event_capacity.max(1);
        let options = ConnectOptions {
            url,
            credential,
            ..bootstrap
        };
        let (connection, events) = ConnectionHandle::open_with(options, connector)?;

        let (out_tx, out_rx) = mpsc::channel(capacity);
        let pump = tokio::spawn(pump_events(history.clone(), events, out_tx));
        info!(capacity = history.capacity(), "bridge started");

        Ok((
            Self {
                history,
                connection,
                mode,
                pump,
            },
            out_rx,
        ))
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn history(&self) -> &Arc<HistoryStore<S>> {
        &self.history
    }

    /// Saves new settings and reconnects to the target they name.
    ///
    /// The URL is validated first; an invalid one leaves both the saved
    /// record and the live connection untouched. In ingress mode the saved
    /// credential is kept but never sent.
    pub async fn apply_settings(&self, settings: Settings) -> Result<(), BridgeError> {
        let url = settings
            .connection_url
            .as_deref()
            .ok_or(BridgeError::MissingUrl)?;
        endpoint::websocket_url(url)?;

        self.history.save_settings(&settings).await?;
        self.connection
            .reconnect_with(url, credential_for(self.mode, &settings))?;
        info!("settings applied, reconnecting");
        Ok(())
    }

    /// Closes the connection and waits briefly for queued events to be
    /// recorded.
    pub async fn shutdown(self) {
        let Self {
            connection,
            mut pump,
            ..
        } = self;
        connection.close().await;
        drop(connection);

        match tokio::time::timeout(SHUTDOWN_GRACE, &mut pump).await {
            Ok(Ok(())) => debug!("bridge pump drained"),
            Ok(Err(e)) => warn!(error = %e, "bridge pump failed"),
            Err(_) => {
                warn!("bridge pump still busy after close, aborting");
                pump.abort();
            }
        }
        info!("bridge stopped");
    }
}

/// Ingress sessions authenticate through the proxy, never with a token.
fn credential_for(mode: DeploymentMode, settings: &Settings) -> String {
    match mode {
        DeploymentMode::Ingress => String::new(),
        DeploymentMode::Card | DeploymentMode::Panel => {
            settings.credential.clone().unwrap_or_default()
        }
    }
}

/// Loads the settings record, filling a missing URL or credential from the
/// bootstrap options and persisting the result when anything was filled.
async fn resolve_settings<S: KvStore>(
    history: &HistoryStore<S>,
    bootstrap: &ConnectOptions,
) -> Result<Settings, BridgeError> {
    let mut settings = history.get_settings().await?;
    let mut seeded = false;

    if settings.connection_url.is_none() && !bootstrap.url.is_empty() {
        settings.connection_url = Some(bootstrap.url.clone());
        seeded = true;
    }
    if settings.credential.is_none() && !bootstrap.credential.is_empty() {
        settings.credential = Some(bootstrap.credential.clone());
        seeded = true;
    }

    if seeded {
        history.save_settings(&settings).await?;
        info!("seeded settings from bootstrap config");
    }
    Ok(settings)
}

/// Records every state change before taking the next event, then forwards.
/// Keeps recording after the bridge receiver is gone.
async fn pump_events<S: KvStore>(
    history: Arc<HistoryStore<S>>,
    mut events: mpsc::Receiver<ConnectionEvent>,
    out: mpsc::Sender<BridgeEvent>,
) {
    let mut forwarding = true;
    while let Some(event) = events.recv().await {
        let failure = match &event {
            ConnectionEvent::StateChanged(change) => record_change(&history, change).await,
            _ => None,
        };

        if forwarding {
            forwarding = forward(&out, BridgeEvent::Connection(event)).await;
        }
        if let Some(failure) = failure
            && forwarding
        {
            forwarding = forward(&out, failure).await;
        }
    }
    debug!("connection event stream ended");
}

async fn record_change<S: KvStore>(
    history: &HistoryStore<S>,
    change: &ChangeEvent,
) -> Option<BridgeEvent> {
    match history.record_event(change).await {
        Ok(()) => None,
        Err(e) => {
            error!(entity_id = %change.entity_id, error = %e, "failed to record state change");
            Some(BridgeEvent::StorageFailed {
                entity_id: change.entity_id.clone(),
                error: e.to_string(),
            })
        }
    }
}

async fn forward(out: &mpsc::Sender<BridgeEvent>, event: BridgeEvent) -> bool {
    if out.send(event).await.is_err() {
        debug!("bridge receiver dropped, recording only");
        return false;
    }
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use futures_util::StreamExt;
    use futures_util::future::BoxFuture;
    use serde_json::{Value, json};
    use tokio_tungstenite::tungstenite::{self, Message};

    use hassdash_connection::{ConnectionStatus, FrameSink, FrameStream, WsError};
    use hassdash_history::{FileStore, MemoryStore, StorageError, StorageResult};
    use hassdash_protocol::EventPayload;

    use super::*;

    /// Transport that never gets a channel up.
    pub(crate) struct Refusing;

    impl Connector for Refusing {
        fn connect<'a>(
            &'a self,
            _url: &'a str,
        ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>> {
            Box::pin(async { Err(WsError::Closed) })
        }
    }

    /// Transport that asks for auth and then stays silent. Every frame the
    /// client sends is reported with the URL of its channel.
    struct Recording {
        sent: mpsc::UnboundedSender<(String, Value)>,
    }

    impl Connector for Recording {
        fn connect<'a>(
            &'a self,
            url: &'a str,
        ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>> {
            let sent = self.sent.clone();
            let url = url.to_owned();
            Box::pin(async move {
                let sink = futures_util::sink::unfold(sent, move |sent, msg: Message| {
                    let url = url.clone();
                    async move {
                        if let Ok(frame) = serde_json::from_str::<Value>(msg.to_text()?) {
                            let _ = sent.send((url, frame));
                        }
                        Ok::<_, tungstenite::Error>(sent)
                    }
                });
                let auth_required = json!({"type": "auth_required", "ha_version": "2024.6.0"});
                let stream = futures_util::stream::iter([Ok::<_, tungstenite::Error>(
                    Message::Text(auth_required.to_string().into()),
                )])
                .chain(futures_util::stream::pending());

                let sink: FrameSink = Box::pin(sink);
                let stream: FrameStream = Box::pin(stream);
                Ok((sink, stream))
            })
        }
    }

    async fn next_sent(sent: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
        tokio::time::timeout(Duration::from_secs(5), sent.recv())
            .await
            .expect("frame in time")
            .expect("connector alive")
    }

    /// Store that accepts reads and rejects writes to entity sequences.
    #[derive(Default)]
    struct FullStore {
        inner: MemoryStore,
    }

    impl KvStore for FullStore {
        async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
            if key.starts_with("entity:") {
                return Err(StorageError::Unavailable("disk full".into()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key).await
        }

        async fn keys(&self) -> StorageResult<Vec<String>> {
            self.inner.keys().await
        }
    }

    fn change(entity_id: &str, state: &str) -> ConnectionEvent {
        ConnectionEvent::StateChanged(ChangeEvent {
            entity_id: entity_id.into(),
            new_state: json!({"entity_id": entity_id, "state": state}),
            timestamp: Utc::now(),
        })
    }

    pub(crate) async fn start_refusing(
        history: Arc<HistoryStore<MemoryStore>>,
        bootstrap: ConnectOptions,
    ) -> (Bridge<MemoryStore>, mpsc::Receiver<BridgeEvent>) {
        Bridge::start_with(history, bootstrap, Arc::new(Refusing))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pump_records_before_forwarding() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_events(history.clone(), events_rx, out_tx));

        events_tx.send(change("light.kitchen", "on")).await.unwrap();
        events_tx
            .send(ConnectionEvent::Status(ConnectionStatus::Connected))
            .await
            .unwrap();
        events_tx.send(change("light.kitchen", "off")).await.unwrap();

        let first = out_rx.recv().await.unwrap();
        assert!(matches!(
            first,
            BridgeEvent::Connection(ConnectionEvent::StateChanged(ref c)) if c.entity_id == "light.kitchen"
        ));
        assert!(!history.history("light.kitchen").await.unwrap().is_empty());

        assert!(matches!(
            out_rx.recv().await.unwrap(),
            BridgeEvent::Connection(ConnectionEvent::Status(ConnectionStatus::Connected))
        ));
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            BridgeEvent::Connection(ConnectionEvent::StateChanged(_))
        ));

        drop(events_tx);
        pump.await.unwrap();
        let states: Vec<Value> = history
            .history("light.kitchen")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.state["state"].clone())
            .collect();
        assert_eq!(states, vec![json!("on"), json!("off")]);
    }

    #[tokio::test]
    async fn storage_failure_is_surfaced_and_pump_continues() {
        let history = Arc::new(HistoryStore::new(FullStore::default()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_events(history, events_rx, out_tx));

        events_tx.send(change("sensor.x", "1")).await.unwrap();
        events_tx
            .send(ConnectionEvent::Status(ConnectionStatus::Connected))
            .await
            .unwrap();
        drop(events_tx);

        assert!(matches!(
            out_rx.recv().await.unwrap(),
            BridgeEvent::Connection(ConnectionEvent::StateChanged(_))
        ));
        match out_rx.recv().await.unwrap() {
            BridgeEvent::StorageFailed { entity_id, error } => {
                assert_eq!(entity_id, "sensor.x");
                assert!(error.contains("disk full"));
            }
            other => panic!("expected storage failure, got {other:?}"),
        }
        assert!(matches!(
            out_rx.recv().await.unwrap(),
            BridgeEvent::Connection(ConnectionEvent::Status(ConnectionStatus::Connected))
        ));
        assert!(out_rx.recv().await.is_none());
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn pump_keeps_recording_without_a_receiver() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::channel(8);
        drop(out_rx);
        let pump = tokio::spawn(pump_events(history.clone(), events_rx, out_tx));

        for state in ["1", "2", "3"] {
            events_tx.send(change("sensor.x", state)).await.unwrap();
        }
        drop(events_tx);
        pump.await.unwrap();

        assert_eq!(history.history("sensor.x").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn recorded_changes_survive_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(HistoryStore::new(FileStore::open(dir.path()).await.unwrap()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let (out_tx, _out_rx) = mpsc::channel(8);
        let pump = tokio::spawn(pump_events(history, events_rx, out_tx));

        let removal: EventPayload = serde_json::from_value(json!({
            "event_type": "state_changed",
            "data": {"entity_id": "light.kitchen", "new_state": null}
        }))
        .unwrap();
        let removal = ChangeEvent::from_payload(&removal, Utc::now()).unwrap();

        events_tx.send(change("light.kitchen", "on")).await.unwrap();
        events_tx
            .send(ConnectionEvent::StateChanged(removal))
            .await
            .unwrap();
        drop(events_tx);
        pump.await.unwrap();

        let reopened = HistoryStore::new(FileStore::open(dir.path()).await.unwrap());
        let points = reopened.history("light.kitchen").await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].state["state"], "on");
        assert_eq!(points[1].state["entity_id"], "light.kitchen");
        assert!(points[1].state["new_state"].is_null());
    }

    #[tokio::test]
    async fn bootstrap_seeds_empty_settings() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let (bridge, _events) = start_refusing(
            history.clone(),
            ConnectOptions::new("http://hass.local:8123", "tok"),
        )
        .await;

        let saved = history.get_settings().await.unwrap();
        assert_eq!(saved, Settings::new("http://hass.local:8123", "tok"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn saved_settings_win_over_bootstrap() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let mut saved = Settings::new("ws://saved.local:8123/api/websocket", "saved-token");
        saved.extra.insert("theme".into(), json!("dark"));
        history.save_settings(&saved).await.unwrap();

        let (bridge, _events) = start_refusing(
            history.clone(),
            ConnectOptions::new("http://bootstrap.local:8123", "boot"),
        )
        .await;

        assert_eq!(history.get_settings().await.unwrap(), saved);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn start_without_any_url_fails() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let result =
            Bridge::start_with(history, ConnectOptions::new("", ""), Arc::new(Refusing)).await;
        assert!(matches!(result, Err(BridgeError::MissingUrl)));
    }

    #[tokio::test]
    async fn start_rejects_unusable_url() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let result = Bridge::start_with(
            history,
            ConnectOptions::new("ftp://hass.local", "tok"),
            Arc::new(Refusing),
        )
        .await;
        assert!(matches!(result, Err(BridgeError::Connection(_))));
    }

    #[tokio::test]
    async fn invalid_settings_are_not_saved() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let (bridge, _events) = start_refusing(
            history.clone(),
            ConnectOptions::new("http://hass.local:8123", "tok"),
        )
        .await;

        let err = bridge
            .apply_settings(Settings::new("gopher://nope", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(
            history.get_settings().await.unwrap(),
            Settings::new("http://hass.local:8123", "tok")
        );

        let err = bridge.apply_settings(Settings::default()).await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingUrl));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn applied_settings_are_saved() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let (bridge, _events) = start_refusing(
            history.clone(),
            ConnectOptions::new("http://hass.local:8123", "tok"),
        )
        .await;

        let next = Settings::new("https://hass.example.com", "new-token");
        bridge.apply_settings(next.clone()).await.unwrap();
        assert_eq!(history.get_settings().await.unwrap(), next);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn ingress_never_sends_the_saved_credential() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        history
            .save_settings(&Settings::new("https://hass.example.com", "secret"))
            .await
            .unwrap();
        let (sent_tx, mut sent) = mpsc::unbounded_channel();
        let (bridge, _events) = Bridge::start_with(
            history.clone(),
            ConnectOptions::new("", "").with_mode(DeploymentMode::Ingress),
            Arc::new(Recording { sent: sent_tx }),
        )
        .await
        .unwrap();

        let (url, auth) = next_sent(&mut sent).await;
        assert_eq!(url, "wss://hass.example.com/api/websocket");
        assert_eq!(auth, json!({"type": "auth", "access_token": ""}));

        let next = Settings::new("https://other.example.com", "secret");
        bridge.apply_settings(next.clone()).await.unwrap();
        let (url, auth) = next_sent(&mut sent).await;
        assert_eq!(url, "wss://other.example.com/api/websocket");
        assert_eq!(auth, json!({"type": "auth", "access_token": ""}));

        assert_eq!(history.get_settings().await.unwrap(), next);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_forwards_final_status_and_ends_stream() {
        let history = Arc::new(HistoryStore::new(MemoryStore::new()));
        let (bridge, mut events) = start_refusing(
            history,
            ConnectOptions::new("http://hass.local:8123", "tok"),
        )
        .await;
        bridge.shutdown().await;

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        assert!(matches!(
            last,
            Some(BridgeEvent::Connection(ConnectionEvent::Status(ConnectionStatus::Closed)))
        ));
    }
}
