//! Connection supervisor with exponential-backoff reconnection.
//!
//! A single task owns the [`ConnectionState`] for the lifetime of a handle.
//! It opens the channel, waits for it to end, schedules the next attempt and
//! publishes every status change. The handle talks to it only through
//! [`Shared`].

use std::sync::{Arc, PoisonError};

use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hassdash_protocol::OutboundFrame;

use crate::state::{ConnectionState, RetryDecision};
use crate::transport::Connector;
use crate::types::{
    ConnectionError, ConnectionEvent, ConnectionStatus, DisconnectReason, ReconnectConfig,
};
use crate::ws_client::{RequestChannel, WsClient, WsError};

/// State shared between a [`ConnectionHandle`](crate::ConnectionHandle) and
/// its supervisor.
pub(crate) struct Shared {
    pub(crate) status_tx: watch::Sender<ConnectionStatus>,
    pub(crate) events_tx: mpsc::Sender<ConnectionEvent>,
    /// Sending side of the current channel, while connected.
    pub(crate) live: std::sync::Mutex<Option<RequestChannel>>,
    /// Target to switch to on the next attempt.
    pub(crate) retarget: std::sync::Mutex<Option<(String, String)>>,
    /// Forced reconnect requests.
    pub(crate) reconnect: Notify,
    /// Cancelled by `close()`.
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn new(
        status_tx: watch::Sender<ConnectionStatus>,
        events_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            status_tx,
            events_tx,
            live: std::sync::Mutex::new(None),
            retarget: std::sync::Mutex::new(None),
            reconnect: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn live_channel(&self) -> Option<RequestChannel> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_live(&self, channel: Option<RequestChannel>) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = channel;
    }

    pub(crate) fn set_retarget(&self, url: String, credential: String) {
        *self.retarget.lock().unwrap_or_else(PoisonError::into_inner) = Some((url, credential));
    }

    fn take_retarget(&self) -> Option<(String, String)> {
        self.retarget
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Delivers an event in order. Gives up if the handle is closed while
    /// the receiver is full.
    pub(crate) async fn emit(&self, event: ConnectionEvent) {
        tokio::select! {
            biased;
            _ = self.events_tx.send(event) => {}
            _ = self.cancel.cancelled() => debug!("event dropped during close"),
        }
    }

    async fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status.clone());
        self.emit(ConnectionEvent::Status(status)).await;
    }
}

/// Options the supervisor needs beyond the state itself.
#[derive(Debug, Clone)]
pub(crate) struct SupervisorConfig {
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) fetch_initial_states: bool,
}

enum Wake {
    Cancelled,
    Forced,
}

/// Runs until the handle is closed.
pub(crate) async fn supervise(
    mut state: ConnectionState,
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
) {
    'session: loop {
        if let Some((url, credential)) = shared.take_retarget() {
            info!(url = %url, "switching hub target");
            if let Err(e) = state.retarget(url, credential) {
                warn!(error = %e, "ignoring new target");
            }
        }

        match state.begin_connect() {
            Ok(status) => shared.publish(status).await,
            Err(e) => {
                error!(error = %e, "supervisor in unexpected state");
                break 'session;
            }
        }

        let url = state.url().to_owned();
        let credential = state.credential().to_owned();
        info!(url = %url, attempt = state.attempt(), "connecting");

        let attempt = tokio::select! {
            _ = shared.cancel.cancelled() => break 'session,
            _ = shared.reconnect.notified() => {
                restart(&mut state, &shared).await;
                continue 'session;
            }
            result = WsClient::connect(
                connector.as_ref(),
                &url,
                &credential,
                shared.events_tx.clone(),
            ) => result,
        };

        match attempt {
            Ok((mut client, ha_version)) => {
                let requests = client.requests();

                // The subscription is issued before the status flips; its
                // result is awaited in the background.
                let subscription = match OutboundFrame::subscribe_state_changed().to_value() {
                    Ok(body) => requests.start(body).await,
                    Err(e) => Err(e.into()),
                };

                if let Err(e) = state.opened() {
                    error!(error = %e, "supervisor in unexpected state");
                    break 'session;
                }
                shared.set_live(Some(requests.clone()));
                shared.publish(ConnectionStatus::Connected).await;
                shared
                    .emit(ConnectionEvent::Opened {
                        ha_version: ha_version.clone(),
                    })
                    .await;
                client.deliver();
                info!(url = %url, ha_version = ?ha_version, "connected");

                tokio::spawn(after_open(
                    subscription,
                    requests,
                    config.fetch_initial_states,
                    client.cancel_token(),
                    shared.clone(),
                ));

                let (reason, wake) = tokio::select! {
                    _ = shared.cancel.cancelled() => {
                        (DisconnectReason::Shutdown, Some(Wake::Cancelled))
                    }
                    _ = shared.reconnect.notified() => {
                        (DisconnectReason::Shutdown, Some(Wake::Forced))
                    }
                    reason = client.closed() => (reason, None),
                };

                shared.set_live(None);
                client.shutdown().await;

                match wake {
                    Some(Wake::Cancelled) => break 'session,
                    Some(Wake::Forced) => {
                        shared.emit(ConnectionEvent::Closed(reason)).await;
                        restart(&mut state, &shared).await;
                        continue 'session;
                    }
                    None => {
                        warn!(url = %url, reason = %reason, "connection lost");
                        shared.emit(ConnectionEvent::Closed(reason)).await;
                        match state.channel_lost() {
                            Ok(status) => shared.publish(status).await,
                            Err(e) => {
                                error!(error = %e, "supervisor in unexpected state");
                                break 'session;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                let reported = match e {
                    WsError::AuthInvalid(message) => {
                        warn!(url = %url, message = %message, "authentication rejected");
                        ConnectionError::Auth(message)
                    }
                    other => {
                        warn!(url = %url, error = %other, "connection attempt failed");
                        ConnectionError::Transport(other.to_string())
                    }
                };
                shared.emit(ConnectionEvent::Error(reported)).await;
                match state.attempt_failed() {
                    Ok(status) => shared.publish(status).await,
                    Err(e) => {
                        error!(error = %e, "supervisor in unexpected state");
                        break 'session;
                    }
                }
            }
        }

        match state.schedule_retry(&config.reconnect) {
            Ok(RetryDecision::Wait { attempt, delay }) => {
                shared.publish(state.status().clone()).await;
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting"
                );
                tokio::select! {
                    _ = shared.cancel.cancelled() => {
                        debug!("reconnect cancelled");
                        break 'session;
                    }
                    _ = shared.reconnect.notified() => restart(&mut state, &shared).await,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Ok(RetryDecision::GiveUp { attempts }) => {
                warn!(attempts, "reconnect attempts exhausted, waiting for a manual reconnect");
                if *shared.status_tx.borrow() != *state.status() {
                    shared.publish(state.status().clone()).await;
                }
                shared
                    .emit(ConnectionEvent::Error(ConnectionError::RetriesExhausted {
                        attempts,
                    }))
                    .await;
                tokio::select! {
                    _ = shared.cancel.cancelled() => break 'session,
                    _ = shared.reconnect.notified() => restart(&mut state, &shared).await,
                }
            }
            Err(e) => {
                error!(error = %e, "supervisor in unexpected state");
                break 'session;
            }
        }
    }

    shared.set_live(None);
    let status = state.close();
    shared.status_tx.send_replace(status.clone());
    // The receiver may be full or gone by now; the watch already holds
    // the final status.
    if shared.events_tx.try_send(ConnectionEvent::Status(status)).is_err() {
        debug!("final status event not delivered");
    }
    info!("connection closed");
}

/// Forced restart: fresh backoff, next attempt starts immediately.
async fn restart(state: &mut ConnectionState, shared: &Shared) {
    info!("reconnect requested");
    match state.reset() {
        Ok(status) => shared.publish(status).await,
        Err(e) => warn!(error = %e, "cannot restart"),
    }
}

/// Waits for the subscription result, then fetches the initial snapshot.
async fn after_open(
    subscription: Result<crate::ws_client::PendingRequest, WsError>,
    requests: RequestChannel,
    fetch_initial_states: bool,
    cancel: CancellationToken,
    shared: Arc<Shared>,
) {
    let work = async {
        let subscription = subscription?;
        let id = subscription.id();
        subscription.wait().await?;
        debug!(id, "subscribed to state_changed");

        if fetch_initial_states {
            let states = requests
                .request(OutboundFrame::GetStates.to_value()?)
                .await?;
            let states = match states {
                Value::Array(items) => items,
                _ => {
                    warn!("get_states returned a non-list result");
                    Vec::new()
                }
            };
            debug!(count = states.len(), "initial states fetched");
            shared.emit(ConnectionEvent::Snapshot(states)).await;
        }
        Ok::<(), WsError>(())
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = work => {
            if let Err(e) = result {
                warn!(error = %e, "post-open request failed");
                shared
                    .emit(ConnectionEvent::Error(ConnectionError::Request(e.to_string())))
                    .await;
            }
        }
    }
}
