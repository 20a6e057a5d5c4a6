//! WebSocket read pump: dispatches incoming frames.

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use hassdash_protocol::constants::{MAX_MESSAGE_SIZE, READ_IDLE_TIMEOUT};
use hassdash_protocol::{ChangeEvent, InboundFrame};

use crate::types::{ConnectionEvent, DisconnectReason};
use crate::ws_client::Pending;

/// Reads frames until the channel ends and reports why it ended.
///
/// Any incoming frame resets the idle deadline; if nothing arrives within
/// [`READ_IDLE_TIMEOUT`] the channel is considered dead.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Pending,
    events_tx: mpsc::Sender<ConnectionEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) -> DisconnectReason
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let idle_deadline = tokio::time::sleep(READ_IDLE_TIMEOUT);
    tokio::pin!(idle_deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return DisconnectReason::Shutdown,

            () = &mut idle_deadline => {
                warn!("nothing received within the read deadline, closing");
                return DisconnectReason::IdleTimeout;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        idle_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + READ_IDLE_TIMEOUT);

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text_message(&text, &pending, &events_tx).await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Close(frame) => {
                                debug!(frame = ?frame, "received close frame");
                                return match frame {
                                    Some(f) => DisconnectReason::Closed {
                                        code: Some(u16::from(f.code)),
                                        reason: f.reason.as_str().to_owned(),
                                    },
                                    None => DisconnectReason::Closed {
                                        code: None,
                                        reason: String::new(),
                                    },
                                };
                            }
                            _ => {} // Binary and transport pongs.
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        return DisconnectReason::Transport(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        return DisconnectReason::StreamEnded;
                    }
                }
            }
        }
    }
}

/// Handles one text frame: `state_changed` events go to the event stream,
/// everything else carrying an id resolves the matching pending request.
async fn handle_text_message(
    text: &str,
    pending: &Pending,
    events_tx: &mpsc::Sender<ConnectionEvent>,
) {
    if text.len() > MAX_MESSAGE_SIZE {
        warn!("message too large ({} bytes), dropping", text.len());
        return;
    }

    let frame = match InboundFrame::parse(text) {
        Ok(f) => f,
        Err(e) => {
            warn!("failed to parse frame: {e}");
            return;
        }
    };

    if let InboundFrame::Event { event, .. } = &frame {
        match ChangeEvent::from_payload(event, Utc::now()) {
            Some(change) => {
                trace!(entity_id = %change.entity_id, "state changed");
                let _ = events_tx.send(ConnectionEvent::StateChanged(change)).await;
            }
            None => trace!(event_type = %event.event_type, "ignoring event"),
        }
        return;
    }

    let Some(id) = frame.id() else {
        trace!(kind = frame.kind(), "ignoring frame without id");
        return;
    };

    let mut map = pending.lock().await;
    match map.remove(&id) {
        Some(tx) => {
            let _ = tx.send(frame);
        }
        None => trace!(id, kind = frame.kind(), "no pending request for frame"),
    }
}
