//! Keepalive pump: periodic protocol-level `ping` frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use hassdash_protocol::constants::PING_PERIOD;

/// Sends `{"id": n, "type": "ping"}` every [`PING_PERIOD`]. Ids come from
/// the same counter as requests. The hub's `pong` keeps the read deadline
/// alive.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    ids: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(PING_PERIOD);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let id = ids.fetch_add(1, Ordering::Relaxed);
                let ping = json!({"id": id, "type": "ping"});
                trace!(id, "sending ping");
                if write_tx
                    .send(tungstenite::Message::Text(ping.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
