//! WebSocket write pump: serialises outbound frames.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Writes queued frames until cancelled or the queue closes, then sends a
/// close frame.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            frame = queue.recv() => frame,
        };
        let Some(frame) = next else { break };

        if let Err(e) = sink.send(frame).await {
            error!(error = %e, "write failed, stopping write pump");
            break;
        }
        written += 1;
    }

    trace!(written, "write pump stopping");
    let _ = sink.send(tungstenite::Message::Close(None)).await;
}
