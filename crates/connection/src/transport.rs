//! Transport seam between the connection manager and the network.
//!
//! The supervisor, handshake and pumps only see a boxed sink/stream pair of
//! WebSocket messages, so the whole connection lifecycle can run against
//! in-memory channels.

use std::pin::Pin;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

use hassdash_protocol::constants::MAX_MESSAGE_SIZE;

use crate::ws_client::WsError;

/// Outbound half of a channel.
pub type FrameSink = Pin<Box<dyn Sink<tungstenite::Message, Error = tungstenite::Error> + Send>>;

/// Inbound half of a channel.
pub type FrameStream =
    Pin<Box<dyn Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Send>>;

/// Opens duplex message channels to a URL.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>>;
}

/// Real WebSocket transport over `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), WsError>> {
        Box::pin(async move {
            let mut ws_config = WebSocketConfig::default();
            ws_config.max_message_size = Some(MAX_MESSAGE_SIZE);
            ws_config.max_frame_size = Some(MAX_MESSAGE_SIZE);
            let (ws_stream, response) =
                tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
            debug!(url, status = %response.status(), "websocket channel open");

            let (write, read) = ws_stream.split();
            let sink: FrameSink = Box::pin(write);
            let stream: FrameStream = Box::pin(read);
            Ok((sink, stream))
        })
    }
}
