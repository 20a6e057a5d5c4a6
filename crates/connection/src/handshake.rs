//! Hub auth handshake.
//!
//! Runs directly on the raw channel before the pumps start: wait for
//! `auth_required`, answer with `auth`, then finish on `auth_ok` or fail on
//! `auth_invalid`.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use hassdash_protocol::constants::HANDSHAKE_TIMEOUT;
use hassdash_protocol::{InboundFrame, OutboundFrame};

use crate::transport::{FrameSink, FrameStream};
use crate::ws_client::WsError;

/// What the client does in response to one handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandshakeAction {
    SendAuth,
    Authenticated { ha_version: Option<String> },
    Rejected(String),
    Ignore,
}

pub(crate) fn step(frame: &InboundFrame) -> HandshakeAction {
    match frame {
        InboundFrame::AuthRequired { .. } => HandshakeAction::SendAuth,
        InboundFrame::AuthOk { ha_version } => HandshakeAction::Authenticated {
            ha_version: ha_version.clone(),
        },
        InboundFrame::AuthInvalid { message } => HandshakeAction::Rejected(
            message
                .clone()
                .unwrap_or_else(|| "invalid access token".into()),
        ),
        _ => HandshakeAction::Ignore,
    }
}

/// Performs the handshake. Returns the hub version reported in `auth_ok`.
pub(crate) async fn authenticate(
    sink: &mut FrameSink,
    stream: &mut FrameStream,
    credential: &str,
) -> Result<Option<String>, WsError> {
    let deadline = tokio::time::sleep(HANDSHAKE_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        let msg = tokio::select! {
            () = &mut deadline => return Err(WsError::HandshakeTimeout),
            msg = stream.next() => msg,
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Ping(data))) => {
                sink.send(Message::Pong(data)).await?;
                continue;
            }
            Some(Ok(Message::Close(_))) | None => return Err(WsError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        let frame = match InboundFrame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed handshake frame");
                continue;
            }
        };

        match step(&frame) {
            HandshakeAction::SendAuth => {
                let auth = OutboundFrame::auth(credential).to_value()?;
                sink.send(Message::Text(auth.to_string().into())).await?;
                debug!(with_token = !credential.is_empty(), "auth sent");
            }
            HandshakeAction::Authenticated { ha_version } => {
                debug!(ha_version = ?ha_version, "authenticated");
                return Ok(ha_version);
            }
            HandshakeAction::Rejected(message) => return Err(WsError::AuthInvalid(message)),
            HandshakeAction::Ignore => {
                trace!(kind = frame.kind(), "ignoring frame during handshake");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_tungstenite::tungstenite;

    use super::*;
    use crate::transport::testing::channel_pair;

    fn text(value: serde_json::Value) -> Result<Message, tungstenite::Error> {
        Ok(Message::Text(value.to_string().into()))
    }

    #[test]
    fn step_maps_frames_to_actions() {
        assert_eq!(
            step(&InboundFrame::AuthRequired { ha_version: None }),
            HandshakeAction::SendAuth
        );
        assert_eq!(
            step(&InboundFrame::AuthOk {
                ha_version: Some("2024.6.0".into())
            }),
            HandshakeAction::Authenticated {
                ha_version: Some("2024.6.0".into())
            }
        );
        assert_eq!(
            step(&InboundFrame::AuthInvalid { message: None }),
            HandshakeAction::Rejected("invalid access token".into())
        );
        assert_eq!(
            step(&InboundFrame::Pong { id: 1 }),
            HandshakeAction::Ignore
        );
    }

    #[tokio::test]
    async fn sends_credential_after_auth_required() {
        let (mut sink, mut stream, mut sent, inbound) = channel_pair();
        inbound
            .send(text(json!({"type": "auth_required", "ha_version": "2024.6.0"})))
            .unwrap();
        inbound.send(text(json!({"type": "auth_ok", "ha_version": "2024.6.0"}))).unwrap();

        let version = authenticate(&mut sink, &mut stream, "tok").await.unwrap();
        assert_eq!(version.as_deref(), Some("2024.6.0"));

        let auth = sent.recv().await.unwrap();
        let auth: serde_json::Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
        assert_eq!(auth, json!({"type": "auth", "access_token": "tok"}));
    }

    #[tokio::test]
    async fn empty_credential_is_sent_as_empty_string() {
        let (mut sink, mut stream, mut sent, inbound) = channel_pair();
        inbound.send(text(json!({"type": "auth_required"}))).unwrap();
        inbound.send(text(json!({"type": "auth_ok"}))).unwrap();

        authenticate(&mut sink, &mut stream, "").await.unwrap();

        let auth = sent.recv().await.unwrap();
        let auth: serde_json::Value = serde_json::from_str(auth.to_text().unwrap()).unwrap();
        assert_eq!(auth["access_token"], "");
    }

    #[tokio::test]
    async fn auth_invalid_fails_the_attempt() {
        let (mut sink, mut stream, _sent, inbound) = channel_pair();
        inbound.send(text(json!({"type": "auth_required"}))).unwrap();
        inbound
            .send(text(json!({"type": "auth_invalid", "message": "Invalid password"})))
            .unwrap();

        let err = authenticate(&mut sink, &mut stream, "bad").await.unwrap_err();
        assert!(matches!(err, WsError::AuthInvalid(ref m) if m == "Invalid password"));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (mut sink, mut stream, _sent, inbound) = channel_pair();
        inbound.send(Ok(Message::Text("garbage {{".into()))).unwrap();
        inbound.send(text(json!({"type": "auth_required"}))).unwrap();
        inbound.send(text(json!({"type": "auth_ok"}))).unwrap();

        assert!(authenticate(&mut sink, &mut stream, "tok").await.is_ok());
    }

    #[tokio::test]
    async fn stream_end_is_closed() {
        let (mut sink, mut stream, _sent, inbound) = channel_pair();
        drop(inbound);
        let err = authenticate(&mut sink, &mut stream, "tok").await.unwrap_err();
        assert!(matches!(err, WsError::Closed));
    }

    #[tokio::test]
    async fn silent_hub_times_out() {
        tokio::time::pause();
        let (mut sink, mut stream, _sent, _inbound) = channel_pair();
        let err = authenticate(&mut sink, &mut stream, "tok").await.unwrap_err();
        assert!(matches!(err, WsError::HandshakeTimeout));
    }
}
