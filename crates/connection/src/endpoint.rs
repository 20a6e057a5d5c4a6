//! Hub endpoint normalisation.

use tokio_tungstenite::tungstenite::http::Uri;

use hassdash_protocol::constants::WEBSOCKET_PATH;

use crate::ws_client::WsError;

/// Turns a user-supplied hub address into the WebSocket API endpoint.
///
/// Accepts `http(s)://host[:port]`, `ws(s)://host[:port]` and full
/// `.../api/websocket` URLs. `http` maps to `ws` and `https` to `wss`.
pub fn websocket_url(input: &str) -> Result<String, WsError> {
    let trimmed = input.trim();
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| WsError::InvalidUrl(format!("missing scheme: {trimmed:?}")))?;

    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(WsError::InvalidUrl(format!("unsupported scheme {other:?}"))),
    };

    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(WsError::InvalidUrl(format!("missing host: {trimmed:?}")));
    }

    let mut url = format!("{scheme}://{rest}");
    if !url.ends_with(WEBSOCKET_PATH) {
        url.push_str(WEBSOCKET_PATH);
    }

    let uri: Uri = url
        .parse()
        .map_err(|e| WsError::InvalidUrl(format!("{trimmed:?}: {e}")))?;
    if uri.host().is_none_or(str::is_empty) {
        return Err(WsError::InvalidUrl(format!("missing host: {trimmed:?}")));
    }

    Ok(url)
}

/// Endpoint for the ingress variant: the API is reached through the
/// origin that served the page, and the proxy authenticates.
pub fn ingress_url(page_origin: &str) -> Result<String, WsError> {
    websocket_url(page_origin)
}
