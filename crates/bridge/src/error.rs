use hassdash_connection::WsError;
use hassdash_history::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("connection error: {0}")]
    Connection(#[from] WsError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no hub URL in settings or bootstrap config")]
    MissingUrl,
}
