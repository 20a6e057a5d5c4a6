//! Inspection surface over a running bridge.

use std::future::Future;

use serde::Serialize;

use hassdash_connection::ConnectionStatus;
use hassdash_history::{HistoryPoint, HistoryStore, KvStore, Settings};

use crate::bridge::Bridge;
use crate::error::BridgeError;

/// Summary shown by diagnostics tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsReport {
    pub status: String,
    pub connection_url: Option<String>,
    pub has_credential: bool,
    pub entity_count: usize,
    pub history_capacity: usize,
}

/// Every stored record, settings included, as pretty-printed JSON keyed by
/// store key. Works without a running connection.
pub async fn export_json<S: KvStore>(history: &HistoryStore<S>) -> Result<String, BridgeError> {
    let records = history.export_all().await?;
    Ok(serde_json::to_string_pretty(&records)?)
}

/// Read access to connection and store state, plus a manual reconnect.
pub trait Diagnostics {
    fn status(&self) -> ConnectionStatus;

    fn settings(&self) -> impl Future<Output = Result<Settings, BridgeError>> + Send;

    /// Entity ids with recorded history, sorted.
    fn entities(&self) -> impl Future<Output = Result<Vec<String>, BridgeError>> + Send;

    fn entity_history(
        &self,
        entity_id: &str,
    ) -> impl Future<Output = Result<Vec<HistoryPoint>, BridgeError>> + Send;

    /// See [`export_json`].
    fn export(&self) -> impl Future<Output = Result<String, BridgeError>> + Send;

    fn reconnect(&self);

    fn report(&self) -> impl Future<Output = Result<DiagnosticsReport, BridgeError>> + Send;
}

impl<S: KvStore> Diagnostics for Bridge<S> {
    fn status(&self) -> ConnectionStatus {
        self.connection().current_status()
    }

    async fn settings(&self) -> Result<Settings, BridgeError> {
        Ok(self.history().get_settings().await?)
    }

    async fn entities(&self) -> Result<Vec<String>, BridgeError> {
        let mut keys = self.history().list_keys().await?;
        keys.sort();
        Ok(keys)
    }

    async fn entity_history(&self, entity_id: &str) -> Result<Vec<HistoryPoint>, BridgeError> {
        Ok(self.history().history(entity_id).await?)
    }

    async fn export(&self) -> Result<String, BridgeError> {
        export_json(self.history()).await
    }

    fn reconnect(&self) {
        self.connection().reconnect();
    }

    async fn report(&self) -> Result<DiagnosticsReport, BridgeError> {
        let settings = self.settings().await?;
        let entity_count = self.history().list_keys().await?.len();
        Ok(DiagnosticsReport {
            status: self.status().to_string(),
            has_credential: settings.credential.as_deref().is_some_and(|c| !c.is_empty()),
            connection_url: settings.connection_url,
            entity_count,
            history_capacity: self.history().capacity(),
        })
    }
}
