//! The persisted settings record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::history::HistoryStore;
use crate::kv::KvStore;

/// Store key of the settings record.
pub const SETTINGS_KEY: &str = "settings";

/// Connection target plus fields owned by the UI (widget layout and the
/// like), kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "wsUrl", default, skip_serializing_if = "Option::is_none")]
    pub connection_url: Option<String>,
    #[serde(rename = "token", default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    pub fn new(connection_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            connection_url: Some(connection_url.into()),
            credential: Some(credential.into()),
            extra: Map::new(),
        }
    }

    /// Nothing set at all.
    pub fn is_empty(&self) -> bool {
        self.connection_url.is_none() && self.credential.is_none() && self.extra.is_empty()
    }
}

impl<S: KvStore> HistoryStore<S> {
    /// The saved settings, or an empty record if none were saved.
    pub async fn get_settings(&self) -> StorageResult<Settings> {
        match self.backend().get(SETTINGS_KEY).await? {
            None | Some(Value::Null) => Ok(Settings::default()),
            Some(value) => serde_json::from_value(value).map_err(|source| StorageError::Corrupt {
                key: SETTINGS_KEY.to_owned(),
                source,
            }),
        }
    }

    /// Replaces the settings record.
    pub async fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        let _guard = self.lock_key(SETTINGS_KEY).await;
        self.backend()
            .set(SETTINGS_KEY, serde_json::to_value(settings)?)
            .await?;
        debug!(has_url = settings.connection_url.is_some(), "settings saved");
        Ok(())
    }

    /// Removes the settings record; later reads return the empty record.
    pub async fn clear_settings(&self) -> StorageResult<()> {
        let _guard = self.lock_key(SETTINGS_KEY).await;
        self.backend().remove(SETTINGS_KEY).await?;
        info!("settings cleared");
        Ok(())
    }
}
