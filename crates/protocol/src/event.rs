use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frames::EventPayload;

/// An observed entity state transition, normalised from a `state_changed`
/// event.
///
/// When the entity was removed (`new_state: null`), `new_state` carries the
/// whole event `data` instead, so the removal is still delivered and
/// recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entity_id: String,
    pub new_state: Value,
    /// Arrival time at this client, not the hub's `time_fired`.
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Unwraps a `state_changed` payload received at `arrived`.
    ///
    /// Returns `None` for other event types and payloads without an entity
    /// id.
    pub fn from_payload(payload: &EventPayload, arrived: DateTime<Utc>) -> Option<Self> {
        if !payload.is_state_changed() {
            return None;
        }
        let entity_id = payload.data.get("entity_id")?.as_str()?;
        let new_state = match payload.data.get("new_state") {
            Some(state) if !state.is_null() => state.clone(),
            _ => payload.data.clone(),
        };
        Some(Self {
            entity_id: entity_id.to_owned(),
            new_state,
            timestamp: arrived,
        })
    }

    /// The entity was removed from the hub.
    pub fn is_removal(&self) -> bool {
        self.new_state.as_object().is_some_and(|data| {
            data.contains_key("entity_id") && data.get("new_state").is_some_and(Value::is_null)
        })
    }
}
