//! Service-call helpers built on [`ConnectionHandle::request`].

use serde_json::{Map, Value, json};
use tracing::warn;

use hassdash_protocol::OutboundFrame;

use crate::manager::ConnectionHandle;
use crate::ws_client::WsError;

impl ConnectionHandle {
    /// Calls `domain.service` with `service_data` and resolves with the
    /// hub's `result` payload.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Value,
    ) -> Result<Value, WsError> {
        let body = OutboundFrame::call_service(domain, service, service_data).to_value()?;
        self.request(body).await
    }

    /// Current state of every entity.
    pub async fn get_states(&self) -> Result<Vec<Value>, WsError> {
        match self.request(OutboundFrame::GetStates.to_value()?).await? {
            Value::Array(states) => Ok(states),
            _ => {
                warn!("get_states returned a non-list result");
                Ok(Vec::new())
            }
        }
    }

    pub async fn toggle_light(&self, entity_id: &str) -> Result<Value, WsError> {
        self.call_service("light", "toggle", target(entity_id)).await
    }

    /// Turns a light on, optionally at `brightness` (0-255).
    pub async fn turn_on_light(
        &self,
        entity_id: &str,
        brightness: Option<u8>,
    ) -> Result<Value, WsError> {
        let mut data = Map::new();
        data.insert("entity_id".into(), Value::from(entity_id));
        if let Some(brightness) = brightness {
            data.insert("brightness".into(), Value::from(brightness));
        }
        self.call_service("light", "turn_on", Value::Object(data)).await
    }

    pub async fn turn_off_light(&self, entity_id: &str) -> Result<Value, WsError> {
        self.call_service("light", "turn_off", target(entity_id)).await
    }

    pub async fn set_climate_temperature(
        &self,
        entity_id: &str,
        temperature: f64,
    ) -> Result<Value, WsError> {
        self.call_service(
            "climate",
            "set_temperature",
            json!({"entity_id": entity_id, "temperature": temperature}),
        )
        .await
    }

    pub async fn set_climate_mode(
        &self,
        entity_id: &str,
        hvac_mode: &str,
    ) -> Result<Value, WsError> {
        self.call_service(
            "climate",
            "set_hvac_mode",
            json!({"entity_id": entity_id, "hvac_mode": hvac_mode}),
        )
        .await
    }

    pub async fn activate_scene(&self, scene_id: &str) -> Result<Value, WsError> {
        self.call_service("scene", "turn_on", target(scene_id)).await
    }

    pub async fn run_script(&self, script_id: &str) -> Result<Value, WsError> {
        self.call_service("script", "turn_on", target(script_id)).await
    }

    pub async fn trigger_automation(&self, automation_id: &str) -> Result<Value, WsError> {
        self.call_service("automation", "trigger", target(automation_id)).await
    }
}

fn target(entity_id: &str) -> Value {
    json!({ "entity_id": entity_id })
}
