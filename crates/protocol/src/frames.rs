//! JSON frames exchanged with the hub.
//!
//! Inbound frames are dispatched on their `type` field. Anything with an
//! unrecognised type is kept as [`InboundFrame::Other`] so that responses to
//! arbitrary caller requests can still be routed by `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::EVENT_STATE_CHANGED;

/// Errors decoding or building a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no `type` field")]
    MissingType,
}

/// Error details carried by a failed `result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl HubError {
    fn unknown() -> Self {
        Self {
            code: "unknown_error".into(),
            message: "request failed".into(),
        }
    }
}

/// Body of an `event` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_fired: Option<String>,
}

impl EventPayload {
    pub fn is_state_changed(&self) -> bool {
        self.event_type == EVENT_STATE_CHANGED
    }
}

/// A decoded frame received from the hub.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Event {
        /// Id of the subscription that produced the event.
        #[serde(default)]
        id: Option<u64>,
        event: EventPayload,
    },
    Result {
        id: u64,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<HubError>,
    },
    Pong {
        id: u64,
    },
    /// Frame with a type this client does not model.
    #[serde(skip)]
    Other {
        kind: String,
        id: Option<u64>,
        frame: Value,
    },
}

const MODELED_TYPES: &[&str] = &[
    "auth_required",
    "auth_ok",
    "auth_invalid",
    "event",
    "result",
    "pong",
];

impl InboundFrame {
    /// Decodes a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Decodes an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        if MODELED_TYPES.contains(&kind) {
            return Ok(serde_json::from_value(value)?);
        }

        let kind = kind.to_owned();
        let id = obj.get("id").and_then(Value::as_u64);
        Ok(InboundFrame::Other {
            kind,
            id,
            frame: value,
        })
    }

    /// Correlation id, when the frame carries one.
    pub fn id(&self) -> Option<u64> {
        match self {
            InboundFrame::Event { id, .. } | InboundFrame::Other { id, .. } => *id,
            InboundFrame::Result { id, .. } | InboundFrame::Pong { id } => Some(*id),
            _ => None,
        }
    }

    /// The wire `type` of this frame.
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::AuthRequired { .. } => "auth_required",
            InboundFrame::AuthOk { .. } => "auth_ok",
            InboundFrame::AuthInvalid { .. } => "auth_invalid",
            InboundFrame::Event { .. } => "event",
            InboundFrame::Result { .. } => "result",
            InboundFrame::Pong { .. } => "pong",
            InboundFrame::Other { kind, .. } => kind,
        }
    }

    /// Converts a response frame into the value a requester receives.
    ///
    /// `result` frames with `success: false` become the hub's error;
    /// frames without a result body resolve to `null`.
    pub fn into_response(self) -> Result<Value, HubError> {
        match self {
            InboundFrame::Result {
                success: true,
                result,
                ..
            } => Ok(result.unwrap_or(Value::Null)),
            InboundFrame::Result { error, .. } => Err(error.unwrap_or_else(HubError::unknown)),
            InboundFrame::Other { frame, .. } => Ok(frame),
            _ => Ok(Value::Null),
        }
    }
}

/// A frame sent to the hub.
///
/// Request frames are serialised without an `id`; the connection assigns
/// one with [`with_id`] right before sending.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Auth {
        access_token: String,
    },
    SubscribeEvents {
        event_type: String,
    },
    CallService {
        domain: String,
        service: String,
        service_data: Value,
    },
    GetStates,
    Ping,
}

impl OutboundFrame {
    pub fn auth(credential: &str) -> Self {
        OutboundFrame::Auth {
            access_token: credential.to_owned(),
        }
    }

    pub fn subscribe_state_changed() -> Self {
        OutboundFrame::SubscribeEvents {
            event_type: EVENT_STATE_CHANGED.to_owned(),
        }
    }

    pub fn call_service(domain: &str, service: &str, service_data: Value) -> Self {
        OutboundFrame::CallService {
            domain: domain.to_owned(),
            service: service.to_owned(),
            service_data,
        }
    }

    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Stamps a correlation id onto a request body.
pub fn with_id(id: u64, body: Value) -> Result<Value, ProtocolError> {
    match body {
        Value::Object(mut map) => {
            map.insert("id".into(), Value::from(id));
            Ok(Value::Object(map))
        }
        _ => Err(ProtocolError::NotAnObject),
    }
}
