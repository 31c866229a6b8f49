use crate::models::{Layer, Point};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// The closed set of wire event types. Anything else fails frame decoding.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Heartbeat,
    ReqStateSync,
    Hello,
    Presence,
    StateSync,
    RoomSettings,
    Undo,
    Redo,
    TokenCreate,
    TokenMove,
    TokenDelete,
    TokenRename,
    TokenSetSize,
    TokenAssign,
    TokenSetLock,
    TokenBadgeToggle,
    StrokeAdd,
    StrokeDelete,
    StrokeSetLock,
    EraseAt,
    ShapeAdd,
    ShapeDelete,
    ShapeSetLock,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Heartbeat => "HEARTBEAT",
            EventType::ReqStateSync => "REQ_STATE_SYNC",
            EventType::Hello => "HELLO",
            EventType::Presence => "PRESENCE",
            EventType::StateSync => "STATE_SYNC",
            EventType::RoomSettings => "ROOM_SETTINGS",
            EventType::Undo => "UNDO",
            EventType::Redo => "REDO",
            EventType::TokenCreate => "TOKEN_CREATE",
            EventType::TokenMove => "TOKEN_MOVE",
            EventType::TokenDelete => "TOKEN_DELETE",
            EventType::TokenRename => "TOKEN_RENAME",
            EventType::TokenSetSize => "TOKEN_SET_SIZE",
            EventType::TokenAssign => "TOKEN_ASSIGN",
            EventType::TokenSetLock => "TOKEN_SET_LOCK",
            EventType::TokenBadgeToggle => "TOKEN_BADGE_TOGGLE",
            EventType::StrokeAdd => "STROKE_ADD",
            EventType::StrokeDelete => "STROKE_DELETE",
            EventType::StrokeSetLock => "STROKE_SET_LOCK",
            EventType::EraseAt => "ERASE_AT",
            EventType::ShapeAdd => "SHAPE_ADD",
            EventType::ShapeDelete => "SHAPE_DELETE",
            EventType::ShapeSetLock => "SHAPE_SET_LOCK",
            EventType::Error => "ERROR",
        }
    }
}

/// One wire frame, both directions. `client_id` from clients is advisory
/// only; the server always speaks for the authenticated identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
}

impl WireEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        WireEvent {
            event_type,
            payload,
            client_id: None,
            ts: None,
        }
    }

    pub fn error(message: &str) -> Self {
        WireEvent::new(EventType::Error, serde_json::json!({ "message": message }))
    }

    /// An ERROR carrying the entity id the client referenced.
    pub fn error_for(message: &str, id: &str) -> Self {
        WireEvent::new(
            EventType::Error,
            serde_json::json!({ "message": message, "id": id }),
        )
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("wire event serializes")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Decode an inbound payload into its strict per-type shape. Unknown fields
/// are rejected, which surfaces as a validation ERROR to the sender.
pub fn parse_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(payload.clone())
}

// --- Inbound payload shapes ---

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenCreatePayload {
    pub id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenMovePayload {
    pub id: String,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub commit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenIdPayload {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenRenamePayload {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenSetSizePayload {
    pub id: String,
    pub size_scale: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenAssignPayload {
    pub id: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetLockPayload {
    pub id: String,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenBadgeTogglePayload {
    pub id: String,
    pub badge: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrokeAddPayload {
    pub id: String,
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub layer: Layer,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrokeDeletePayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EraseAtPayload {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub r: Option<f64>,
    #[serde(default)]
    pub erase_shapes: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShapeAddPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub x1: f64,
    #[serde(default)]
    pub y1: f64,
    #[serde(default)]
    pub x2: f64,
    #[serde(default)]
    pub y2: f64,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub fill: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub layer: Layer,
}

/// Room settings update. Only the fields listed here may appear; absent
/// fields are left unchanged. `background_url` distinguishes "absent" from
/// an explicit null (which clears the URL), hence the raw `Value`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomSettingsPayload {
    #[serde(default)]
    pub allow_players_move: Option<bool>,
    #[serde(default)]
    pub allow_all_move: Option<bool>,
    #[serde(default)]
    pub lockdown: Option<bool>,
    #[serde(default)]
    pub background_url: Option<Value>,
    #[serde(default)]
    pub layer_visibility: Option<HashMap<String, bool>>,
}
