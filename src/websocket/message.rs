use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;

use crate::error::WebSocketError;

/// `type` tag of the server-originated presence frame.
pub const USER_LIST: &str = "user_list";

/// A serialized frame waiting in a session's outbound queue.
///
/// Shared so one presence snapshot can be queued to every session without
/// copying it per recipient.
pub type Frame = Arc<str>;

/// Signaling envelope relayed between peers.
///
/// `payload` is kept as raw JSON text and relayed byte for byte; the server
/// never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub target_user_id: String,
    #[serde(default)]
    pub payload: Option<Box<RawValue>>,
    /// Set by the registry on routed copies. Clients cannot supply it.
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub from_user_id: Option<String>,
}

impl Message {
    pub fn parse(text: &str) -> Result<Self, WebSocketError> {
        serde_json::from_str(text).map_err(|e| WebSocketError::MalformedMessage(e.to_string()))
    }

    pub fn to_frame(&self) -> Result<Frame, WebSocketError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| WebSocketError::MalformedMessage(format!("Failed to serialize message: {}", e)))
    }

    /// Stamp the sender identity onto the envelope, leaving `type` and `payload` alone.
    pub fn from_sender(mut self, user_id: &str) -> Self {
        self.from_user_id = Some(user_id.to_string());
        self
    }

}

// An explicit `null` target is a route miss, same as an absent one.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Snapshot of connected identities, pushed to every session on membership changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceList {
    #[serde(rename = "type")]
    pub kind: String,
    pub users: Vec<String>,
}

impl PresenceList {
    pub fn new(mut users: Vec<String>) -> Self {
        users.sort();
        Self {
            kind: USER_LIST.to_string(),
            users,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, WebSocketError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| WebSocketError::MalformedMessage(format!("Failed to serialize presence: {}", e)))
    }
}
