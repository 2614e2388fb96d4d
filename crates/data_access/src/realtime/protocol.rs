//! Frames of the realtime websocket.
//!
//! The service speaks Phoenix channels encoded as JSON text frames:
//! `{"topic", "event", "payload", "ref"}`. A client joins
//! `realtime:public:<table>` asking for `postgres_changes`, then receives one
//! `postgres_changes` frame per committed row change.

use api_types::{Collection, Record, change::ChangeEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::SubscriptionError;

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";
pub const HEARTBEAT: &str = "heartbeat";
pub const POSTGRES_CHANGES: &str = "postgres_changes";
pub const SYSTEM: &str = "system";
pub const PHOENIX_TOPIC: &str = "phoenix";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

/// Channel topic carrying the changes of `collection`.
pub fn topic(collection: Collection) -> String {
    format!("realtime:public:{collection}")
}

impl Frame {
    /// Join request for every change kind (`*`) of one table.
    pub fn join(collection: Collection, access_token: &str, reference: &str) -> Self {
        Self {
            topic: topic(collection),
            event: PHX_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": collection.as_str() }
                    ]
                },
                "access_token": access_token,
            }),
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: PHX_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    /// Whether this is the server's reply to the heartbeat sent with
    /// `reference`.
    pub fn acknowledges(&self, reference: &str) -> bool {
        self.topic == PHOENIX_TOPIC
            && self.event == PHX_REPLY
            && self.reference.as_deref() == Some(reference)
    }

    pub fn encode(&self) -> Result<String, SubscriptionError> {
        serde_json::to_string(self).map_err(|err| SubscriptionError::Decode(err.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, SubscriptionError> {
        serde_json::from_str(raw).map_err(|err| SubscriptionError::Decode(err.to_string()))
    }
}

/// Meaning of an incoming frame for the channel on `topic`.
#[derive(Debug, PartialEq)]
pub enum Incoming<T> {
    Change(ChangeEvent<T>),
    JoinAccepted,
    JoinRejected(String),
    Closed(String),
    Ignored,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

pub fn interpret<T: Record>(frame: &Frame, topic: &str) -> Result<Incoming<T>, SubscriptionError> {
    if frame.topic != topic {
        return Ok(Incoming::Ignored);
    }

    match frame.event.as_str() {
        PHX_REPLY => {
            let status = frame.payload.get("status").and_then(Value::as_str);
            if status == Some("ok") {
                Ok(Incoming::JoinAccepted)
            } else {
                Ok(Incoming::JoinRejected(reason(&frame.payload)))
            }
        }
        POSTGRES_CHANGES => {
            let data = frame
                .payload
                .get("data")
                .cloned()
                .ok_or_else(|| SubscriptionError::Decode("change without data".to_string()))?;
            let row: ChangeRow = serde_json::from_value(data)
                .map_err(|err| SubscriptionError::Decode(err.to_string()))?;
            change_from_row(row).map(Incoming::Change)
        }
        PHX_CLOSE => Ok(Incoming::Closed("channel closed by server".to_string())),
        PHX_ERROR => Ok(Incoming::Closed(reason(&frame.payload))),
        SYSTEM if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            Ok(Incoming::Closed(reason(&frame.payload)))
        }
        _ => Ok(Incoming::Ignored),
    }
}

fn reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .or_else(|| payload.get("reason"))
        .and_then(Value::as_str)
        .unwrap_or("unknown reason")
        .to_string()
}

fn change_from_row<T: Record>(row: ChangeRow) -> Result<ChangeEvent<T>, SubscriptionError> {
    let decode = |value: Value| {
        serde_json::from_value::<T>(value).map_err(|err| SubscriptionError::Decode(err.to_string()))
    };

    match row.kind.as_str() {
        "INSERT" => Ok(ChangeEvent::Inserted(decode(required(row.record)?)?)),
        "UPDATE" => Ok(ChangeEvent::Updated(decode(required(row.record)?)?)),
        "DELETE" => {
            let old = required(row.old_record)?;
            let id = old
                .get("id")
                .cloned()
                .ok_or_else(|| SubscriptionError::Decode("deleted row without id".to_string()))
                .and_then(|id| {
                    serde_json::from_value::<Uuid>(id)
                        .map_err(|err| SubscriptionError::Decode(err.to_string()))
                })?;
            // Only the primary key is sent unless the table has full replica identity.
            let prior = serde_json::from_value::<T>(old).ok();
            Ok(ChangeEvent::Deleted { id, prior })
        }
        other => Err(SubscriptionError::Decode(format!(
            "unknown change type {other}"
        ))),
    }
}

fn required(value: Option<Value>) -> Result<Value, SubscriptionError> {
    value
        .filter(|value| !value.is_null())
        .ok_or_else(|| SubscriptionError::Decode("change without row".to_string()))
}
