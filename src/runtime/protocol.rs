//! Wire shapes exchanged with the peer context. All JSON is camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Envelope, Priority};

pub const PING: &str = "PING";
pub const CHUNKED_MESSAGE: &str = "CHUNKED_MESSAGE";
pub const CHUNKED_MESSAGE_COMPLETE: &str = "CHUNKED_MESSAGE_COMPLETE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: i64,
}

impl PingRequest {
    pub fn now() -> Self {
        Self {
            kind: PING.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub can_receive_messages: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_info: Option<ContextInfo>,
}

impl PingReply {
    pub fn alive() -> Self {
        Self {
            success: true,
            context_info: Some(ContextInfo {
                can_receive_messages: true,
            }),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.success
            && self
                .context_info
                .as_ref()
                .map_or(true, |info| info.can_receive_messages)
    }
}

/// An envelope as it travels to the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: Uuid,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl From<&Envelope> for WireMessage {
    fn from(envelope: &Envelope) -> Self {
        Self {
            kind: envelope.kind.clone(),
            message_id: envelope.id,
            payload: envelope.payload.clone(),
            attempt: envelope.attempts,
            priority: envelope.priority,
            created_at: envelope.created_at,
        }
    }
}

/// Standard reply to a delivered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `false` marks a validation failure the sender must not retry.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl Reply {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            retryable: true,
        }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: Uuid,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub chunk: String,
    pub is_last: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkComplete {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: Uuid,
}

impl ChunkComplete {
    pub fn new(message_id: Uuid) -> Self {
        Self {
            kind: CHUNKED_MESSAGE_COMPLETE.to_string(),
            message_id,
        }
    }
}

/// Read the `type` discriminator of a raw message.
pub fn message_kind(message: &serde_json::Value) -> Option<&str> {
    message.get("type").and_then(|kind| kind.as_str())
}
