//! JSON frames exchanged with gateway clients.
//!
//! Unicast frames carry a `type` tag (`connected`, `ping`, `success`, `error`).
//! Group broadcasts carry `broadcast: true` and no `type`.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::auth::Principal;

/// Current server time as an ISO-8601 string.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Error codes surfaced to clients verbatim in the `code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidJson,
    InvalidAction,
    ModuleNotFound,
    ActionNotFound,
    Unauthorized,
    InvalidInput,
    NotFound,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidJson => "INVALID_JSON",
            Self::InvalidAction => "INVALID_ACTION",
            Self::ModuleNotFound => "MODULE_NOT_FOUND",
            Self::ActionNotFound => "ACTION_NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frames addressed to a single connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        user_id: i64,
        timestamp: String,
    },
    Ping,
    Success {
        broadcast: bool,
        action: String,
        data: Value,
        timestamp: String,
        sender: Option<Principal>,
    },
    Error {
        code: ErrorKind,
        message: String,
        timestamp: String,
    },
}

impl ServerFrame {
    pub fn connected(user_id: i64) -> Self {
        Self::Connected {
            user_id,
            timestamp: timestamp(),
        }
    }

    pub fn success(action: &str, data: Value, sender: Option<Principal>) -> Self {
        Self::Success {
            broadcast: false,
            action: action.to_string(),
            data,
            timestamp: timestamp(),
            sender,
        }
    }

    pub fn error(code: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            timestamp: timestamp(),
        }
    }
}

/// Event kinds published to broadcast groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BroadcastAction {
    #[serde(rename = "group.created")]
    GroupCreated,
    #[serde(rename = "send.message")]
    SendMessage,
    #[serde(rename = "group.typing")]
    GroupTyping,
    #[serde(rename = "group.read_receipt")]
    GroupReadReceipt,
    #[serde(rename = "group.members_added")]
    GroupMembersAdded,
    #[serde(rename = "group.member_removed")]
    GroupMemberRemoved,
    #[serde(rename = "group.member_left")]
    GroupMemberLeft,
    #[serde(rename = "group.settings_updated")]
    GroupSettingsUpdated,
    #[serde(rename = "direct.message")]
    DirectMessage,
    #[serde(rename = "direct.message_sent")]
    DirectMessageSent,
    #[serde(rename = "direct.typing")]
    DirectTyping,
    #[serde(rename = "direct.read_receipt")]
    DirectReadReceipt,
    #[serde(rename = "direct.message_deleted")]
    DirectMessageDeleted,
    #[serde(rename = "notification.new")]
    NotificationNew,
    #[serde(rename = "call.incoming")]
    CallIncoming,
    #[serde(rename = "call.answered")]
    CallAnswered,
    #[serde(rename = "call.rejected")]
    CallRejected,
    #[serde(rename = "call.ended")]
    CallEnded,
    #[serde(rename = "call.webrtc_signal")]
    CallWebrtcSignal,
    #[serde(rename = "contact.added")]
    ContactAdded,
    #[serde(rename = "story.new")]
    StoryNew,
    #[serde(rename = "story.viewed")]
    StoryViewed,
    #[serde(rename = "story.deleted")]
    StoryDeleted,
    #[serde(rename = "sync.device_removed")]
    SyncDeviceRemoved,
    #[serde(rename = "settings.updated")]
    SettingsUpdated,
    #[serde(rename = "encryption.key_exchange")]
    EncryptionKeyExchange,
    #[serde(rename = "profile.updated")]
    ProfileUpdated,
}

/// A group broadcast. `sender` is always present on the wire, `null` when
/// the event has no authenticated origin.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEnvelope {
    pub broadcast: bool,
    pub action: BroadcastAction,
    pub payload: Value,
    pub timestamp: String,
    pub sender: Option<Principal>,
}

impl BroadcastEnvelope {
    pub fn new(action: BroadcastAction, payload: Value, sender: Option<Principal>) -> Self {
        Self {
            broadcast: true,
            action,
            payload,
            timestamp: timestamp(),
            sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_frame_shape() {
        let value = serde_json::to_value(ServerFrame::Ping).unwrap();
        assert_eq!(value, json!({"type": "ping"}));
    }

    #[test]
    fn test_error_frame_uses_wire_code() {
        let value = serde_json::to_value(ServerFrame::error(ErrorKind::ModuleNotFound, "nope")).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "MODULE_NOT_FOUND");
        assert_eq!(value["message"], "nope");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_success_without_sender_keeps_null_key() {
        let value = serde_json::to_value(ServerFrame::success("WS:A:B", json!({"x": 1}), None)).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("sender"));
        assert!(object["sender"].is_null());
        assert_eq!(object["broadcast"], false);
        assert_eq!(object["action"], "WS:A:B");
    }

    #[test]
    fn test_broadcast_envelope_shape() {
        let sender = Principal {
            id: 1,
            username: "amy".to_string(),
            full_name: "Amy Pond".to_string(),
            picture_url: Some("https://cdn.example/amy.png".to_string()),
        };
        let envelope = BroadcastEnvelope::new(BroadcastAction::SendMessage, json!({"k": "v"}), Some(sender));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["broadcast"], true);
        assert_eq!(value["action"], "send.message");
        assert_eq!(value["sender"]["id"], 1);
        assert_eq!(value["sender"]["picture_url"], "https://cdn.example/amy.png");
        assert!(value.get("type").is_none());
    }

    #[test]
    fn test_error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::InvalidJson,
            ErrorKind::InvalidAction,
            ErrorKind::ModuleNotFound,
            ErrorKind::ActionNotFound,
            ErrorKind::Unauthorized,
            ErrorKind::InvalidInput,
            ErrorKind::NotFound,
            ErrorKind::InternalError,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.to_string()));
        }
    }
}
