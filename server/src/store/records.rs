/// Row types exchanged with the data-access layer.
/// Records serialize directly into reply and broadcast payloads.
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileRecord {
    pub id: i64,
    pub username: String,
    pub full_name: String,
    pub picture_url: Option<String>,
    pub bio: Option<String>,
    pub phone_number: Option<String>,
}

/// Editable profile fields. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub picture_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupRecord {
    pub id: i64,
    pub name: String,
    pub created_by: i64,
    pub member_ids: Vec<i64>,
    pub settings: Value,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub content: String,
    pub message_type: String,
    pub reply_to: Option<i64>,
}

/// The conversation a batch of read receipts belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope {
    Group(i64),
    /// Direct messages from `sender_id` to the reader.
    Direct { sender_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub chatroom_id: Option<i64>,
    pub sender_id: i64,
    pub recipient_id: Option<i64>,
    pub content: String,
    pub message_type: String,
    pub reply_to: Option<i64>,
    pub deleted: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub data: Value,
    pub is_read: bool,
    pub created_at: String,
}

/// Lifecycle of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Rejected,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(Self::Ringing),
            "active" => Some(Self::Active),
            "rejected" => Some(Self::Rejected),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }

    /// ringing -> active | rejected | ended, active -> ended.
    pub fn can_become(self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Ringing, Self::Active)
                | (Self::Ringing, Self::Rejected)
                | (Self::Ringing, Self::Ended)
                | (Self::Active, Self::Ended)
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewCall {
    pub caller_id: i64,
    pub recipient_id: Option<i64>,
    pub group_id: Option<i64>,
    pub call_type: String,
    /// Everyone allowed to answer, reject, end or signal, caller included.
    pub participants: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub id: i64,
    pub caller_id: i64,
    pub recipient_id: Option<i64>,
    pub group_id: Option<i64>,
    pub call_type: String,
    pub status: CallStatus,
    pub participants: Vec<i64>,
    pub created_at: String,
}

impl CallRecord {
    pub fn is_participant(&self, user_id: i64) -> bool {
        self.participants.contains(&user_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewMedia {
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaRecord {
    pub id: i64,
    pub owner_id: i64,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub mime_type: Option<String>,
    pub uploaded: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactRecord {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub picture_url: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewStory {
    pub media_id: Option<i64>,
    pub caption: Option<String>,
    pub media_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryRecord {
    pub id: i64,
    pub user_id: i64,
    pub media_id: Option<i64>,
    pub caption: Option<String>,
    pub media_type: String,
    pub view_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSnapshot {
    pub messages: Vec<MessageRecord>,
    pub notifications: Vec<NotificationRecord>,
    pub group_ids: Vec<i64>,
    pub server_time: String,
}

/// Which settings document an update applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsScope {
    General,
    Privacy,
    Notifications,
}

impl SettingsScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Privacy => "privacy",
            Self::Notifications => "notifications",
        }
    }
}
