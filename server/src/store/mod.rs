//! Data-access collaborator consumed by the gateway modules.
//!
//! Every operation may suspend the caller; implementations backed by a
//! blocking driver run their work on the blocking pool.

pub mod records;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::auth::Principal;

pub use records::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Lock,
    #[error("blocking task failed: {0}")]
    Worker(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("record not found after write: {0}")]
    Missing(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait DataAccess: Send + Sync {
    // --- users ---

    /// Insert or refresh the profile row for an authenticated principal.
    async fn upsert_user(&self, principal: &Principal) -> StoreResult<()>;
    /// IDs from `user_ids` that have no user row.
    async fn missing_users(&self, user_ids: &[i64]) -> StoreResult<Vec<i64>>;
    async fn profile(&self, user_id: i64) -> StoreResult<Option<ProfileRecord>>;
    async fn update_profile(&self, user_id: i64, update: &ProfileUpdate) -> StoreResult<ProfileRecord>;

    // --- group chats ---

    async fn groups_for_user(&self, user_id: i64) -> StoreResult<Vec<i64>>;
    /// Create a group; the creator becomes its only admin.
    async fn create_group(&self, creator_id: i64, name: &str, member_ids: &[i64]) -> StoreResult<GroupRecord>;
    async fn is_group_member(&self, group_id: i64, user_id: i64) -> StoreResult<bool>;
    async fn is_group_admin(&self, group_id: i64, user_id: i64) -> StoreResult<bool>;
    async fn group_member_ids(&self, group_id: i64) -> StoreResult<Vec<i64>>;
    /// Returns the IDs that were not already members.
    async fn add_group_members(&self, group_id: i64, member_ids: &[i64]) -> StoreResult<Vec<i64>>;
    async fn remove_group_member(&self, group_id: i64, user_id: i64) -> StoreResult<bool>;
    /// Merge `settings` into the stored settings object and return the result.
    async fn update_group_settings(&self, group_id: i64, settings: &Value) -> StoreResult<Value>;

    // --- messages ---

    async fn save_group_message(&self, group_id: i64, sender_id: i64, message: NewMessage) -> StoreResult<MessageRecord>;
    async fn save_direct_message(&self, sender_id: i64, recipient_id: i64, message: NewMessage) -> StoreResult<MessageRecord>;
    async fn message(&self, message_id: i64) -> StoreResult<Option<MessageRecord>>;
    /// Record read receipts for messages inside `scope`; returns how many were new.
    async fn mark_messages_read(&self, reader_id: i64, scope: ReadScope, message_ids: &[i64]) -> StoreResult<u64>;
    async fn delete_message(&self, message_id: i64) -> StoreResult<bool>;

    // --- notifications ---

    async fn notifications(&self, user_id: i64, limit: u32, offset: u32) -> StoreResult<Vec<NotificationRecord>>;
    async fn create_notification(&self, user_id: i64, kind: &str, data: &Value) -> StoreResult<NotificationRecord>;
    /// Only rows owned by `user_id` are touched.
    async fn mark_notifications_read(&self, user_id: i64, notification_ids: &[i64]) -> StoreResult<u64>;
    async fn mark_all_notifications_read(&self, user_id: i64) -> StoreResult<u64>;

    // --- calls ---

    async fn create_call(&self, call: NewCall) -> StoreResult<CallRecord>;
    async fn call(&self, call_id: i64) -> StoreResult<Option<CallRecord>>;
    /// Move a call from `from` to `to`. False if the call was no longer in `from`.
    async fn set_call_status(&self, call_id: i64, from: CallStatus, to: CallStatus) -> StoreResult<bool>;

    // --- media ---

    async fn create_media(&self, owner_id: i64, media: NewMedia) -> StoreResult<MediaRecord>;
    async fn media(&self, media_id: i64) -> StoreResult<Option<MediaRecord>>;
    async fn mark_media_uploaded(&self, media_id: i64) -> StoreResult<()>;

    // --- contacts ---

    async fn add_contact(&self, user_id: i64, contact_id: i64) -> StoreResult<()>;
    async fn remove_contact(&self, user_id: i64, contact_id: i64) -> StoreResult<bool>;
    /// Users whose contact list includes `user_id`.
    async fn contact_of_ids(&self, user_id: i64) -> StoreResult<Vec<i64>>;
    async fn block_user(&self, user_id: i64, blocked_id: i64) -> StoreResult<()>;
    async fn unblock_user(&self, user_id: i64, blocked_id: i64) -> StoreResult<bool>;
    /// True if `blocker_id` has blocked `user_id`.
    async fn is_blocked(&self, blocker_id: i64, user_id: i64) -> StoreResult<bool>;
    async fn match_contacts(&self, user_id: i64, phone_numbers: &[String]) -> StoreResult<Vec<ContactRecord>>;

    // --- stories ---

    async fn create_story(&self, user_id: i64, story: NewStory) -> StoreResult<StoryRecord>;
    async fn story(&self, story_id: i64) -> StoreResult<Option<StoryRecord>>;
    async fn mark_story_viewed(&self, story_id: i64, viewer_id: i64) -> StoreResult<()>;
    async fn delete_story(&self, story_id: i64) -> StoreResult<bool>;
    /// Stories from the user's contacts created at or after `since`.
    async fn contact_stories(&self, user_id: i64, since: &str) -> StoreResult<Vec<StoryRecord>>;

    // --- devices and sync ---

    async fn register_device(&self, user_id: i64, device: DeviceInfo) -> StoreResult<()>;
    async fn unregister_device(&self, user_id: i64, device_id: &str) -> StoreResult<bool>;
    async fn sync_snapshot(&self, user_id: i64, since: Option<&str>) -> StoreResult<SyncSnapshot>;

    // --- settings and keys ---

    async fn update_settings(&self, user_id: i64, scope: SettingsScope, values: &Value) -> StoreResult<Value>;
    async fn store_public_key(&self, user_id: i64, recipient_id: i64, public_key: &str) -> StoreResult<()>;
    /// Latest key each owner exchanged with `recipient_id`.
    async fn public_keys(&self, owner_ids: &[i64], recipient_id: i64) -> StoreResult<BTreeMap<i64, String>>;
}
