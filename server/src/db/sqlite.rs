//! SQLite-backed implementation of the data-access collaborator.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::auth::Principal;
use crate::store::*;

use super::DbPool;

const SYNC_MESSAGE_LIMIT: i64 = 500;

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Shallow merge of `patch` into `base`. Non-object values replace the base.
fn merge_object(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base), Some(patch)) => {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}

fn parse_json(text: String) -> Value {
    serde_json::from_str(&text).unwrap_or_else(|_| Value::Object(Default::default()))
}

const MESSAGE_COLUMNS: &str =
    "id, room_id, sender_id, recipient_id, content, message_type, reply_to, deleted, created_at";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        chatroom_id: row.get(1)?,
        sender_id: row.get(2)?,
        recipient_id: row.get(3)?,
        content: row.get(4)?,
        message_type: row.get(5)?,
        reply_to: row.get(6)?,
        deleted: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationRecord> {
    Ok(NotificationRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        data: parse_json(row.get(3)?),
        is_read: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaRecord> {
    Ok(MediaRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get(3)?,
        file_type: row.get(4)?,
        mime_type: row.get(5)?,
        uploaded: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const STORY_SELECT: &str = "SELECT s.id, s.user_id, s.media_id, s.caption, s.media_type,
        (SELECT COUNT(*) FROM story_views v WHERE v.story_id = s.id), s.created_at
     FROM stories s";

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<StoryRecord> {
    Ok(StoryRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        media_id: row.get(2)?,
        caption: row.get(3)?,
        media_type: row.get(4)?,
        view_count: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<ProfileRecord> {
    Ok(ProfileRecord {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        picture_url: row.get(3)?,
        bio: row.get(4)?,
        phone_number: row.get(5)?,
    })
}

fn load_profile(conn: &Connection, user_id: i64) -> rusqlite::Result<Option<ProfileRecord>> {
    conn.query_row(
        "SELECT id, username, full_name, picture_url, bio, phone_number FROM users WHERE id = ?1",
        params![user_id],
        profile_from_row,
    )
    .optional()
}

fn load_message(conn: &Connection, message_id: i64) -> rusqlite::Result<Option<MessageRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        params![message_id],
        message_from_row,
    )
    .optional()
}

fn load_member_ids(conn: &Connection, room_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM chat_participants WHERE room_id = ?1 ORDER BY user_id")?;
    let ids = stmt
        .query_map(params![room_id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn load_call(conn: &Connection, call_id: i64) -> StoreResult<Option<CallRecord>> {
    let row = conn
        .query_row(
            "SELECT id, caller_id, recipient_id, room_id, call_type, status, created_at
             FROM calls WHERE id = ?1",
            params![call_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((id, caller_id, recipient_id, group_id, call_type, status, created_at)) = row else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT user_id FROM call_participants WHERE call_id = ?1 ORDER BY user_id")?;
    let participants = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;

    Ok(Some(CallRecord {
        id,
        caller_id,
        recipient_id,
        group_id,
        call_type,
        status: CallStatus::parse(&status).unwrap_or(CallStatus::Ended),
        participants,
        created_at,
    }))
}

fn insert_message(
    conn: &Connection,
    room_id: Option<i64>,
    sender_id: i64,
    recipient_id: Option<i64>,
    message: NewMessage,
) -> StoreResult<MessageRecord> {
    conn.execute(
        "INSERT INTO messages (room_id, sender_id, recipient_id, content, message_type, reply_to, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            room_id,
            sender_id,
            recipient_id,
            message.content,
            message.message_type,
            message.reply_to,
            now()
        ],
    )?;
    load_message(conn, conn.last_insert_rowid())?.ok_or(StoreError::Missing("message"))
}

/// `DataAccess` over a single shared SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| StoreError::Lock)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

#[async_trait]
impl DataAccess for SqliteStore {
    async fn upsert_user(&self, principal: &Principal) -> StoreResult<()> {
        let principal = principal.clone();
        self.run(move |conn| {
            let now = now();
            conn.execute(
                "INSERT INTO users (id, username, full_name, picture_url, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    username = excluded.username,
                    full_name = excluded.full_name,
                    picture_url = excluded.picture_url,
                    updated_at = excluded.updated_at",
                params![principal.id, principal.username, principal.full_name, principal.picture_url, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn missing_users(&self, user_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let ids: BTreeSet<i64> = user_ids.iter().copied().collect();
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
            let mut missing = Vec::new();
            for id in ids {
                if !stmt.exists(params![id])? {
                    missing.push(id);
                }
            }
            Ok(missing)
        })
        .await
    }

    async fn profile(&self, user_id: i64) -> StoreResult<Option<ProfileRecord>> {
        self.run(move |conn| Ok(load_profile(conn, user_id)?)).await
    }

    async fn update_profile(&self, user_id: i64, update: &ProfileUpdate) -> StoreResult<ProfileRecord> {
        let update = update.clone();
        self.run(move |conn| {
            conn.execute(
                "UPDATE users SET
                    full_name = COALESCE(?2, full_name),
                    picture_url = COALESCE(?3, picture_url),
                    bio = COALESCE(?4, bio),
                    phone_number = COALESCE(?5, phone_number),
                    updated_at = ?6
                 WHERE id = ?1",
                params![user_id, update.full_name, update.picture_url, update.bio, update.phone_number, now()],
            )?;
            load_profile(conn, user_id)?.ok_or(StoreError::Missing("user"))
        })
        .await
    }

    async fn groups_for_user(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        self.run(move |conn| {
            let mut stmt = conn
                .prepare("SELECT room_id FROM chat_participants WHERE user_id = ?1 ORDER BY room_id")?;
            let ids = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn create_group(&self, creator_id: i64, name: &str, member_ids: &[i64]) -> StoreResult<GroupRecord> {
        let name = name.to_string();
        let member_ids = member_ids.to_vec();
        self.run(move |conn| {
            let now = now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chat_rooms (name, created_by, settings, created_at) VALUES (?1, ?2, '{}', ?3)",
                params![name, creator_id, now],
            )?;
            let room_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO chat_participants (room_id, user_id, is_admin, joined_at) VALUES (?1, ?2, 1, ?3)",
                params![room_id, creator_id, now],
            )?;
            for member in member_ids.iter().filter(|id| **id != creator_id) {
                tx.execute(
                    "INSERT OR IGNORE INTO chat_participants (room_id, user_id, is_admin, joined_at)
                     VALUES (?1, ?2, 0, ?3)",
                    params![room_id, member, now],
                )?;
            }
            let members = load_member_ids(&tx, room_id)?;
            tx.commit()?;

            Ok(GroupRecord {
                id: room_id,
                name,
                created_by: creator_id,
                member_ids: members,
                settings: Value::Object(Default::default()),
                created_at: now,
            })
        })
        .await
    }

    async fn is_group_member(&self, group_id: i64, user_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            Ok(conn
                .prepare("SELECT 1 FROM chat_participants WHERE room_id = ?1 AND user_id = ?2")?
                .exists(params![group_id, user_id])?)
        })
        .await
    }

    async fn is_group_admin(&self, group_id: i64, user_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            Ok(conn
                .prepare(
                    "SELECT 1 FROM chat_participants WHERE room_id = ?1 AND user_id = ?2 AND is_admin = 1",
                )?
                .exists(params![group_id, user_id])?)
        })
        .await
    }

    async fn group_member_ids(&self, group_id: i64) -> StoreResult<Vec<i64>> {
        self.run(move |conn| Ok(load_member_ids(conn, group_id)?)).await
    }

    async fn add_group_members(&self, group_id: i64, member_ids: &[i64]) -> StoreResult<Vec<i64>> {
        let member_ids = member_ids.to_vec();
        self.run(move |conn| {
            let now = now();
            let tx = conn.transaction()?;
            let mut added = Vec::new();
            for member in member_ids {
                let changed = tx.execute(
                    "INSERT OR IGNORE INTO chat_participants (room_id, user_id, is_admin, joined_at)
                     VALUES (?1, ?2, 0, ?3)",
                    params![group_id, member, now],
                )?;
                if changed == 1 {
                    added.push(member);
                }
            }
            tx.commit()?;
            Ok(added)
        })
        .await
    }

    async fn remove_group_member(&self, group_id: i64, user_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM chat_participants WHERE room_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn update_group_settings(&self, group_id: i64, settings: &Value) -> StoreResult<Value> {
        let patch = settings.clone();
        self.run(move |conn| {
            let current: String = conn
                .query_row(
                    "SELECT settings FROM chat_rooms WHERE id = ?1",
                    params![group_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(StoreError::Missing("chat room"))?;
            let mut merged = parse_json(current);
            merge_object(&mut merged, &patch);
            conn.execute(
                "UPDATE chat_rooms SET settings = ?2 WHERE id = ?1",
                params![group_id, serde_json::to_string(&merged)?],
            )?;
            Ok(merged)
        })
        .await
    }

    async fn save_group_message(&self, group_id: i64, sender_id: i64, message: NewMessage) -> StoreResult<MessageRecord> {
        self.run(move |conn| insert_message(conn, Some(group_id), sender_id, None, message))
            .await
    }

    async fn save_direct_message(
        &self,
        sender_id: i64,
        recipient_id: i64,
        message: NewMessage,
    ) -> StoreResult<MessageRecord> {
        self.run(move |conn| insert_message(conn, None, sender_id, Some(recipient_id), message))
            .await
    }

    async fn message(&self, message_id: i64) -> StoreResult<Option<MessageRecord>> {
        self.run(move |conn| Ok(load_message(conn, message_id)?)).await
    }

    async fn mark_messages_read(&self, reader_id: i64, scope: ReadScope, message_ids: &[i64]) -> StoreResult<u64> {
        let message_ids = message_ids.to_vec();
        self.run(move |conn| {
            let now = now();
            let tx = conn.transaction()?;
            let mut marked = 0u64;
            for id in message_ids {
                let inserted = match scope {
                    ReadScope::Group(room_id) => tx.execute(
                        "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                         SELECT id, ?2, ?3 FROM messages WHERE id = ?1 AND room_id = ?4",
                        params![id, reader_id, now, room_id],
                    )?,
                    ReadScope::Direct { sender_id } => tx.execute(
                        "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
                         SELECT id, ?2, ?3 FROM messages
                         WHERE id = ?1 AND room_id IS NULL AND recipient_id = ?2 AND sender_id = ?4",
                        params![id, reader_id, now, sender_id],
                    )?,
                };
                marked += inserted as u64;
            }
            tx.commit()?;
            Ok(marked)
        })
        .await
    }

    async fn delete_message(&self, message_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET deleted = 1, content = '' WHERE id = ?1 AND deleted = 0",
                params![message_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn notifications(&self, user_id: i64, limit: u32, offset: u32) -> StoreResult<Vec<NotificationRecord>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, data, is_read, created_at FROM notifications
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(params![user_id, limit, offset], notification_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn create_notification(&self, user_id: i64, kind: &str, data: &Value) -> StoreResult<NotificationRecord> {
        let kind = kind.to_string();
        let data = data.clone();
        self.run(move |conn| {
            let created_at = now();
            conn.execute(
                "INSERT INTO notifications (user_id, kind, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, kind, serde_json::to_string(&data)?, created_at],
            )?;
            Ok(NotificationRecord {
                id: conn.last_insert_rowid(),
                user_id,
                kind,
                data,
                is_read: false,
                created_at,
            })
        })
        .await
    }

    async fn mark_notifications_read(&self, user_id: i64, notification_ids: &[i64]) -> StoreResult<u64> {
        let ids = notification_ids.to_vec();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND id = ?2 AND is_read = 0",
            )?;
            let mut marked = 0u64;
            for id in ids {
                marked += stmt.execute(params![user_id, id])? as u64;
            }
            Ok(marked)
        })
        .await
    }

    async fn mark_all_notifications_read(&self, user_id: i64) -> StoreResult<u64> {
        self.run(move |conn| {
            let marked = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                params![user_id],
            )?;
            Ok(marked as u64)
        })
        .await
    }

    async fn create_call(&self, call: NewCall) -> StoreResult<CallRecord> {
        self.run(move |conn| {
            let now = now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO calls (caller_id, recipient_id, room_id, call_type, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    call.caller_id,
                    call.recipient_id,
                    call.group_id,
                    call.call_type,
                    CallStatus::Ringing.as_str(),
                    now
                ],
            )?;
            let call_id = tx.last_insert_rowid();
            for user_id in call.participants.iter().chain(std::iter::once(&call.caller_id)) {
                tx.execute(
                    "INSERT OR IGNORE INTO call_participants (call_id, user_id) VALUES (?1, ?2)",
                    params![call_id, user_id],
                )?;
            }
            let record = load_call(&tx, call_id)?.ok_or(StoreError::Missing("call"))?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn call(&self, call_id: i64) -> StoreResult<Option<CallRecord>> {
        self.run(move |conn| load_call(conn, call_id)).await
    }

    async fn set_call_status(&self, call_id: i64, from: CallStatus, to: CallStatus) -> StoreResult<bool> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE calls SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
                params![call_id, from.as_str(), to.as_str(), now()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn create_media(&self, owner_id: i64, media: NewMedia) -> StoreResult<MediaRecord> {
        self.run(move |conn| {
            let created_at = now();
            conn.execute(
                "INSERT INTO media (owner_id, file_name, file_size, file_type, mime_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![owner_id, media.file_name, media.file_size, media.file_type, media.mime_type, created_at],
            )?;
            Ok(MediaRecord {
                id: conn.last_insert_rowid(),
                owner_id,
                file_name: media.file_name,
                file_size: media.file_size,
                file_type: media.file_type,
                mime_type: media.mime_type,
                uploaded: false,
                created_at,
            })
        })
        .await
    }

    async fn media(&self, media_id: i64) -> StoreResult<Option<MediaRecord>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, owner_id, file_name, file_size, file_type, mime_type, uploaded, created_at
                     FROM media WHERE id = ?1",
                    params![media_id],
                    media_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn mark_media_uploaded(&self, media_id: i64) -> StoreResult<()> {
        self.run(move |conn| {
            conn.execute("UPDATE media SET uploaded = 1 WHERE id = ?1", params![media_id])?;
            Ok(())
        })
        .await
    }

    async fn add_contact(&self, user_id: i64, contact_id: i64) -> StoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO contacts (user_id, contact_id, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, contact_id, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_contact(&self, user_id: i64, contact_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM contacts WHERE user_id = ?1 AND contact_id = ?2",
                params![user_id, contact_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn contact_of_ids(&self, user_id: i64) -> StoreResult<Vec<i64>> {
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM contacts WHERE contact_id = ?1 ORDER BY user_id")?;
            let ids = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn block_user(&self, user_id: i64, blocked_id: i64) -> StoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO blocks (user_id, blocked_id, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, blocked_id, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn unblock_user(&self, user_id: i64, blocked_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM blocks WHERE user_id = ?1 AND blocked_id = ?2",
                params![user_id, blocked_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn is_blocked(&self, blocker_id: i64, user_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            Ok(conn
                .prepare("SELECT 1 FROM blocks WHERE user_id = ?1 AND blocked_id = ?2")?
                .exists(params![blocker_id, user_id])?)
        })
        .await
    }

    async fn match_contacts(&self, user_id: i64, phone_numbers: &[String]) -> StoreResult<Vec<ContactRecord>> {
        let numbers: BTreeSet<String> = phone_numbers
            .iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, full_name, picture_url, phone_number FROM users
                 WHERE phone_number = ?1 AND id != ?2",
            )?;
            let mut found = BTreeMap::new();
            for number in numbers {
                let rows = stmt.query_map(params![number, user_id], |row| {
                    Ok(ContactRecord {
                        user_id: row.get(0)?,
                        username: row.get(1)?,
                        full_name: row.get(2)?,
                        picture_url: row.get(3)?,
                        phone_number: row.get(4)?,
                    })
                })?;
                for contact in rows {
                    let contact = contact?;
                    found.insert(contact.user_id, contact);
                }
            }
            Ok(found.into_values().collect())
        })
        .await
    }

    async fn create_story(&self, user_id: i64, story: NewStory) -> StoreResult<StoryRecord> {
        self.run(move |conn| {
            let created_at = now();
            conn.execute(
                "INSERT INTO stories (user_id, media_id, caption, media_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, story.media_id, story.caption, story.media_type, created_at],
            )?;
            Ok(StoryRecord {
                id: conn.last_insert_rowid(),
                user_id,
                media_id: story.media_id,
                caption: story.caption,
                media_type: story.media_type,
                view_count: 0,
                created_at,
            })
        })
        .await
    }

    async fn story(&self, story_id: i64) -> StoreResult<Option<StoryRecord>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("{} WHERE s.id = ?1", STORY_SELECT),
                    params![story_id],
                    story_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn mark_story_viewed(&self, story_id: i64, viewer_id: i64) -> StoreResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO story_views (story_id, viewer_id, viewed_at) VALUES (?1, ?2, ?3)",
                params![story_id, viewer_id, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_story(&self, story_id: i64) -> StoreResult<bool> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM story_views WHERE story_id = ?1", params![story_id])?;
            let removed = tx.execute("DELETE FROM stories WHERE id = ?1", params![story_id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn contact_stories(&self, user_id: i64, since: &str) -> StoreResult<Vec<StoryRecord>> {
        let since = since.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE s.user_id IN (SELECT contact_id FROM contacts WHERE user_id = ?1)
                   AND s.created_at >= ?2
                 ORDER BY s.created_at DESC",
                STORY_SELECT
            ))?;
            let stories = stmt
                .query_map(params![user_id, since], story_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(stories)
        })
        .await
    }

    async fn register_device(&self, user_id: i64, device: DeviceInfo) -> StoreResult<()> {
        self.run(move |conn| {
            let now = now();
            conn.execute(
                "INSERT INTO devices (user_id, device_id, device_type, device_name, registered_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id, device_id) DO UPDATE SET
                    device_type = COALESCE(excluded.device_type, device_type),
                    device_name = COALESCE(excluded.device_name, device_name),
                    last_seen_at = excluded.last_seen_at",
                params![user_id, device.device_id, device.device_type, device.device_name, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn unregister_device(&self, user_id: i64, device_id: &str) -> StoreResult<bool> {
        let device_id = device_id.to_string();
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM devices WHERE user_id = ?1 AND device_id = ?2",
                params![user_id, device_id],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn sync_snapshot(&self, user_id: i64, since: Option<&str>) -> StoreResult<SyncSnapshot> {
        let since = since.unwrap_or("").to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE created_at > ?2
                   AND (room_id IN (SELECT room_id FROM chat_participants WHERE user_id = ?1)
                        OR sender_id = ?1 OR recipient_id = ?1)
                 ORDER BY id LIMIT ?3",
                MESSAGE_COLUMNS
            ))?;
            let messages = stmt
                .query_map(params![user_id, since, SYNC_MESSAGE_LIMIT], message_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn.prepare(
                "SELECT id, user_id, kind, data, is_read, created_at FROM notifications
                 WHERE user_id = ?1 AND created_at > ?2 ORDER BY id",
            )?;
            let notifications = stmt
                .query_map(params![user_id, since], notification_from_row)?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt = conn
                .prepare("SELECT room_id FROM chat_participants WHERE user_id = ?1 ORDER BY room_id")?;
            let group_ids = stmt
                .query_map(params![user_id], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;

            Ok(SyncSnapshot {
                messages,
                notifications,
                group_ids,
                server_time: now(),
            })
        })
        .await
    }

    async fn update_settings(&self, user_id: i64, scope: SettingsScope, values: &Value) -> StoreResult<Value> {
        let patch = values.clone();
        self.run(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT value FROM user_settings WHERE user_id = ?1 AND scope = ?2",
                    params![user_id, scope.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            let mut merged = current
                .map(parse_json)
                .unwrap_or_else(|| Value::Object(Default::default()));
            merge_object(&mut merged, &patch);
            conn.execute(
                "INSERT INTO user_settings (user_id, scope, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, scope) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![user_id, scope.as_str(), serde_json::to_string(&merged)?, now()],
            )?;
            Ok(merged)
        })
        .await
    }

    async fn store_public_key(&self, user_id: i64, recipient_id: i64, public_key: &str) -> StoreResult<()> {
        let public_key = public_key.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO public_keys (owner_id, recipient_id, public_key, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner_id, recipient_id) DO UPDATE SET
                    public_key = excluded.public_key, updated_at = excluded.updated_at",
                params![user_id, recipient_id, public_key, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn public_keys(&self, owner_ids: &[i64], recipient_id: i64) -> StoreResult<BTreeMap<i64, String>> {
        let owners = owner_ids.to_vec();
        self.run(move |conn| {
            let mut stmt = conn
                .prepare("SELECT public_key FROM public_keys WHERE owner_id = ?1 AND recipient_id = ?2")?;
            let mut keys = BTreeMap::new();
            for owner in owners {
                if let Some(key) = stmt
                    .query_row(params![owner, recipient_id], |row| row.get::<_, String>(0))
                    .optional()?
                {
                    keys.insert(owner, key);
                }
            }
            Ok(keys)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;
    use serde_json::json;

    fn principal(id: i64, name: &str) -> Principal {
        Principal {
            id,
            username: name.to_string(),
            full_name: format!("{} Test", name),
            picture_url: None,
        }
    }

    async fn store_with_users(ids: &[i64]) -> SqliteStore {
        let store = SqliteStore::new(init_memory_db().unwrap());
        for id in ids {
            store.upsert_user(&principal(*id, &format!("user{}", id))).await.unwrap();
        }
        store
    }

    fn text(content: &str) -> NewMessage {
        NewMessage {
            content: content.to_string(),
            message_type: "text".to_string(),
            reply_to: None,
        }
    }

    #[tokio::test]
    async fn test_missing_users_reports_unknown_ids() {
        let store = store_with_users(&[1, 2]).await;
        let missing = store.missing_users(&[1, 2, 3, 3, 9]).await.unwrap();
        assert_eq!(missing, vec![3, 9]);
    }

    #[tokio::test]
    async fn test_create_group_makes_creator_admin() {
        let store = store_with_users(&[1, 2, 3]).await;
        let group = store.create_group(1, "hikers", &[2, 3, 1]).await.unwrap();

        assert_eq!(group.member_ids, vec![1, 2, 3]);
        assert!(store.is_group_admin(group.id, 1).await.unwrap());
        assert!(!store.is_group_admin(group.id, 2).await.unwrap());
        assert!(store.is_group_member(group.id, 3).await.unwrap());
        assert_eq!(store.groups_for_user(2).await.unwrap(), vec![group.id]);
    }

    #[tokio::test]
    async fn test_add_and_remove_members() {
        let store = store_with_users(&[1, 2, 3]).await;
        let group = store.create_group(1, "g", &[2]).await.unwrap();

        let added = store.add_group_members(group.id, &[2, 3]).await.unwrap();
        assert_eq!(added, vec![3]);
        assert!(store.remove_group_member(group.id, 3).await.unwrap());
        assert!(!store.remove_group_member(group.id, 3).await.unwrap());
        assert_eq!(store.group_member_ids(group.id).await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_group_settings_merge() {
        let store = store_with_users(&[1]).await;
        let group = store.create_group(1, "g", &[]).await.unwrap();

        store.update_group_settings(group.id, &json!({"muted": true})).await.unwrap();
        let merged = store
            .update_group_settings(group.id, &json!({"topic": "trail"}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"muted": true, "topic": "trail"}));
    }

    #[tokio::test]
    async fn test_messages_read_and_delete() {
        let store = store_with_users(&[1, 2]).await;
        let msg = store.save_direct_message(1, 2, text("hello")).await.unwrap();
        assert_eq!(msg.recipient_id, Some(2));
        assert!(msg.chatroom_id.is_none());

        let from_amy = ReadScope::Direct { sender_id: 1 };
        // Only the addressee can mark it, and only against its real sender
        assert_eq!(store.mark_messages_read(1, from_amy, &[msg.id]).await.unwrap(), 0);
        assert_eq!(
            store.mark_messages_read(2, ReadScope::Direct { sender_id: 3 }, &[msg.id]).await.unwrap(),
            0
        );
        assert_eq!(store.mark_messages_read(2, ReadScope::Group(1), &[msg.id]).await.unwrap(), 0);
        assert_eq!(store.mark_messages_read(2, from_amy, &[msg.id, 9999]).await.unwrap(), 1);
        assert_eq!(store.mark_messages_read(2, from_amy, &[msg.id]).await.unwrap(), 0);

        assert!(store.delete_message(msg.id).await.unwrap());
        assert!(!store.delete_message(msg.id).await.unwrap());
        let deleted = store.message(msg.id).await.unwrap().unwrap();
        assert!(deleted.deleted);
        assert!(deleted.content.is_empty());
    }

    #[tokio::test]
    async fn test_notifications_only_touch_owner_rows() {
        let store = store_with_users(&[1, 2]).await;
        let mine = store.create_notification(1, "message", &json!({"a": 1})).await.unwrap();
        let theirs = store.create_notification(2, "message", &json!({})).await.unwrap();

        assert_eq!(store.mark_notifications_read(1, &[mine.id, theirs.id]).await.unwrap(), 1);
        let other = store.notifications(2, 50, 0).await.unwrap();
        assert!(!other[0].is_read);

        store.create_notification(1, "call", &json!({})).await.unwrap();
        assert_eq!(store.mark_all_notifications_read(1).await.unwrap(), 1);

        let page = store.notifications(1, 1, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].kind, "call");
    }

    #[tokio::test]
    async fn test_call_lifecycle() {
        let store = store_with_users(&[1, 2]).await;
        let call = store
            .create_call(NewCall {
                caller_id: 1,
                recipient_id: Some(2),
                group_id: None,
                call_type: "video".to_string(),
                participants: vec![2],
            })
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Ringing);
        assert_eq!(call.participants, vec![1, 2]);

        assert!(store
            .set_call_status(call.id, CallStatus::Ringing, CallStatus::Active)
            .await
            .unwrap());
        // A second writer that still saw the call ringing loses
        assert!(!store
            .set_call_status(call.id, CallStatus::Ringing, CallStatus::Rejected)
            .await
            .unwrap());
        let reloaded = store.call(call.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, CallStatus::Active);
        assert!(store.call(call.id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contacts_blocks_and_matching() {
        let store = store_with_users(&[1, 2, 3]).await;
        store
            .update_profile(
                2,
                &ProfileUpdate {
                    phone_number: Some("+15550002".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.add_contact(1, 2).await.unwrap();
        store.add_contact(1, 2).await.unwrap();
        assert_eq!(store.contact_of_ids(2).await.unwrap(), vec![1]);

        store.block_user(2, 1).await.unwrap();
        assert!(store.is_blocked(2, 1).await.unwrap());
        assert!(!store.is_blocked(1, 2).await.unwrap());
        assert!(store.unblock_user(2, 1).await.unwrap());

        let matched = store
            .match_contacts(1, &["+15550002".to_string(), " ".to_string(), "+1999".to_string()])
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].user_id, 2);
    }

    #[tokio::test]
    async fn test_stories_visible_to_contacts() {
        let store = store_with_users(&[1, 2]).await;
        store.add_contact(2, 1).await.unwrap();
        let story = store
            .create_story(
                1,
                NewStory {
                    media_id: None,
                    caption: Some("sunrise".to_string()),
                    media_type: "image".to_string(),
                },
            )
            .await
            .unwrap();

        store.mark_story_viewed(story.id, 2).await.unwrap();
        store.mark_story_viewed(story.id, 2).await.unwrap();
        assert_eq!(store.story(story.id).await.unwrap().unwrap().view_count, 1);

        assert_eq!(store.contact_of_ids(1).await.unwrap(), vec![2]);
        assert!(store.contact_of_ids(2).await.unwrap().is_empty());

        let visible = store.contact_stories(2, "1970-01-01T00:00:00.000Z").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert!(store.contact_stories(1, "1970-01-01T00:00:00.000Z").await.unwrap().is_empty());

        assert!(store.delete_story(story.id).await.unwrap());
        assert!(store.story(story.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_snapshot_filters_by_time() {
        let store = store_with_users(&[1, 2]).await;
        let group = store.create_group(1, "g", &[2]).await.unwrap();
        store.save_group_message(group.id, 1, text("first")).await.unwrap();
        store.save_direct_message(2, 1, text("dm")).await.unwrap();

        let all = store.sync_snapshot(1, None).await.unwrap();
        assert_eq!(all.messages.len(), 2);
        assert_eq!(all.group_ids, vec![group.id]);

        let later = store.sync_snapshot(1, Some(&all.server_time)).await.unwrap();
        assert!(later.messages.len() <= 2);
        let future = store.sync_snapshot(1, Some("9999-01-01T00:00:00.000Z")).await.unwrap();
        assert!(future.messages.is_empty());
    }

    #[tokio::test]
    async fn test_settings_and_keys() {
        let store = store_with_users(&[1, 2]).await;
        store
            .update_settings(1, SettingsScope::Privacy, &json!({"last_seen": "contacts"}))
            .await
            .unwrap();
        let merged = store
            .update_settings(1, SettingsScope::Privacy, &json!({"read_receipts": false}))
            .await
            .unwrap();
        assert_eq!(merged, json!({"last_seen": "contacts", "read_receipts": false}));
        let general = store
            .update_settings(1, SettingsScope::General, &json!({"theme": "dark"}))
            .await
            .unwrap();
        assert_eq!(general, json!({"theme": "dark"}));

        store.store_public_key(2, 1, "pk-old").await.unwrap();
        store.store_public_key(2, 1, "pk-new").await.unwrap();
        let keys = store.public_keys(&[2, 3], 1).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[&2], "pk-new");
    }

    #[tokio::test]
    async fn test_devices_register_and_unregister() {
        let store = store_with_users(&[1]).await;
        let device = DeviceInfo {
            device_id: "phone-1".to_string(),
            device_type: Some("ios".to_string()),
            device_name: None,
        };
        store.register_device(1, device.clone()).await.unwrap();
        store.register_device(1, device).await.unwrap();
        assert!(store.unregister_device(1, "phone-1").await.unwrap());
        assert!(!store.unregister_device(1, "phone-1").await.unwrap());
    }
}
