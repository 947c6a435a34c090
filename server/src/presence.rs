//! Online-status tracking consulted by the presence module.
//!
//! Presence is reference counted per connection: every session holds its own
//! TTL entry, and a user is online while any unexpired entry remains. One
//! device disconnecting never marks a user offline while another device is
//! still connected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::ws::ConnectionId;

#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Create or refresh this connection's entry. Idempotent.
    async fn set_online(&self, user_id: i64, connection_id: ConnectionId, ttl: Duration);
    /// Drop this connection's entry only.
    async fn clear_online(&self, user_id: i64, connection_id: ConnectionId);
    async fn is_online(&self, user_id: i64) -> bool;
    /// Remove expired entries. Returns how many were dropped.
    async fn purge_expired(&self) -> usize;
}

/// In-process presence store keyed by user id.
#[derive(Default)]
pub struct MemoryPresence {
    entries: DashMap<i64, HashMap<ConnectionId, Instant>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(&self, user_id: i64, connection_id: ConnectionId, ttl: Duration) {
        self.entries
            .entry(user_id)
            .or_default()
            .insert(connection_id, Instant::now() + ttl);
    }

    async fn clear_online(&self, user_id: i64, connection_id: ConnectionId) {
        if let Some(mut sessions) = self.entries.get_mut(&user_id) {
            sessions.remove(&connection_id);
        }
        self.entries.remove_if(&user_id, |_, sessions| sessions.is_empty());
    }

    async fn is_online(&self, user_id: i64) -> bool {
        let now = Instant::now();
        self.entries
            .get(&user_id)
            .map(|sessions| sessions.values().any(|expires| *expires > now))
            .unwrap_or(false)
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, sessions| {
            let before = sessions.len();
            sessions.retain(|_, expires| *expires > now);
            purged += before - sessions.len();
            !sessions.is_empty()
        });
        purged
    }
}

/// Periodically drop expired entries so crashed sessions do not accumulate.
pub fn spawn_presence_sweeper(presence: Arc<dyn PresenceStore>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            let purged = presence.purge_expired().await;
            if purged > 0 {
                tracing::debug!(purged, "Purged expired presence entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_online_until_cleared() {
        let presence = MemoryPresence::new();
        let conn = Uuid::now_v7();
        assert!(!presence.is_online(1).await);

        presence.set_online(1, conn, TTL).await;
        assert!(presence.is_online(1).await);

        presence.clear_online(1, conn).await;
        assert!(!presence.is_online(1).await);
    }

    #[tokio::test]
    async fn test_second_device_keeps_user_online() {
        let presence = MemoryPresence::new();
        let phone = Uuid::now_v7();
        let laptop = Uuid::now_v7();
        presence.set_online(7, phone, TTL).await;
        presence.set_online(7, laptop, TTL).await;

        presence.clear_online(7, phone).await;
        assert!(presence.is_online(7).await);

        presence.clear_online(7, laptop).await;
        assert!(!presence.is_online(7).await);
    }

    #[tokio::test]
    async fn test_expired_entries_are_offline_and_purged() {
        let presence = MemoryPresence::new();
        let conn = Uuid::now_v7();
        presence.set_online(3, conn, Duration::from_millis(20)).await;
        presence.set_online(4, Uuid::now_v7(), TTL).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!presence.is_online(3).await);
        assert_eq!(presence.purge_expired().await, 1);
        assert!(presence.is_online(4).await);

        // Heartbeat after expiry revives the entry
        presence.set_online(3, conn, TTL).await;
        assert!(presence.is_online(3).await);
    }

    #[tokio::test]
    async fn test_sweeper_purges_in_background() {
        let presence = Arc::new(MemoryPresence::new());
        presence.set_online(9, Uuid::now_v7(), Duration::from_millis(10)).await;

        let sweeper = spawn_presence_sweeper(presence.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        sweeper.abort();

        assert!(presence.entries.is_empty());
    }
}
