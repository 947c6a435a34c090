//! Broadcast group membership and fan-out.
//!
//! Two maps are kept in step: group name -> member senders, and connection
//! -> joined group names. Every join/leave takes the group entry first and
//! the membership entry second, so both sides change under the same guard.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;

use super::envelope::BroadcastEnvelope;
use super::{ConnectionId, ConnectionSender};

#[derive(Default)]
struct Inner {
    groups: DashMap<String, HashMap<ConnectionId, ConnectionSender>>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

/// Shared registry of broadcast groups. Cheap to clone.
#[derive(Clone, Default)]
pub struct GroupRegistry {
    inner: Arc<Inner>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a group. Returns false if it was already a member.
    pub fn join(&self, group: &str, id: ConnectionId, sender: &ConnectionSender) -> bool {
        let mut members = self.inner.groups.entry(group.to_string()).or_default();
        let added = members.insert(id, sender.clone()).is_none();
        self.inner
            .memberships
            .entry(id)
            .or_default()
            .insert(group.to_string());
        drop(members);

        if added {
            tracing::debug!(connection_id = %id, group = %group, "Joined group");
        }
        added
    }

    /// Remove a connection from a group. Leaving a group you are not in is a no-op.
    pub fn leave(&self, group: &str, id: ConnectionId) -> bool {
        let Some(mut members) = self.inner.groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if let Some(mut joined) = self.inner.memberships.get_mut(&id) {
            joined.remove(group);
        }
        self.inner.memberships.remove_if(&id, |_, joined| joined.is_empty());
        let now_empty = members.is_empty();
        drop(members);

        // Drop empty groups so the registry does not grow with dead channels
        if now_empty {
            self.inner.groups.remove_if(group, |_, members| members.is_empty());
        }

        if removed {
            tracing::debug!(connection_id = %id, group = %group, "Left group");
        }
        removed
    }

    /// Remove a connection from every group it joined. Returns the group names.
    pub fn leave_all(&self, id: ConnectionId) -> Vec<String> {
        let joined: Vec<String> = self
            .inner
            .memberships
            .get(&id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default();

        for group in &joined {
            self.leave(group, id);
        }
        joined
    }

    /// Subscribe every connection currently in `source` to `target`.
    ///
    /// Used to pull all live sessions of a user (`user_<id>`) into a chat
    /// channel they were just added to. Returns how many joined.
    pub fn join_members_of(&self, source: &str, target: &str) -> usize {
        let members: Vec<(ConnectionId, ConnectionSender)> = match self.inner.groups.get(source) {
            Some(members) => members
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect(),
            None => return 0,
        };
        members
            .iter()
            .filter(|(id, sender)| self.join(target, *id, sender))
            .count()
    }

    /// Remove every connection currently in `source` from `target`.
    pub fn leave_members_of(&self, source: &str, target: &str) -> usize {
        let ids: Vec<ConnectionId> = match self.inner.groups.get(source) {
            Some(members) => members.keys().copied().collect(),
            None => return 0,
        };
        ids.into_iter().filter(|id| self.leave(target, *id)).count()
    }

    /// Deliver an envelope to every current member of a group.
    ///
    /// Each delivery is independent: a closed receiver is logged and skipped.
    /// Returns the number of connections the envelope was handed to.
    pub fn publish(&self, group: &str, envelope: &BroadcastEnvelope) -> usize {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(group = %group, error = %err, "Failed to encode broadcast");
                return 0;
            }
        };

        // Snapshot the members so no shard lock is held while sending
        let members: Vec<(ConnectionId, ConnectionSender)> = match self.inner.groups.get(group) {
            Some(members) => members
                .iter()
                .map(|(id, sender)| (*id, sender.clone()))
                .collect(),
            None => return 0,
        };

        let msg = Message::Text(text.into());
        let mut delivered = 0;
        for (id, sender) in members {
            if sender.send(msg.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(
                    connection_id = %id,
                    group = %group,
                    "Skipping broadcast to closed connection"
                );
            }
        }
        delivered
    }

    pub fn is_member(&self, group: &str, id: ConnectionId) -> bool {
        self.inner
            .groups
            .get(group)
            .map(|members| members.contains_key(&id))
            .unwrap_or(false)
    }

    /// Group names a connection currently belongs to.
    pub fn groups_of(&self, id: ConnectionId) -> Vec<String> {
        self.inner
            .memberships
            .get(&id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.inner
            .groups
            .get(group)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.inner.groups.len()
    }
}
