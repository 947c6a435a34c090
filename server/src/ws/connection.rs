use axum::extract::ws::Message;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::Principal;

use super::envelope::{ErrorKind, ServerFrame};
use super::{ConnectionId, ConnectionSender, GroupRegistry};

/// Per-user channel used for multi-device delivery.
pub fn user_group(user_id: i64) -> String {
    format!("user_{}", user_id)
}

/// Per-chat-room channel.
pub fn chat_group(room_id: i64) -> String {
    format!("group_{}", room_id)
}

/// One authenticated realtime connection.
///
/// Modules reach the connection through a `Weak` handle; only the owning
/// session keeps it alive.
pub struct Connection {
    id: ConnectionId,
    principal: Principal,
    outbound: ConnectionSender,
    groups: GroupRegistry,
}

impl Connection {
    pub fn new(principal: Principal, outbound: ConnectionSender, groups: GroupRegistry) -> Self {
        Self {
            id: Uuid::now_v7(),
            principal,
            outbound,
            groups,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn user_id(&self) -> i64 {
        self.principal.id
    }

    /// Queue a raw transport message. Returns false once the writer is gone.
    pub fn send_message(&self, msg: Message) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Serialize and queue one unicast frame.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.send_message(Message::Text(text.into())),
            Err(err) => {
                tracing::error!(connection_id = %self.id, error = %err, "Failed to encode frame");
                false
            }
        }
    }

    pub fn send_success(&self, action: &str, data: Value) -> bool {
        self.send(&ServerFrame::success(action, data, Some(self.principal.clone())))
    }

    pub fn send_error(&self, code: ErrorKind, message: impl Into<String>) -> bool {
        self.send(&ServerFrame::error(code, message))
    }

    pub fn join(&self, group: &str) -> bool {
        self.groups.join(group, self.id, &self.outbound)
    }

    pub fn leave(&self, group: &str) -> bool {
        self.groups.leave(group, self.id)
    }

    pub fn leave_all(&self) -> Vec<String> {
        self.groups.leave_all(self.id)
    }

    pub fn joined_groups(&self) -> Vec<String> {
        self.groups.groups_of(self.id)
    }
}
