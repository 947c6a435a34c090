//! One-to-one messaging with multi-device echo.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::store::{NewMessage, ReadScope};
use crate::ws::{user_group, BroadcastAction};

use super::group_chat::{default_message_type, default_true};
use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

pub struct DirectChatModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    recipient_id: i64,
    #[serde(default)]
    message: String,
    #[serde(default = "default_message_type")]
    message_type: String,
    #[serde(default)]
    reply_to: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TypingRequest {
    recipient_id: i64,
    #[serde(default = "default_true")]
    is_typing: bool,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    sender_id: i64,
    #[serde(default)]
    message_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct DeleteMessageRequest {
    message_id: i64,
    #[serde(default)]
    recipient_id: Option<i64>,
}

impl DirectChatModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn send_message(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: SendMessageRequest = call.parse()?;
        if req.message.trim().is_empty() {
            return Err(ActionError::invalid_input("Recipient and message required"));
        }
        self.ctx.require_users(&[req.recipient_id]).await?;

        let store = &self.ctx.state.store;
        let me = self.ctx.user_id();
        if store.is_blocked(req.recipient_id, me).await? {
            return Err(ActionError::unauthorized("You cannot message this user"));
        }

        let message = store
            .save_direct_message(
                me,
                req.recipient_id,
                NewMessage {
                    content: req.message,
                    message_type: req.message_type,
                    reply_to: req.reply_to,
                },
            )
            .await?;

        self.ctx.publish(
            &user_group(req.recipient_id),
            BroadcastAction::DirectMessage,
            json!({ "message": message, "sender_id": me }),
        );
        self.ctx.publish(
            &user_group(me),
            BroadcastAction::DirectMessageSent,
            json!({ "message": message, "recipient_id": req.recipient_id }),
        );

        self.ctx.notify_offline(
            vec![req.recipient_id],
            "direct_message",
            json!({ "message_id": message.id, "sender_id": me }),
        );

        Ok(Reply::Success(json!({ "message": message })))
    }

    async fn typing(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: TypingRequest = call.parse()?;
        self.ctx.publish(
            &user_group(req.recipient_id),
            BroadcastAction::DirectTyping,
            json!({ "user_id": self.ctx.user_id(), "is_typing": req.is_typing }),
        );
        Ok(Reply::Silent)
    }

    async fn mark_read(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: MarkReadRequest = call.parse()?;
        if req.message_ids.is_empty() {
            return Err(ActionError::invalid_input("message_ids required"));
        }
        let marked = self
            .ctx
            .state
            .store
            .mark_messages_read(
                self.ctx.user_id(),
                ReadScope::Direct { sender_id: req.sender_id },
                &req.message_ids,
            )
            .await?;

        self.ctx.publish(
            &user_group(req.sender_id),
            BroadcastAction::DirectReadReceipt,
            json!({ "user_id": self.ctx.user_id(), "message_ids": req.message_ids }),
        );
        Ok(Reply::Success(json!({
            "sender_id": req.sender_id,
            "message_ids": req.message_ids,
            "marked": marked,
        })))
    }

    async fn delete_message(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: DeleteMessageRequest = call.parse()?;
        let store = &self.ctx.state.store;
        let me = self.ctx.user_id();

        // Only live direct messages; group messages are never deleted here
        let (message, recipient) = store
            .message(req.message_id)
            .await?
            .filter(|m| !m.deleted && m.chatroom_id.is_none())
            .and_then(|m| {
                let recipient = m.recipient_id?;
                Some((m, recipient))
            })
            .ok_or_else(|| ActionError::not_found("Message not found"))?;
        if message.sender_id != me {
            return Err(ActionError::unauthorized("Cannot delete message"));
        }
        if req.recipient_id.is_some_and(|claimed| claimed != recipient) {
            return Err(ActionError::invalid_input("recipient_id does not match the message"));
        }
        if !store.delete_message(message.id).await? {
            return Err(ActionError::not_found("Message not found"));
        }

        let payload = json!({ "message_id": message.id, "deleted_by": me });
        self.ctx
            .publish(&user_group(recipient), BroadcastAction::DirectMessageDeleted, payload.clone());
        self.ctx
            .publish(&user_group(me), BroadcastAction::DirectMessageDeleted, payload);

        Ok(Reply::Success(json!({ "message_id": req.message_id })))
    }
}

#[async_trait]
impl Module for DirectChatModule {
    fn key(&self) -> &'static str {
        "direct_chat"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("send_message", Self::send_message)
            .action("typing", Self::typing)
            .action("mark_read", Self::mark_read)
            .action("delete_message", Self::delete_message);
    }
}
