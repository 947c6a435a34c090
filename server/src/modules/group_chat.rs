//! Group chat rooms: creation, messaging, receipts and membership.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::store::{NewMessage, ReadScope};
use crate::ws::{chat_group, user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, HookResult, Module, ModuleContext, Reply};

pub struct GroupChatModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    members: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    group_id: i64,
    #[serde(default)]
    message: String,
    #[serde(default = "default_message_type")]
    message_type: String,
    #[serde(default)]
    reply_to: Option<i64>,
}

pub(crate) fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize)]
struct TypingRequest {
    group_id: i64,
    #[serde(default = "default_true")]
    is_typing: bool,
}

pub(crate) fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    group_id: i64,
    #[serde(default)]
    message_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct AddMembersRequest {
    group_id: i64,
    #[serde(default)]
    member_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct RemoveMemberRequest {
    group_id: i64,
    member_id: i64,
}

#[derive(Debug, Deserialize)]
struct GroupRequest {
    group_id: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    group_id: i64,
    #[serde(default)]
    settings: Map<String, Value>,
}

impl GroupChatModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn require_member(&self, group_id: i64) -> Result<(), ActionError> {
        if self.ctx.state.store.is_group_member(group_id, self.ctx.user_id()).await? {
            Ok(())
        } else {
            Err(ActionError::unauthorized("Not a group member"))
        }
    }

    async fn require_admin(&self, group_id: i64) -> Result<(), ActionError> {
        if self.ctx.state.store.is_group_admin(group_id, self.ctx.user_id()).await? {
            Ok(())
        } else {
            Err(ActionError::unauthorized("Admin privileges required"))
        }
    }

    async fn create(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: CreateRequest = call.parse()?;
        let name = req.name.trim();
        if name.is_empty() || req.members.is_empty() {
            return Err(ActionError::invalid_input("Group name and members required"));
        }
        self.ctx.require_users(&req.members).await?;

        let group = self
            .ctx
            .state
            .store
            .create_group(self.ctx.user_id(), name, &req.members)
            .await?;

        // Every live session of every member follows the new channel
        let channel = chat_group(group.id);
        for member in &group.member_ids {
            self.ctx.state.groups.join_members_of(&user_group(*member), &channel);
        }
        self.ctx.join(&channel);

        tracing::info!(group_id = group.id, user_id = self.ctx.user_id(), "Group created");

        self.ctx
            .publish(&channel, BroadcastAction::GroupCreated, json!({ "group": group }));
        Ok(Reply::Success(json!({ "group": group })))
    }

    async fn send_message(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: SendMessageRequest = call.parse()?;
        if req.message.trim().is_empty() {
            return Err(ActionError::invalid_input("Group ID and message required"));
        }
        self.require_member(req.group_id).await?;

        let store = &self.ctx.state.store;
        let message = store
            .save_group_message(
                req.group_id,
                self.ctx.user_id(),
                NewMessage {
                    content: req.message,
                    message_type: req.message_type.clone(),
                    reply_to: req.reply_to,
                },
            )
            .await?;

        self.ctx.publish(
            &chat_group(req.group_id),
            BroadcastAction::SendMessage,
            json!({
                "group_id": req.group_id,
                "message": message,
                "sender_id": self.ctx.user_id(),
                "message_type": req.message_type,
                "reply_to": req.reply_to,
            }),
        );

        let offline: Vec<i64> = store
            .group_member_ids(req.group_id)
            .await?
            .into_iter()
            .filter(|id| *id != self.ctx.user_id())
            .collect();
        self.ctx.notify_offline(
            offline,
            "group_message",
            json!({
                "group_id": req.group_id,
                "message_id": message.id,
                "sender_id": self.ctx.user_id(),
            }),
        );

        Ok(Reply::Success(json!({ "message": message })))
    }

    async fn typing(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: TypingRequest = call.parse()?;
        self.require_member(req.group_id).await?;

        self.ctx.publish(
            &chat_group(req.group_id),
            BroadcastAction::GroupTyping,
            json!({
                "group_id": req.group_id,
                "user_id": self.ctx.user_id(),
                "is_typing": req.is_typing,
            }),
        );
        Ok(Reply::Silent)
    }

    async fn mark_read(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: MarkReadRequest = call.parse()?;
        if req.message_ids.is_empty() {
            return Err(ActionError::invalid_input("message_ids required"));
        }
        self.require_member(req.group_id).await?;

        let marked = self
            .ctx
            .state
            .store
            .mark_messages_read(self.ctx.user_id(), ReadScope::Group(req.group_id), &req.message_ids)
            .await?;

        self.ctx.publish(
            &chat_group(req.group_id),
            BroadcastAction::GroupReadReceipt,
            json!({
                "group_id": req.group_id,
                "user_id": self.ctx.user_id(),
                "message_ids": req.message_ids,
            }),
        );
        Ok(Reply::Success(json!({
            "group_id": req.group_id,
            "message_ids": req.message_ids,
            "marked": marked,
        })))
    }

    async fn add_members(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: AddMembersRequest = call.parse()?;
        self.require_admin(req.group_id).await?;
        if req.member_ids.is_empty() {
            return Err(ActionError::invalid_input("member_ids required"));
        }
        self.ctx.require_users(&req.member_ids).await?;

        let added = self
            .ctx
            .state
            .store
            .add_group_members(req.group_id, &req.member_ids)
            .await?;

        let channel = chat_group(req.group_id);
        for member in &added {
            self.ctx.state.groups.join_members_of(&user_group(*member), &channel);
        }

        self.ctx.publish(
            &channel,
            BroadcastAction::GroupMembersAdded,
            json!({
                "group_id": req.group_id,
                "member_ids": added,
                "added_by": self.ctx.user_id(),
            }),
        );
        Ok(Reply::Success(json!({ "group_id": req.group_id, "member_ids": added })))
    }

    async fn remove_member(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: RemoveMemberRequest = call.parse()?;
        self.require_admin(req.group_id).await?;

        if !self
            .ctx
            .state
            .store
            .remove_group_member(req.group_id, req.member_id)
            .await?
        {
            return Err(ActionError::not_found("Member not in group"));
        }

        // Announce before unsubscribing so the removed user sees it too
        let channel = chat_group(req.group_id);
        self.ctx.publish(
            &channel,
            BroadcastAction::GroupMemberRemoved,
            json!({
                "group_id": req.group_id,
                "member_id": req.member_id,
                "removed_by": self.ctx.user_id(),
            }),
        );
        self.ctx
            .state
            .groups
            .leave_members_of(&user_group(req.member_id), &channel);
        if req.member_id == self.ctx.user_id() {
            self.ctx.leave(&channel);
        }

        Ok(Reply::Success(json!({ "group_id": req.group_id, "member_id": req.member_id })))
    }

    async fn leave(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: GroupRequest = call.parse()?;
        self.require_member(req.group_id).await?;

        self.ctx
            .state
            .store
            .remove_group_member(req.group_id, self.ctx.user_id())
            .await?;

        let channel = chat_group(req.group_id);
        self.ctx
            .state
            .groups
            .leave_members_of(&user_group(self.ctx.user_id()), &channel);
        self.ctx.leave(&channel);

        self.ctx.publish(
            &channel,
            BroadcastAction::GroupMemberLeft,
            json!({ "group_id": req.group_id, "member_id": self.ctx.user_id() }),
        );
        Ok(Reply::Success(json!({ "group_id": req.group_id })))
    }

    async fn update_settings(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: UpdateSettingsRequest = call.parse()?;
        self.require_admin(req.group_id).await?;

        let settings = self
            .ctx
            .state
            .store
            .update_group_settings(req.group_id, &Value::Object(req.settings))
            .await?;

        self.ctx.publish(
            &chat_group(req.group_id),
            BroadcastAction::GroupSettingsUpdated,
            json!({
                "group_id": req.group_id,
                "settings": settings,
                "updated_by": self.ctx.user_id(),
            }),
        );
        Ok(Reply::Success(json!({ "group_id": req.group_id, "settings": settings })))
    }
}

#[async_trait]
impl Module for GroupChatModule {
    fn key(&self) -> &'static str {
        "group_chat"
    }

    async fn on_connect(&self) -> HookResult {
        let groups = self.ctx.state.store.groups_for_user(self.ctx.user_id()).await?;
        for group_id in &groups {
            self.ctx.join(&chat_group(*group_id));
        }
        tracing::debug!(user_id = self.ctx.user_id(), groups = groups.len(), "Joined chat groups");
        Ok(())
    }

    async fn on_disconnect(&self) -> HookResult {
        let groups = self.ctx.state.store.groups_for_user(self.ctx.user_id()).await?;
        for group_id in groups {
            self.ctx.leave(&chat_group(group_id));
        }
        Ok(())
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("create", Self::create)
            .action("send_message", Self::send_message)
            .action("typing", Self::typing)
            .action("mark_read", Self::mark_read)
            .action("add_members", Self::add_members)
            .action("remove_member", Self::remove_member)
            .action("leave", Self::leave)
            .action("update_settings", Self::update_settings);
    }
}
