use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

pub struct ContactModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct ContactRequest {
    contact_id: i64,
}

#[derive(Debug, Deserialize)]
struct UserRequest {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    phone_numbers: Vec<String>,
}

impl ContactModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    fn not_self(&self, user_id: i64) -> Result<(), ActionError> {
        if user_id == self.ctx.user_id() {
            Err(ActionError::invalid_input("Cannot target yourself"))
        } else {
            Ok(())
        }
    }

    async fn add(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: ContactRequest = call.parse()?;
        self.not_self(req.contact_id)?;
        self.ctx.require_users(&[req.contact_id]).await?;

        self.ctx
            .state
            .store
            .add_contact(self.ctx.user_id(), req.contact_id)
            .await?;
        self.ctx.publish(
            &user_group(req.contact_id),
            BroadcastAction::ContactAdded,
            json!({ "user_id": self.ctx.user_id() }),
        );
        Ok(Reply::Success(json!({ "contact_id": req.contact_id })))
    }

    async fn remove(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: ContactRequest = call.parse()?;
        let removed = self
            .ctx
            .state
            .store
            .remove_contact(self.ctx.user_id(), req.contact_id)
            .await?;
        Ok(Reply::Success(json!({ "contact_id": req.contact_id, "removed": removed })))
    }

    async fn block(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: UserRequest = call.parse()?;
        self.not_self(req.user_id)?;
        self.ctx.require_users(&[req.user_id]).await?;

        self.ctx.state.store.block_user(self.ctx.user_id(), req.user_id).await?;
        tracing::debug!(user_id = self.ctx.user_id(), blocked_id = req.user_id, "User blocked");
        Ok(Reply::Success(json!({ "blocked_user_id": req.user_id })))
    }

    async fn unblock(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: UserRequest = call.parse()?;
        let unblocked = self
            .ctx
            .state
            .store
            .unblock_user(self.ctx.user_id(), req.user_id)
            .await?;
        Ok(Reply::Success(json!({ "unblocked_user_id": req.user_id, "unblocked": unblocked })))
    }

    async fn sync(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: SyncRequest = call.parse()?;
        let contacts = self
            .ctx
            .state
            .store
            .match_contacts(self.ctx.user_id(), &req.phone_numbers)
            .await?;
        Ok(Reply::Success(json!({ "contacts": contacts })))
    }
}

#[async_trait]
impl Module for ContactModule {
    fn key(&self) -> &'static str {
        "contact"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("add", Self::add)
            .action("remove", Self::remove)
            .action("block", Self::block)
            .action("unblock", Self::unblock)
            .action("sync", Self::sync);
    }
}
