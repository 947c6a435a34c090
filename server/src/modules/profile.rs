use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::store::ProfileUpdate;
use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, HookResult, Module, ModuleContext, Reply};

/// The caller's own profile. The user row is refreshed from the token on connect.
pub struct ProfileModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    profile: ProfileUpdate,
}

impl ProfileModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn get_profile(self: Arc<Self>, _call: ActionCall) -> ActionResult {
        let profile = self
            .ctx
            .state
            .store
            .profile(self.ctx.user_id())
            .await?
            .ok_or_else(|| ActionError::not_found("Profile not found"))?;
        Ok(Reply::Success(json!({ "profile": profile })))
    }

    async fn update_profile(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: UpdateRequest = call.parse()?;
        if req.profile.full_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ActionError::invalid_input("full_name cannot be empty"));
        }
        let profile = self
            .ctx
            .state
            .store
            .update_profile(self.ctx.user_id(), &req.profile)
            .await?;

        self.ctx.publish(
            &user_group(self.ctx.user_id()),
            BroadcastAction::ProfileUpdated,
            json!({ "profile": profile }),
        );
        Ok(Reply::Success(json!({ "profile": profile })))
    }
}

#[async_trait]
impl Module for ProfileModule {
    fn key(&self) -> &'static str {
        "profile"
    }

    async fn on_connect(&self) -> HookResult {
        self.ctx.state.store.upsert_user(self.ctx.principal()).await?;
        Ok(())
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("get_profile", Self::get_profile)
            .action("update_profile", Self::update_profile);
    }
}
