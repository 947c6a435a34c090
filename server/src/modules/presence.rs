use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, HookResult, Module, ModuleContext, Reply};

/// Keeps this connection's presence entry alive for as long as it heartbeats.
pub struct PresenceModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct OnlineRequest {
    user_id: i64,
}

impl PresenceModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn mark_online(&self) -> HookResult {
        let connection = self
            .ctx
            .connection()
            .ok_or_else(|| ActionError::internal("connection already closed"))?;
        self.ctx
            .state
            .presence
            .set_online(self.ctx.user_id(), connection.id(), self.ctx.state.gateway.presence_ttl)
            .await;
        Ok(())
    }

    async fn is_user_online(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: OnlineRequest = call.parse()?;
        let is_online = self.ctx.state.presence.is_online(req.user_id).await;
        Ok(Reply::Success(json!({ "user_id": req.user_id, "is_online": is_online })))
    }
}

#[async_trait]
impl Module for PresenceModule {
    fn key(&self) -> &'static str {
        "presence"
    }

    async fn on_connect(&self) -> HookResult {
        self.mark_online().await
    }

    async fn on_disconnect(&self) -> HookResult {
        let connection = self
            .ctx
            .connection()
            .ok_or_else(|| ActionError::internal("connection already closed"))?;
        self.ctx
            .state
            .presence
            .clear_online(self.ctx.user_id(), connection.id())
            .await;
        Ok(())
    }

    async fn on_heartbeat(&self) -> HookResult {
        self.mark_online().await
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions.action("is_user_online", Self::is_user_online);
    }
}
