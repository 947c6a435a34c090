use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

/// End-to-end key exchange relay. Keys are opaque strings to the server.
pub struct EncryptionModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    recipient_id: i64,
    #[serde(default)]
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct RequestKeys {
    #[serde(default)]
    contact_ids: Vec<i64>,
}

impl EncryptionModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn exchange_keys(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: ExchangeRequest = call.parse()?;
        if req.public_key.trim().is_empty() {
            return Err(ActionError::invalid_input("public_key required"));
        }
        self.ctx.require_users(&[req.recipient_id]).await?;

        self.ctx
            .state
            .store
            .store_public_key(self.ctx.user_id(), req.recipient_id, &req.public_key)
            .await?;
        self.ctx.publish(
            &user_group(req.recipient_id),
            BroadcastAction::EncryptionKeyExchange,
            json!({ "sender_id": self.ctx.user_id(), "public_key": req.public_key }),
        );
        Ok(Reply::Success(json!({ "recipient_id": req.recipient_id })))
    }

    async fn request_keys(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: RequestKeys = call.parse()?;
        let keys = self
            .ctx
            .state
            .store
            .public_keys(&req.contact_ids, self.ctx.user_id())
            .await?;
        Ok(Reply::Success(json!({ "keys": keys })))
    }
}

#[async_trait]
impl Module for EncryptionModule {
    fn key(&self) -> &'static str {
        "encryption"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("exchange_keys", Self::exchange_keys)
            .action("request_keys", Self::request_keys);
    }
}
