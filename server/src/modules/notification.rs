use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 100;

/// In-app notifications. Every verb only sees the caller's own rows.
pub struct NotificationModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MarkReadRequest {
    #[serde(default)]
    notification_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct PushRequest {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    data: Map<String, Value>,
}

fn default_kind() -> String {
    "general".to_string()
}

impl NotificationModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn fetch(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: FetchRequest = call.parse()?;
        let limit = req.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let offset = req.offset.unwrap_or(0);

        let notifications = self
            .ctx
            .state
            .store
            .notifications(self.ctx.user_id(), limit, offset)
            .await?;
        Ok(Reply::Success(json!({
            "notifications": notifications,
            "limit": limit,
            "offset": offset,
        })))
    }

    async fn mark_read(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: MarkReadRequest = call.parse()?;
        if req.notification_ids.is_empty() {
            return Err(ActionError::invalid_input("notification_ids required"));
        }
        let marked = self
            .ctx
            .state
            .store
            .mark_notifications_read(self.ctx.user_id(), &req.notification_ids)
            .await?;
        Ok(Reply::Success(json!({ "marked": marked })))
    }

    async fn mark_all_read(self: Arc<Self>, _call: ActionCall) -> ActionResult {
        let marked = self
            .ctx
            .state
            .store
            .mark_all_notifications_read(self.ctx.user_id())
            .await?;
        Ok(Reply::Success(json!({ "marked": marked })))
    }

    async fn push(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: PushRequest = call.parse()?;
        let notification = self
            .ctx
            .state
            .store
            .create_notification(self.ctx.user_id(), &req.kind, &Value::Object(req.data))
            .await?;

        self.ctx.publish(
            &user_group(self.ctx.user_id()),
            BroadcastAction::NotificationNew,
            json!({ "notification": notification }),
        );
        Ok(Reply::Success(json!({ "notification": notification })))
    }
}

#[async_trait]
impl Module for NotificationModule {
    fn key(&self) -> &'static str {
        "notification"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("fetch", Self::fetch)
            .action("mark_read", Self::mark_read)
            .action("mark_all_read", Self::mark_all_read)
            .action("push", Self::push);
    }
}
