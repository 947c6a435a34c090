use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::store::SettingsScope;
use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

pub struct SettingsModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    #[serde(default)]
    settings: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct PrivacyRequest {
    #[serde(default)]
    privacy_settings: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct NotificationsRequest {
    #[serde(default)]
    notification_settings: Map<String, Value>,
}

impl SettingsModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn save(&self, scope: SettingsScope, values: Map<String, Value>) -> Result<Value, ActionError> {
        let merged = self
            .ctx
            .state
            .store
            .update_settings(self.ctx.user_id(), scope, &Value::Object(values))
            .await?;
        Ok(merged)
    }

    async fn update(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: UpdateRequest = call.parse()?;
        let settings = self.save(SettingsScope::General, req.settings).await?;

        // Other devices of the same user pick up the change
        self.ctx.publish(
            &user_group(self.ctx.user_id()),
            BroadcastAction::SettingsUpdated,
            json!({ "settings": settings }),
        );
        Ok(Reply::Success(json!({ "settings": settings })))
    }

    async fn update_privacy(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: PrivacyRequest = call.parse()?;
        let privacy_settings = self.save(SettingsScope::Privacy, req.privacy_settings).await?;
        Ok(Reply::Success(json!({ "privacy_settings": privacy_settings })))
    }

    async fn update_notifications(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: NotificationsRequest = call.parse()?;
        let notification_settings = self
            .save(SettingsScope::Notifications, req.notification_settings)
            .await?;
        Ok(Reply::Success(json!({ "notification_settings": notification_settings })))
    }
}

#[async_trait]
impl Module for SettingsModule {
    fn key(&self) -> &'static str {
        "settings"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("update", Self::update)
            .action("update_privacy", Self::update_privacy)
            .action("update_notifications", Self::update_notifications);
    }
}
