use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::store::DeviceInfo;
use crate::ws::{user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

/// Multi-device registration and catch-up sync.
pub struct SyncModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_type: Option<String>,
    #[serde(default)]
    device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    #[serde(default)]
    last_sync_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceRequest {
    #[serde(default)]
    device_id: String,
}

/// Normalize a client timestamp to the stored UTC format.
fn normalize_timestamp(raw: &str) -> Result<String, ActionError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Millis, true))
        .map_err(|_| ActionError::invalid_input("last_sync_timestamp must be an RFC 3339 timestamp"))
}

impl SyncModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    async fn register_device(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: RegisterRequest = call.parse()?;
        if req.device_id.trim().is_empty() {
            return Err(ActionError::invalid_input("device_id required"));
        }
        self.ctx
            .state
            .store
            .register_device(
                self.ctx.user_id(),
                DeviceInfo {
                    device_id: req.device_id.clone(),
                    device_type: req.device_type,
                    device_name: req.device_name,
                },
            )
            .await?;
        Ok(Reply::Success(json!({ "device_id": req.device_id })))
    }

    async fn request_sync(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: SyncRequest = call.parse()?;
        let since = req
            .last_sync_timestamp
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(normalize_timestamp)
            .transpose()?;

        let snapshot = self
            .ctx
            .state
            .store
            .sync_snapshot(self.ctx.user_id(), since.as_deref())
            .await?;
        Ok(Reply::Success(json!({ "sync_data": snapshot })))
    }

    async fn unregister_device(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: DeviceRequest = call.parse()?;
        if req.device_id.trim().is_empty() {
            return Err(ActionError::invalid_input("device_id required"));
        }
        let removed = self
            .ctx
            .state
            .store
            .unregister_device(self.ctx.user_id(), &req.device_id)
            .await?;

        self.ctx.publish(
            &user_group(self.ctx.user_id()),
            BroadcastAction::SyncDeviceRemoved,
            json!({ "device_id": req.device_id }),
        );
        Ok(Reply::Success(json!({ "device_id": req.device_id, "removed": removed })))
    }
}

#[async_trait]
impl Module for SyncModule {
    fn key(&self) -> &'static str {
        "sync"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("register_device", Self::register_device)
            .action("request_sync", Self::request_sync)
            .action("unregister_device", Self::unregister_device);
    }
}
