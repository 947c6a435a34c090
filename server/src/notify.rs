//! Best-effort delivery for recipients who are not connected.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::presence::PresenceStore;
use crate::store::{DataAccess, StoreResult};

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn notify(&self, user_id: i64, kind: &str, data: Value) -> StoreResult<()>;
}

/// Persists an in-app notification the user can fetch later.
pub struct StoredNotifier {
    store: Arc<dyn DataAccess>,
}

impl StoredNotifier {
    pub fn new(store: Arc<dyn DataAccess>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSender for StoredNotifier {
    async fn notify(&self, user_id: i64, kind: &str, data: Value) -> StoreResult<()> {
        self.store.create_notification(user_id, kind, &data).await?;
        Ok(())
    }
}

/// Notify every recipient that has no live session.
///
/// Runs on its own task so the calling handler never waits on it; failures
/// are logged and dropped.
pub fn notify_offline(
    presence: Arc<dyn PresenceStore>,
    notifier: Arc<dyn NotificationSender>,
    recipients: Vec<i64>,
    kind: &'static str,
    data: Value,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for user_id in recipients {
            if presence.is_online(user_id).await {
                continue;
            }
            if let Err(e) = notifier.notify(user_id, kind, data.clone()).await {
                tracing::warn!(user_id, kind, error = %e, "Failed to deliver offline notification");
            }
        }
    })
}
