use std::sync::Arc;
use std::time::Duration;

use crate::notify::{NotificationSender, StoredNotifier};
use crate::presence::{MemoryPresence, PresenceStore};
use crate::store::DataAccess;
use crate::ws::GroupRegistry;

/// Runtime knobs for the realtime gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// How often each connection is sent a `ping` frame.
    pub heartbeat_interval: Duration,
    /// Lifetime of one presence entry without a refresh.
    pub presence_ttl: Duration,
    /// How often expired presence entries are purged.
    pub presence_sweep_interval: Duration,
    /// Prefix for media upload and download URLs.
    pub media_base_url: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            presence_ttl: Duration::from_secs(300),
            presence_sweep_interval: Duration::from_secs(60),
            media_base_url: "http://localhost:8000/media".to_string(),
        }
    }
}

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Persistent data access (SQLite in production)
    pub store: Arc<dyn DataAccess>,
    /// Online status, refcounted per connection
    pub presence: Arc<dyn PresenceStore>,
    /// Offline delivery channel
    pub notifier: Arc<dyn NotificationSender>,
    /// Broadcast groups shared by every connection
    pub groups: GroupRegistry,
    /// JWT verification secret
    pub jwt_secret: Vec<u8>,
    pub gateway: GatewaySettings,
}

impl AppState {
    /// State with in-process presence and stored notifications.
    pub fn new(store: Arc<dyn DataAccess>, jwt_secret: Vec<u8>, gateway: GatewaySettings) -> Self {
        Self {
            notifier: Arc::new(StoredNotifier::new(store.clone())),
            presence: Arc::new(MemoryPresence::new()),
            groups: GroupRegistry::new(),
            store,
            jwt_secret,
            gateway,
        }
    }
}
