pub mod connection;
pub mod envelope;
pub mod groups;
pub mod handler;
pub mod router;
pub mod session;

use tokio::sync::mpsc;

/// Unique identifier of one gateway connection.
pub type ConnectionId = uuid::Uuid;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Every producer (replies, broadcasts, heartbeat) writes through a clone of
/// this sender; the connection's writer task drains it in order.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

pub use connection::{chat_group, user_group, Connection};
pub use envelope::{BroadcastAction, BroadcastEnvelope, ErrorKind, ServerFrame};
pub use groups::GroupRegistry;
pub use session::ConnectionSession;
