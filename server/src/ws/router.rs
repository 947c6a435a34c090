//! Inbound frame dispatch.
//!
//! Parses one text frame, resolves `WS:<module>:<verb>` against the
//! connection's module table and turns the handler outcome into exactly one
//! reply frame. Nothing here closes the connection.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde_json::{json, Value};

use crate::modules::{ActionCall, ModuleSet, Reply, Unresolved};

use super::{Connection, ErrorKind};

/// Shown to clients in place of any internal failure detail.
const INTERNAL_MESSAGE: &str = "Internal server error";

/// What the router did with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// `pong`: heartbeat hooks ran, no reply.
    Heartbeat,
    /// A `success` frame was sent.
    Replied,
    /// The handler finished without a reply.
    Silent,
    /// An `error` frame with this code was sent.
    Rejected(ErrorKind),
}

fn reject(conn: &Connection, code: ErrorKind, message: impl Into<String>) -> Routed {
    conn.send_error(code, message);
    Routed::Rejected(code)
}

pub async fn route(conn: &Connection, modules: &ModuleSet, raw: &str) -> Routed {
    let frame: Value = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(connection_id = %conn.id(), error = %e, "Rejected malformed frame");
            return reject(conn, ErrorKind::InvalidJson, "Invalid JSON");
        }
    };

    let Some(action) = frame.get("action").and_then(Value::as_str) else {
        return reject(conn, ErrorKind::InvalidAction, "Missing or invalid action");
    };
    let payload = match frame.get("payload") {
        None | Some(Value::Null) => json!({}),
        Some(payload) => payload.clone(),
    };

    if action.trim().eq_ignore_ascii_case("pong") {
        modules.on_heartbeat().await;
        return Routed::Heartbeat;
    }

    let parts: Vec<&str> = action.split(':').collect();
    if parts.len() != 3 || !parts[0].eq_ignore_ascii_case("ws") {
        return reject(
            conn,
            ErrorKind::InvalidAction,
            "Invalid action format. Expected WS:MODULE:ACTION",
        );
    }
    let module = parts[1].trim().to_lowercase();
    let verb = parts[2].trim().to_lowercase();

    let handler = match modules.resolve(&module, &verb) {
        Ok(handler) => handler,
        Err(Unresolved::Module) => {
            return reject(conn, ErrorKind::ModuleNotFound, format!("Module '{}' not found", module));
        }
        Err(Unresolved::Action) => {
            return reject(
                conn,
                ErrorKind::ActionNotFound,
                format!("Action '{}' not found in module '{}'", verb, module),
            );
        }
    };

    tracing::debug!(user_id = conn.user_id(), module = %module, action = %verb, "Dispatching action");

    let call = ActionCall::new(action, payload);
    match AssertUnwindSafe(handler(call)).catch_unwind().await {
        Ok(Ok(Reply::Success(data))) => {
            conn.send_success(action, data);
            Routed::Replied
        }
        Ok(Ok(Reply::Silent)) => Routed::Silent,
        Ok(Err(err)) if err.kind == ErrorKind::InternalError => {
            tracing::error!(
                user_id = conn.user_id(),
                module = %module,
                action = %verb,
                error = %err.message,
                "Action failed"
            );
            reject(conn, ErrorKind::InternalError, INTERNAL_MESSAGE)
        }
        Ok(Err(err)) => {
            tracing::debug!(
                user_id = conn.user_id(),
                module = %module,
                action = %verb,
                code = %err.kind,
                "Action rejected"
            );
            reject(conn, err.kind, err.message)
        }
        Err(_) => {
            tracing::error!(user_id = conn.user_id(), module = %module, action = %verb, "Action handler panicked");
            reject(conn, ErrorKind::InternalError, INTERNAL_MESSAGE)
        }
    }
}
