//! Per-connection feature modules and their dispatch table.
//!
//! Each module is built once per connection and registers its verbs in an
//! explicit table: module key -> verb -> handler. The router resolves
//! `WS:<module>:<verb>` against that table; there is no name-based lookup.

pub mod call;
pub mod contact;
pub mod direct_chat;
pub mod encryption;
pub mod group_chat;
pub mod media;
pub mod notification;
pub mod presence;
pub mod profile;
pub mod settings;
pub mod story;
pub mod sync;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::Principal;
use crate::notify;
use crate::state::AppState;
use crate::store::StoreError;
use crate::ws::{BroadcastAction, BroadcastEnvelope, Connection, ErrorKind};

/// One dispatched command: the action string as the client sent it, and its payload.
#[derive(Debug, Clone)]
pub struct ActionCall {
    pub action: String,
    pub payload: Value,
}

impl ActionCall {
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self {
            action: action.into(),
            payload,
        }
    }

    /// Decode the payload into a typed request.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ActionError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ActionError::invalid_input(format!("Invalid payload: {}", e)))
    }
}

/// How a handler finished successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Send one `success` frame carrying this data.
    Success(Value),
    /// Fire-and-forget verbs: nothing goes back to the caller.
    Silent,
}

/// A handler failure, converted to one `error` frame by the router.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// The message is logged server-side only.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, detail)
    }
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        Self::internal(err.to_string())
    }
}

pub type ActionResult = Result<Reply, ActionError>;
pub type HookResult = Result<(), ActionError>;
pub type ActionHandler = Arc<dyn Fn(ActionCall) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// What every module sees of its connection: who is calling, how to reach
/// the connection's sender, and the shared collaborators.
///
/// The connection handle is weak; the session owns the connection.
#[derive(Clone)]
pub struct ModuleContext {
    connection: Weak<Connection>,
    principal: Principal,
    pub state: AppState,
}

impl ModuleContext {
    pub fn new(connection: &Arc<Connection>, state: AppState) -> Self {
        Self {
            connection: Arc::downgrade(connection),
            principal: connection.principal().clone(),
            state,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn user_id(&self) -> i64 {
        self.principal.id
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    /// Subscribe this connection to a broadcast group.
    pub fn join(&self, group: &str) -> bool {
        self.connection().map(|c| c.join(group)).unwrap_or(false)
    }

    pub fn leave(&self, group: &str) -> bool {
        self.connection().map(|c| c.leave(group)).unwrap_or(false)
    }

    /// Broadcast with the caller as sender.
    pub fn publish(&self, group: &str, action: BroadcastAction, payload: Value) -> usize {
        let envelope = BroadcastEnvelope::new(action, payload, Some(self.principal.clone()));
        self.state.groups.publish(group, &envelope)
    }

    /// Fail with NOT_FOUND if any of `user_ids` is unknown.
    pub async fn require_users(&self, user_ids: &[i64]) -> Result<(), ActionError> {
        let missing = self.state.store.missing_users(user_ids).await?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ActionError::not_found(format!("Users not found: {:?}", missing)))
        }
    }

    /// Queue notifications for recipients without a live session.
    pub fn notify_offline(&self, recipients: Vec<i64>, kind: &'static str, data: Value) {
        if recipients.is_empty() {
            return;
        }
        notify::notify_offline(
            self.state.presence.clone(),
            self.state.notifier.clone(),
            recipients,
            kind,
            data,
        );
    }
}

#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Lower-case key used in `WS:<key>:<verb>`.
    fn key(&self) -> &'static str;

    async fn on_connect(&self) -> HookResult {
        Ok(())
    }

    async fn on_disconnect(&self) -> HookResult {
        Ok(())
    }

    async fn on_heartbeat(&self) -> HookResult {
        Ok(())
    }

    /// Declare the verbs this module answers.
    fn register(actions: &mut ActionRegistrar<Self>)
    where
        Self: Sized;
}

/// Collects one module's verb handlers.
pub struct ActionRegistrar<M> {
    module: Arc<M>,
    actions: HashMap<&'static str, ActionHandler>,
}

impl<M: Module> ActionRegistrar<M> {
    /// Register `handler` under a lower-case verb.
    pub fn action<F, Fut>(&mut self, verb: &'static str, handler: F) -> &mut Self
    where
        F: Fn(Arc<M>, ActionCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult> + Send + 'static,
    {
        let module = self.module.clone();
        let handler: ActionHandler = Arc::new(move |call| handler(module.clone(), call).boxed());
        self.actions.insert(verb, handler);
        self
    }
}

/// Why a `(module, verb)` pair did not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    Module,
    Action,
}

/// All modules of one connection plus their dispatch table.
#[derive(Default)]
pub struct ModuleSet {
    modules: Vec<Arc<dyn Module>>,
    table: HashMap<&'static str, HashMap<&'static str, ActionHandler>>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full module catalog for one connection.
    pub fn standard(ctx: ModuleContext) -> Self {
        let mut set = Self::new();
        set.insert(group_chat::GroupChatModule::new(ctx.clone()));
        set.insert(direct_chat::DirectChatModule::new(ctx.clone()));
        set.insert(presence::PresenceModule::new(ctx.clone()));
        set.insert(notification::NotificationModule::new(ctx.clone()));
        set.insert(call::CallModule::new(ctx.clone()));
        set.insert(media::MediaModule::new(ctx.clone()));
        set.insert(contact::ContactModule::new(ctx.clone()));
        set.insert(story::StoryModule::new(ctx.clone()));
        set.insert(sync::SyncModule::new(ctx.clone()));
        set.insert(settings::SettingsModule::new(ctx.clone()));
        set.insert(encryption::EncryptionModule::new(ctx.clone()));
        set.insert(profile::ProfileModule::new(ctx));
        set
    }

    pub fn insert<M: Module>(&mut self, module: M) {
        let module = Arc::new(module);
        let mut registrar = ActionRegistrar {
            module: module.clone(),
            actions: HashMap::new(),
        };
        M::register(&mut registrar);
        self.table.insert(module.key(), registrar.actions);
        self.modules.push(module);
    }

    pub fn resolve(&self, module: &str, verb: &str) -> Result<ActionHandler, Unresolved> {
        let actions = self.table.get(module).ok_or(Unresolved::Module)?;
        actions.get(verb).cloned().ok_or(Unresolved::Action)
    }

    pub async fn on_connect(&self) {
        self.fan_out("on_connect", |m| async move { m.on_connect().await }.boxed())
            .await
    }

    pub async fn on_disconnect(&self) {
        self.fan_out("on_disconnect", |m| async move { m.on_disconnect().await }.boxed())
            .await
    }

    pub async fn on_heartbeat(&self) {
        self.fan_out("on_heartbeat", |m| async move { m.on_heartbeat().await }.boxed())
            .await
    }

    /// Run one hook on every module concurrently. A failing or panicking
    /// module is logged and does not affect the others.
    async fn fan_out<F>(&self, hook: &'static str, call: F)
    where
        F: Fn(Arc<dyn Module>) -> BoxFuture<'static, HookResult>,
    {
        let calls: Vec<BoxFuture<'static, _>> = self
            .modules
            .iter()
            .map(|module| {
                let key = module.key();
                let fut = AssertUnwindSafe(call(module.clone())).catch_unwind();
                async move { (key, fut.await) }.boxed()
            })
            .collect();

        for (module, outcome) in join_all(calls).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(module, hook, error = %err, "Module hook failed");
                }
                Err(_) => {
                    tracing::error!(module, hook, "Module hook panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        key: &'static str,
        hits: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Module for Counter {
        fn key(&self) -> &'static str {
            self.key
        }

        async fn on_heartbeat(&self) -> HookResult {
            if self.fail {
                panic!("heartbeat exploded");
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_connect(&self) -> HookResult {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ActionError::internal("connect failed"));
            }
            Ok(())
        }

        fn register(actions: &mut ActionRegistrar<Self>) {
            actions.action("count", Self::count);
        }
    }

    impl Counter {
        async fn count(self: Arc<Self>, _call: ActionCall) -> ActionResult {
            let n = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Reply::Success(serde_json::json!({ "hits": n })))
        }
    }

    fn set(hits: &Arc<AtomicUsize>) -> ModuleSet {
        let mut set = ModuleSet::new();
        set.insert(Counter { key: "ok", hits: hits.clone(), fail: false });
        set.insert(Counter { key: "bad", hits: Arc::new(AtomicUsize::new(0)), fail: true });
        set
    }

    #[tokio::test]
    async fn test_resolve_distinguishes_module_and_action() {
        let hits = Arc::new(AtomicUsize::new(0));
        let set = set(&hits);

        assert!(set.resolve("ok", "count").is_ok());
        assert_eq!(set.resolve("nope", "count").err(), Some(Unresolved::Module));
        assert_eq!(set.resolve("ok", "nope").err(), Some(Unresolved::Action));

        let handler = set.resolve("ok", "count").unwrap();
        let reply = handler(ActionCall::new("WS:OK:COUNT", Value::Null)).await.unwrap();
        assert_eq!(reply, Reply::Success(serde_json::json!({ "hits": 1 })));
    }

    #[tokio::test]
    async fn test_hook_failures_are_isolated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let set = set(&hits);

        set.on_connect().await;
        set.on_heartbeat().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_hooks_run_on_spawned_task() {
        let hits = Arc::new(AtomicUsize::new(0));
        let set = Arc::new(set(&hits));

        let task_set = set.clone();
        tokio::spawn(async move {
            task_set.on_connect().await;
            task_set.on_disconnect().await;
            task_set.on_heartbeat().await;
        })
        .await
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parse_maps_to_invalid_input() {
        #[derive(serde::Deserialize)]
        #[allow(dead_code)]
        struct Req {
            group_id: i64,
        }
        let call = ActionCall::new("WS:A:B", serde_json::json!({ "group_id": "x" }));
        let err = call.parse::<Req>().err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
