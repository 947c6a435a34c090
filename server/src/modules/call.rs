//! Call signaling: invitations, the call state machine and WebRTC relay.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::store::{CallRecord, CallStatus, NewCall};
use crate::ws::{chat_group, user_group, BroadcastAction};

use super::{ActionCall, ActionError, ActionRegistrar, ActionResult, Module, ModuleContext, Reply};

const CALL_TYPES: &[&str] = &["voice", "video"];

pub struct CallModule {
    ctx: ModuleContext,
}

#[derive(Debug, Deserialize)]
struct InitiateRequest {
    #[serde(default)]
    recipient_id: Option<i64>,
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default = "default_call_type")]
    call_type: String,
    #[serde(default)]
    is_group: bool,
}

fn default_call_type() -> String {
    "voice".to_string()
}

#[derive(Debug, Deserialize)]
struct CallRequest {
    call_id: i64,
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    call_id: i64,
    recipient_id: i64,
    signal_type: String,
    #[serde(default)]
    signal_data: Value,
}

impl CallModule {
    pub fn new(ctx: ModuleContext) -> Self {
        Self { ctx }
    }

    /// Load a call the caller takes part in.
    async fn participant_call(&self, call_id: i64) -> Result<CallRecord, ActionError> {
        let call = self
            .ctx
            .state
            .store
            .call(call_id)
            .await?
            .ok_or_else(|| ActionError::not_found("Call not found"))?;
        if !call.is_participant(self.ctx.user_id()) {
            return Err(ActionError::unauthorized("Not a call participant"));
        }
        Ok(call)
    }

    async fn transition(&self, call: &CallRecord, next: CallStatus) -> Result<(), ActionError> {
        if !call.status.can_become(next) {
            return Err(ActionError::invalid_input(format!(
                "Call is {} and cannot become {}",
                call.status.as_str(),
                next.as_str()
            )));
        }
        let moved = self
            .ctx
            .state
            .store
            .set_call_status(call.id, call.status, next)
            .await?;
        if !moved {
            return Err(ActionError::invalid_input(format!(
                "Call is no longer {}",
                call.status.as_str()
            )));
        }
        tracing::debug!(call_id = call.id, from = call.status.as_str(), to = next.as_str(), "Call status changed");
        Ok(())
    }

    async fn initiate(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: InitiateRequest = call.parse()?;
        if !CALL_TYPES.contains(&req.call_type.as_str()) {
            return Err(ActionError::invalid_input("call_type must be voice or video"));
        }
        let me = self.ctx.user_id();
        let store = &self.ctx.state.store;

        let group_call = req.is_group || (req.recipient_id.is_none() && req.group_id.is_some());
        let (new_call, target) = if group_call {
            let group_id = req
                .group_id
                .ok_or_else(|| ActionError::invalid_input("Recipient or group required"))?;
            if !store.is_group_member(group_id, me).await? {
                return Err(ActionError::unauthorized("Not a group member"));
            }
            let participants = store.group_member_ids(group_id).await?;
            (
                NewCall {
                    caller_id: me,
                    recipient_id: None,
                    group_id: Some(group_id),
                    call_type: req.call_type,
                    participants,
                },
                chat_group(group_id),
            )
        } else {
            let recipient_id = req
                .recipient_id
                .ok_or_else(|| ActionError::invalid_input("Recipient or group required"))?;
            if recipient_id == me {
                return Err(ActionError::invalid_input("Cannot call yourself"));
            }
            self.ctx.require_users(&[recipient_id]).await?;
            if store.is_blocked(recipient_id, me).await? {
                return Err(ActionError::unauthorized("You cannot call this user"));
            }
            (
                NewCall {
                    caller_id: me,
                    recipient_id: Some(recipient_id),
                    group_id: None,
                    call_type: req.call_type,
                    participants: vec![recipient_id],
                },
                user_group(recipient_id),
            )
        };

        let record = store.create_call(new_call).await?;
        tracing::info!(call_id = record.id, caller_id = me, target = %target, "Call initiated");

        self.ctx.publish(
            &target,
            BroadcastAction::CallIncoming,
            json!({ "call": record, "caller_id": me }),
        );
        let offline: Vec<i64> = record.participants.iter().copied().filter(|id| *id != me).collect();
        self.ctx.notify_offline(
            offline,
            "missed_call",
            json!({ "call_id": record.id, "caller_id": me, "call_type": record.call_type }),
        );

        Ok(Reply::Success(json!({ "call": record })))
    }

    async fn answer(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: CallRequest = call.parse()?;
        let record = self.participant_call(req.call_id).await?;
        if record.caller_id == self.ctx.user_id() {
            return Err(ActionError::invalid_input("Caller cannot answer own call"));
        }
        self.transition(&record, CallStatus::Active).await?;

        self.ctx.publish(
            &user_group(record.caller_id),
            BroadcastAction::CallAnswered,
            json!({ "call_id": record.id, "answerer_id": self.ctx.user_id() }),
        );
        Ok(Reply::Success(json!({ "call_id": record.id, "status": CallStatus::Active })))
    }

    async fn reject(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: CallRequest = call.parse()?;
        let record = self.participant_call(req.call_id).await?;
        if record.caller_id == self.ctx.user_id() {
            return Err(ActionError::invalid_input("Caller cannot reject own call"));
        }
        self.transition(&record, CallStatus::Rejected).await?;

        self.ctx.publish(
            &user_group(record.caller_id),
            BroadcastAction::CallRejected,
            json!({ "call_id": record.id, "rejector_id": self.ctx.user_id() }),
        );
        Ok(Reply::Success(json!({ "call_id": record.id, "status": CallStatus::Rejected })))
    }

    async fn end(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: CallRequest = call.parse()?;
        let record = self.participant_call(req.call_id).await?;
        self.transition(&record, CallStatus::Ended).await?;

        let me = self.ctx.user_id();
        for participant in record.participants.iter().filter(|id| **id != me) {
            self.ctx.publish(
                &user_group(*participant),
                BroadcastAction::CallEnded,
                json!({ "call_id": record.id, "ended_by": me }),
            );
        }
        Ok(Reply::Success(json!({ "call_id": record.id, "status": CallStatus::Ended })))
    }

    async fn webrtc_signal(self: Arc<Self>, call: ActionCall) -> ActionResult {
        let req: SignalRequest = call.parse()?;
        if req.signal_type.trim().is_empty() {
            return Err(ActionError::invalid_input("signal_type required"));
        }
        let record = self.participant_call(req.call_id).await?;
        if !record.is_participant(req.recipient_id) {
            return Err(ActionError::unauthorized("Recipient is not a call participant"));
        }

        let delivered = self.ctx.publish(
            &user_group(req.recipient_id),
            BroadcastAction::CallWebrtcSignal,
            json!({
                "call_id": req.call_id,
                "sender_id": self.ctx.user_id(),
                "signal_type": req.signal_type,
                "signal_data": req.signal_data,
            }),
        );
        Ok(Reply::Success(json!({ "call_id": req.call_id, "delivered": delivered })))
    }
}

#[async_trait]
impl Module for CallModule {
    fn key(&self) -> &'static str {
        "call"
    }

    fn register(actions: &mut ActionRegistrar<Self>) {
        actions
            .action("initiate", Self::initiate)
            .action("answer", Self::answer)
            .action("reject", Self::reject)
            .action("end", Self::end)
            .action("webrtc_signal", Self::webrtc_signal);
    }
}
