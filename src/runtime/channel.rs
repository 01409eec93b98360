/// Channel identities, capabilities and the messages they carry

use crate::runtime::fault::FaultSignal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque identity of a rendezvous point, unique within one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Identity of a pending reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionId(pub u64);

/// Identity of a runtime scope instance (owner of variables and correlation sets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeInstanceId(pub u64);

/// Declared capability of a channel: which messages it may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Child → parent outcome
    Completion,
    /// Parent → child termination request
    Termination,
    /// Partner reply to an invoke
    InvokeResponse,
    /// Timer firing
    Timer,
    /// Matched message of a pick
    PickResponse,
}

impl ChannelKind {
    /// Whether external collaborators may post on channels of this kind
    pub fn is_external(self) -> bool {
        matches!(self, ChannelKind::InvokeResponse | ChannelKind::Timer | ChannelKind::PickResponse)
    }
}

/// A message posted on a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Completed,
    Faulted { fault: FaultSignal },
    Terminated,
    Terminate,
    InvokeResponse { payload: Value },
    InvokeFault {
        fault_name: crate::process::types::QName,
        #[serde(default)]
        data: Option<Value>,
    },
    TimerFired,
    PickResponse {
        selector: usize,
        exchange_id: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Message {
    pub fn label(&self) -> &'static str {
        match self {
            Message::Completed => "completed",
            Message::Faulted { .. } => "faulted",
            Message::Terminated => "terminated",
            Message::Terminate => "terminate",
            Message::InvokeResponse { .. } => "invoke_response",
            Message::InvokeFault { .. } => "invoke_fault",
            Message::TimerFired => "timer_fired",
            Message::PickResponse { .. } => "pick_response",
        }
    }

    /// Capability check: may this message travel on a channel of `kind`?
    pub fn allowed_on(&self, kind: ChannelKind) -> bool {
        match self {
            Message::Completed | Message::Faulted { .. } | Message::Terminated => kind == ChannelKind::Completion,
            Message::Terminate => kind == ChannelKind::Termination,
            Message::InvokeResponse { .. } | Message::InvokeFault { .. } => kind == ChannelKind::InvokeResponse,
            Message::TimerFired => kind == ChannelKind::Timer,
            Message::PickResponse { .. } => kind == ChannelKind::PickResponse,
        }
    }
}

/// Result of posting a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostOutcome {
    /// A pending reaction matched and is now ready
    Matched,
    /// No reaction waits yet; the message is queued on the channel
    Queued,
    /// The channel already fired or was retired; the message is dropped
    Dropped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_restrict_messages() {
        assert!(Message::TimerFired.allowed_on(ChannelKind::Timer));
        assert!(!Message::TimerFired.allowed_on(ChannelKind::Completion));
        assert!(Message::Terminate.allowed_on(ChannelKind::Termination));
        assert!(!Message::Completed.allowed_on(ChannelKind::Termination));
        assert!(!ChannelKind::Completion.is_external());
        assert!(ChannelKind::PickResponse.is_external());
    }

    #[test]
    fn messages_use_snake_case_tags() {
        let json = serde_json::to_value(&Message::TimerFired).unwrap();
        assert_eq!(json, serde_json::json!({"type": "timer_fired"}));
        let parsed: Message = serde_json::from_str(r#"{"type":"invoke_response","payload":{"ok":true}}"#).unwrap();
        assert_eq!(parsed, Message::InvokeResponse { payload: serde_json::json!({"ok": true}) });
    }
}
