/// Internal engine errors
///
/// These are never business faults: every variant is fatal to the current
/// pass and makes the transactional host roll back.

use crate::process::types::NodeId;
use crate::runtime::channel::{ChannelId, ChannelKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("continuation store corrupted: {0}")]
    Corruption(String),

    #[error("step budget of {budget} exceeded without reaching quiescence")]
    StepBudgetExceeded { budget: usize },

    #[error("incompatible continuation format: {0}")]
    IncompatibleFormat(String),

    #[error("continuation serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message '{message}' is not allowed on {kind:?} channel {channel}")]
    ChannelCapability {
        channel: ChannelId,
        kind: ChannelKind,
        message: &'static str,
    },

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("activity {0} not found in process definition")]
    UnknownNode(NodeId),

    #[error("invalid message for activity {node}: {reason}")]
    InvalidMessage { node: NodeId, reason: String },
}
