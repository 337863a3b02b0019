//! Events broadcast to observers of a running engine.

use serde::{Deserialize, Serialize};

use crate::conversation::ConversationState;

/// Emitted on every conversation state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub from: ConversationState,
    pub to: ConversationState,
    /// Short reason, e.g. `"wake word"` or `"reply drained"`.
    pub detail: String,
}

/// Emitted when the engine lifecycle changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Engine created but `start()` not yet called.
    Idle,
    /// Devices open, control loop running.
    Running,
    /// Control loop stopped; engine may be restarted.
    Stopped,
    /// Start failed or the control loop died.
    Error,
}
