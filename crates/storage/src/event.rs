//! Audit event types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A capability call entered the execution engine.
    CallSubmitted {
        call_id: String,
        capability: String,
    },
    /// The engine produced the call's result.
    CallCompleted {
        call_id: String,
        capability: String,
        success: bool,
        error_kind: Option<String>,
        duration_ms: u64,
    },
    /// A pre-mutation checkpoint was taken for a write-class call.
    Checkpoint { call_id: String, label: String },
    /// A capability server was registered.
    ServerRegistered { server: String },
    /// A capability server was removed (or gave up reconnecting).
    ServerRemoved { server: String },
    RunStart,
    RunEnd,
}

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(run_id: RunId, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}
