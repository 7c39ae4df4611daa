//! Confirmation gate: decides which calls need explicit approval.
//!
//! Per call the gate moves `pending → approved | modified | rejected`.
//! This module holds the synchronous decision logic; soliciting the actual
//! approval is the execution layer's job.

use crate::{ConfirmationPolicy, PermissionClass};
use serde_json::Value;

/// Arguments at or past this serialized size bump the adaptive risk score.
pub const LARGE_ARGS_BYTES: usize = 4096;

/// Adaptive policy solicits at or above this risk score.
pub const RISK_THRESHOLD: u8 = 3;

/// What the gate asks an approver about.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub capability: String,
    pub arguments: Value,
    pub permission: PermissionClass,
}

/// The approver's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Approved,
    /// Approved with substituted arguments.
    Modified(Value),
    Rejected { reason: Option<String> },
}

/// Risk scoring for the `adaptive` confirmation policy.
///
/// Implementations must be deterministic: identical requests score
/// identically, so gating behavior is testable.
pub trait RiskHeuristic: Send + Sync {
    fn assess(&self, request: &ConfirmationRequest) -> u8;
}

/// Default heuristic: the permission class weight (none 0, read 1,
/// network 2, write 3, shell 4), plus one if the serialized arguments are
/// [`LARGE_ARGS_BYTES`] or larger. Write- and shell-class calls always
/// reach [`RISK_THRESHOLD`]; network calls reach it only with oversized
/// arguments.
#[derive(Debug, Default)]
pub struct DefaultRiskHeuristic;

impl RiskHeuristic for DefaultRiskHeuristic {
    fn assess(&self, request: &ConfirmationRequest) -> u8 {
        let mut risk = request.permission.weight();
        let size = serde_json::to_string(&request.arguments)
            .map(|s| s.len())
            .unwrap_or(0);
        if size >= LARGE_ARGS_BYTES {
            risk = risk.saturating_add(1);
        }
        risk
    }
}

/// Whether a call under the given policy needs explicit approval.
pub fn needs_confirmation(
    policy: ConfirmationPolicy,
    request: &ConfirmationRequest,
    heuristic: &dyn RiskHeuristic,
) -> bool {
    match policy {
        ConfirmationPolicy::Never => false,
        ConfirmationPolicy::Always => true,
        ConfirmationPolicy::DestructiveOnly => request.permission.is_destructive(),
        ConfirmationPolicy::Adaptive => heuristic.assess(request) >= RISK_THRESHOLD,
    }
}
