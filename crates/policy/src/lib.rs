//! Capability gating: validation, trust and confirmation.
//!
//! Core principle: **every call is checked before it runs** — argument
//! shape first, then permission class against the caller's trust, then the
//! confirmation policy. All of it is synchronous and deterministic.

mod capability;
mod confirm;
mod error;
mod rules;
mod validate;

pub use capability::{ConfirmationPolicy, PermissionClass, TrustLevel};
pub use confirm::{
    needs_confirmation, ConfirmationDecision, ConfirmationRequest, DefaultRiskHeuristic,
    RiskHeuristic, LARGE_ARGS_BYTES, RISK_THRESHOLD,
};
pub use error::{Error, Result};
pub use rules::{Decision, Policy};
pub use validate::{validate, ValidationFailure};
