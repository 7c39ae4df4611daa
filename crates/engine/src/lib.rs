//! Capability orchestration: registry, gating, bounded execution and
//! server lifecycle.
//!
//! The crate ties the workspace together. Capabilities come from two
//! places: in-process handlers ([`LocalCapability`]) and tools discovered
//! from external servers (via the `mcp` crate). Both land in one
//! [`CapabilityRegistry`] and are invoked through the same
//! [`ExecutionEngine`], which validates, confirms, checkpoints and runs
//! each call under a concurrency permit and a per-call deadline. Every
//! outcome folds into a [`CapabilityResult`]; the engine itself never
//! returns an error for a call.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine::{CapstanConfig, Orchestrator};
//!
//! # async fn example() -> engine::Result<()> {
//! let config = CapstanConfig::load("capstan.toml")?;
//! let orchestrator = Orchestrator::builder(config).build().await?;
//!
//! let result = orchestrator
//!     .submit("read_file", serde_json::json!({"path": "./notes.md"}))
//!     .await;
//! println!("{}", result.output);
//! # Ok(())
//! # }
//! ```

mod audit;
mod call;
mod config;
mod descriptor;
mod engine;
mod error;
mod orchestrator;
mod pipeline;
mod registry;
mod servers;

pub use audit::AuditLog;
pub use call::{CallId, CallMetadata, CapabilityCall, CapabilityResult, ErrorKind};
pub use config::{AuditSettings, CapstanConfig, DescriptorConfig, EngineSettings};
pub use descriptor::{CapabilityDescriptor, CapabilitySource, DEFAULT_CALL_TIMEOUT};
pub use engine::{
    AutoApprove, AutoReject, BatchEntry, CheckpointHook, ConfirmationHandler, EngineOptions,
    ExecutionEngine, NoCheckpoint, DEFAULT_CONCURRENCY,
};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use pipeline::{collapse_content, kind_for_code, kind_for_error, remote_result};
pub use registry::{
    CapabilityFilter, CapabilityHandler, CapabilityRegistry, LocalCapability,
    RegisteredCapability,
};
pub use servers::ServerManager;
