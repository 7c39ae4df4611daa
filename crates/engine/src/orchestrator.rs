//! The top-level handle embedding applications hold: one registry, one
//! pool, one engine, one audit run.

use std::sync::Arc;

use mcp::{ConnectionPool, ServerConfig};
use serde_json::Value;
use storage::{EventKind, EventStore, RunId};
use tracing::info;

use crate::audit::AuditLog;
use crate::call::{CallId, CapabilityCall, CapabilityResult};
use crate::config::CapstanConfig;
use crate::descriptor::CapabilityDescriptor;
use crate::engine::{
    BatchEntry, CheckpointHook, ConfirmationHandler, EngineOptions, ExecutionEngine,
};
use crate::error::Result;
use crate::registry::{
    CapabilityFilter, CapabilityHandler, CapabilityRegistry, LocalCapability,
    RegisteredCapability,
};
use crate::servers::ServerManager;

pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    engine: ExecutionEngine,
    manager: ServerManager,
    audit: Option<AuditLog>,
    run_id: RunId,
}

/// Assembles an [`Orchestrator`] from configuration plus the hooks only
/// the embedder can provide.
pub struct OrchestratorBuilder {
    config: CapstanConfig,
    options: EngineOptions,
    locals: Vec<(CapabilityDescriptor, Arc<dyn LocalCapability>)>,
}

impl OrchestratorBuilder {
    pub fn new(config: CapstanConfig) -> Self {
        let options = EngineOptions {
            concurrency: config.engine.concurrency,
            policy: config.policy.clone(),
            ..Default::default()
        };
        Self {
            config,
            options,
            locals: Vec::new(),
        }
    }

    pub fn confirmer(mut self, confirmer: Arc<dyn ConfirmationHandler>) -> Self {
        self.options.confirmer = confirmer;
        self
    }

    pub fn checkpoint(mut self, checkpoint: Arc<dyn CheckpointHook>) -> Self {
        self.options.checkpoint = checkpoint;
        self
    }

    pub fn heuristic(mut self, heuristic: Arc<dyn policy::RiskHeuristic>) -> Self {
        self.options.heuristic = heuristic;
        self
    }

    /// Register an in-process capability at build time.
    pub fn local(
        mut self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn LocalCapability>,
    ) -> Self {
        self.locals.push((descriptor, handler));
        self
    }

    /// Attach a handler to a capability declared in the config's
    /// `[[capability]]` section.
    pub fn handler_for(mut self, name: &str, handler: Arc<dyn LocalCapability>) -> Self {
        if let Some(idx) = self.config.capabilities.iter().position(|c| c.name == name) {
            let declared = self.config.capabilities[idx].clone();
            let descriptor = declared.into_descriptor(self.config.default_timeout());
            self.locals.push((descriptor, handler));
        }
        self
    }

    /// Open the audit store, build the engine and register every
    /// configured server (connecting to each).
    pub async fn build(mut self) -> Result<Orchestrator> {
        let run_id = RunId::new();
        let audit = match &self.config.audit.path {
            Some(path) => Some(AuditLog::new(EventStore::open(path)?, run_id)),
            None => None,
        };
        self.options.audit = audit.clone();

        let registry = if self.config.engine.forbid_overwrite {
            Arc::new(CapabilityRegistry::forbid_overwrite())
        } else {
            Arc::new(CapabilityRegistry::new())
        };
        let pool = ConnectionPool::new();
        let engine = ExecutionEngine::new(registry.clone(), pool.clone(), self.options);
        let manager = ServerManager::new(registry.clone(), pool);

        let orchestrator = Orchestrator {
            registry,
            engine,
            manager,
            audit,
            run_id,
        };
        orchestrator.record(EventKind::RunStart);

        for (descriptor, handler) in self.locals.drain(..) {
            orchestrator
                .registry
                .register(descriptor, CapabilityHandler::Local(handler))
                .await?;
        }
        for server in std::mem::take(&mut self.config.servers) {
            orchestrator.register_server(server).await?;
        }

        info!(run_id = %orchestrator.run_id, "orchestrator ready");
        Ok(orchestrator)
    }
}

impl Orchestrator {
    pub fn builder(config: CapstanConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Submit one call and wait for its result.
    pub async fn submit(&self, name: &str, arguments: Value) -> CapabilityResult {
        self.engine.execute(CapabilityCall::new(name, arguments)).await
    }

    pub async fn submit_call(&self, call: CapabilityCall) -> CapabilityResult {
        self.engine.execute(call).await
    }

    /// Submit a dependency-ordered set of calls; results come back in
    /// submission order.
    pub async fn submit_batch(&self, entries: Vec<BatchEntry>) -> Vec<CapabilityResult> {
        self.engine.execute_batch(entries).await
    }

    /// Abort a running call.
    pub fn cancel(&self, call_id: CallId) -> bool {
        self.engine.cancel(call_id)
    }

    pub async fn register_local(
        &self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn LocalCapability>,
    ) -> Result<()> {
        self.registry
            .register(descriptor, CapabilityHandler::Local(handler))
            .await
    }

    /// Connect a capability server and pull its tools into the registry.
    pub async fn register_server(&self, config: ServerConfig) -> Result<()> {
        let name = config.name.clone();
        self.manager.register_server(config).await?;
        self.record(EventKind::ServerRegistered { server: name });
        Ok(())
    }

    /// Disconnect a server and drop everything discovered from it.
    pub async fn unregister_server(&self, name: &str) -> Result<usize> {
        let removed = self.manager.unregister_server(name).await?;
        self.record(EventKind::ServerRemoved {
            server: name.to_string(),
        });
        Ok(removed)
    }

    /// Snapshot of the registered capabilities.
    pub async fn capabilities(
        &self,
        filter: &CapabilityFilter,
    ) -> Vec<Arc<RegisteredCapability>> {
        self.registry.list(filter).await
    }

    /// The audit events recorded for this run so far.
    pub fn audit_trail(&self) -> Result<Vec<storage::Event>> {
        match &self.audit {
            Some(audit) => Ok(audit.replay()?),
            None => Ok(Vec::new()),
        }
    }

    /// End the run: stop server sync tasks and seal the audit trail.
    pub fn shutdown(self) {
        self.manager.shutdown();
        self.record(EventKind::RunEnd);
        info!(run_id = %self.run_id, "orchestrator shut down");
    }

    fn record(&self, kind: EventKind) {
        if let Some(audit) = &self.audit {
            audit.record(kind);
        }
    }
}
