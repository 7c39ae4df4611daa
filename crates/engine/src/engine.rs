//! The execution engine: per-call gating, bounded parallelism and
//! deadline enforcement.
//!
//! A call moves through a fixed sequence: resolve, validate, confirm,
//! checkpoint (write-class only), then run under a concurrency permit
//! with the capability's deadline attached. Every stage failure folds
//! into a [`CapabilityResult`]; `execute` never returns `Err`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use mcp::ConnectionPool;
use policy::{
    ConfirmationDecision, ConfirmationRequest, DefaultRiskHeuristic, PermissionClass, Policy,
    RiskHeuristic, ValidationFailure,
};
use serde_json::Value;
use storage::EventKind;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::call::{CallId, CapabilityCall, CapabilityResult, ErrorKind};
use crate::pipeline;
use crate::registry::{CapabilityHandler, CapabilityRegistry, RegisteredCapability};

/// Calls running at once when no limit is configured.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Solicits approval for calls the confirmation gate flags.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(&self, request: ConfirmationRequest) -> ConfirmationDecision;
}

/// Approves everything. The default for embedders that gate elsewhere.
pub struct AutoApprove;

#[async_trait]
impl ConfirmationHandler for AutoApprove {
    async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationDecision {
        ConfirmationDecision::Approved
    }
}

/// Rejects everything.
pub struct AutoReject;

#[async_trait]
impl ConfirmationHandler for AutoReject {
    async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationDecision {
        ConfirmationDecision::Rejected { reason: None }
    }
}

/// Captures pre-mutation state before a write-class call runs. A returned
/// `Err` aborts the call before the capability is invoked.
#[async_trait]
pub trait CheckpointHook: Send + Sync {
    async fn checkpoint(&self, call: &CapabilityCall) -> Result<(), String>;
}

/// No-op checkpoint.
pub struct NoCheckpoint;

#[async_trait]
impl CheckpointHook for NoCheckpoint {
    async fn checkpoint(&self, _call: &CapabilityCall) -> Result<(), String> {
        Ok(())
    }
}

/// Everything configurable about the engine.
pub struct EngineOptions {
    pub concurrency: usize,
    pub policy: Policy,
    pub heuristic: Arc<dyn RiskHeuristic>,
    pub confirmer: Arc<dyn ConfirmationHandler>,
    pub checkpoint: Arc<dyn CheckpointHook>,
    pub audit: Option<AuditLog>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            policy: Policy::default(),
            heuristic: Arc::new(DefaultRiskHeuristic),
            confirmer: Arc::new(AutoApprove),
            checkpoint: Arc::new(NoCheckpoint),
            audit: None,
        }
    }
}

/// One entry of a batch submission. `depends_on` names an earlier entry
/// (by index) that must finish first; the dependent runs regardless of
/// that entry's outcome.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub call: CapabilityCall,
    pub depends_on: Option<usize>,
}

impl BatchEntry {
    pub fn new(call: CapabilityCall) -> Self {
        Self {
            call,
            depends_on: None,
        }
    }

    pub fn after(call: CapabilityCall, dependency: usize) -> Self {
        Self {
            call,
            depends_on: Some(dependency),
        }
    }
}

pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    pool: ConnectionPool,
    policy: Policy,
    heuristic: Arc<dyn RiskHeuristic>,
    confirmer: Arc<dyn ConfirmationHandler>,
    checkpoint: Arc<dyn CheckpointHook>,
    limiter: Arc<Semaphore>,
    audit: Option<AuditLog>,
    inflight: Mutex<HashMap<CallId, AbortHandle>>,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, pool: ConnectionPool, options: EngineOptions) -> Self {
        Self {
            registry,
            pool,
            policy: options.policy,
            heuristic: options.heuristic,
            confirmer: options.confirmer,
            checkpoint: options.checkpoint,
            limiter: Arc::new(Semaphore::new(options.concurrency.max(1))),
            audit: options.audit,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Run one call to completion. Never returns `Err`; every failure is
    /// folded into the result.
    pub async fn execute(&self, call: CapabilityCall) -> CapabilityResult {
        let started = Instant::now();
        let call_id = call.id;
        let capability = call.name.clone();
        self.record(EventKind::CallSubmitted {
            call_id: call_id.to_string(),
            capability: capability.clone(),
        });

        let result = self.run(call, started).await;

        debug!(
            %call_id,
            capability,
            success = result.success,
            duration_ms = result.metadata.duration_ms,
            "call completed"
        );
        self.record(EventKind::CallCompleted {
            call_id: call_id.to_string(),
            capability,
            success: result.success,
            error_kind: result.error_kind.map(|k| k.as_str().to_string()),
            duration_ms: result.metadata.duration_ms,
        });
        result
    }

    /// Run a set of calls, respecting `depends_on` ordering. Entries with
    /// no dependency relation run concurrently (still under the engine's
    /// permit limit). Results come back in submission order.
    pub async fn execute_batch(&self, entries: Vec<BatchEntry>) -> Vec<CapabilityResult> {
        let mut levels = vec![0usize; entries.len()];
        let mut invalid = vec![false; entries.len()];
        for (idx, entry) in entries.iter().enumerate() {
            match entry.depends_on {
                Some(dep) if dep >= idx => invalid[idx] = true,
                Some(dep) => levels[idx] = levels[dep] + 1,
                None => {}
            }
        }
        let max_level = levels.iter().copied().max().unwrap_or(0);

        let mut slots: Vec<Option<BatchEntry>> = entries.into_iter().map(Some).collect();
        let mut indexed: Vec<(usize, CapabilityResult)> = Vec::with_capacity(slots.len());
        for level in 0..=max_level {
            let mut wave = Vec::new();
            for idx in 0..slots.len() {
                if levels[idx] == level {
                    if let Some(entry) = slots[idx].take() {
                        wave.push((idx, entry));
                    }
                }
            }
            let running = wave.into_iter().map(|(idx, entry)| {
                let bad_dependency = invalid[idx];
                async move {
                    let result = if bad_dependency {
                        CapabilityResult::failure(
                            entry.call.id,
                            Some(ErrorKind::Validation),
                            "depends_on must reference an earlier entry",
                            std::time::Duration::ZERO,
                        )
                    } else {
                        self.execute(entry.call).await
                    };
                    (idx, result)
                }
            });
            let mut finished = futures::future::join_all(running).await;
            indexed.append(&mut finished);
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, result)| result).collect()
    }

    /// Abort a running call. The call resolves as user-rejected. Returns
    /// false if the call is unknown or already finished. Calls still in
    /// their gating stages cannot be aborted.
    pub fn cancel(&self, call_id: CallId) -> bool {
        let handles = lock(&self.inflight);
        match handles.get(&call_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    async fn run(&self, mut call: CapabilityCall, started: Instant) -> CapabilityResult {
        let Some(registered) = self.registry.resolve(&call.name).await else {
            return CapabilityResult::failure(
                call.id,
                Some(ErrorKind::NotFound),
                format!("no capability named {:?}", call.name),
                started.elapsed(),
            );
        };
        let descriptor = &registered.descriptor;

        if let Err(failure) = policy::validate(
            &call.arguments,
            &descriptor.param_schema,
            descriptor.permission,
            &self.policy,
        ) {
            return self.validation_failure(call.id, failure, started);
        }

        let request = ConfirmationRequest {
            capability: descriptor.name.clone(),
            arguments: call.arguments.clone(),
            permission: descriptor.permission,
        };
        if policy::needs_confirmation(descriptor.confirmation, &request, self.heuristic.as_ref()) {
            match self.confirmer.confirm(request).await {
                ConfirmationDecision::Approved => {}
                ConfirmationDecision::Modified(arguments) => {
                    // Substituted arguments go back through the validator.
                    if let Err(failure) = policy::validate(
                        &arguments,
                        &descriptor.param_schema,
                        descriptor.permission,
                        &self.policy,
                    ) {
                        return self.validation_failure(call.id, failure, started);
                    }
                    call.arguments = arguments;
                }
                ConfirmationDecision::Rejected { reason } => {
                    return CapabilityResult::failure(
                        call.id,
                        Some(ErrorKind::UserRejected),
                        reason.unwrap_or_else(|| "rejected by approver".to_string()),
                        started.elapsed(),
                    );
                }
            }
        }

        if descriptor.permission == PermissionClass::Write {
            if let Err(reason) = self.checkpoint.checkpoint(&call).await {
                return CapabilityResult::failure(
                    call.id,
                    Some(ErrorKind::CheckpointFailed),
                    reason,
                    started.elapsed(),
                );
            }
            self.record(EventKind::Checkpoint {
                call_id: call.id.to_string(),
                label: descriptor.name.clone(),
            });
        }

        let Ok(permit) = self.limiter.clone().acquire_owned().await else {
            return CapabilityResult::failure(
                call.id,
                None,
                "engine is shutting down",
                started.elapsed(),
            );
        };

        let deadline = descriptor.timeout;
        let call_id = call.id;
        let mut task = spawn_action(&registered, self.pool.clone(), call, started);
        lock(&self.inflight).insert(call_id, task.abort_handle());

        let outcome = tokio::time::timeout(deadline, &mut task).await;
        lock(&self.inflight).remove(&call_id);
        drop(permit);

        match outcome {
            Err(_) => {
                // The permit is already released; the abandoned task may
                // still be running until its next await point.
                task.abort();
                warn!(%call_id, ?deadline, "call exceeded its deadline, abandoning task");
                CapabilityResult::failure(
                    call_id,
                    Some(ErrorKind::Timeout),
                    format!("deadline of {}ms exceeded", deadline.as_millis()),
                    started.elapsed(),
                )
            }
            Ok(Ok(result)) => result,
            Ok(Err(join)) if join.is_cancelled() => CapabilityResult::failure(
                call_id,
                Some(ErrorKind::UserRejected),
                "cancelled by caller",
                started.elapsed(),
            ),
            Ok(Err(join)) => CapabilityResult::failure(
                call_id,
                None,
                format!("capability task failed: {join}"),
                started.elapsed(),
            ),
        }
    }

    fn validation_failure(
        &self,
        call_id: CallId,
        failure: ValidationFailure,
        started: Instant,
    ) -> CapabilityResult {
        let kind = match &failure {
            ValidationFailure::Schema(_) => ErrorKind::Validation,
            ValidationFailure::PermissionDenied(_) => ErrorKind::PermissionDenied,
        };
        CapabilityResult::failure(call_id, Some(kind), failure.to_string(), started.elapsed())
    }

    fn record(&self, kind: EventKind) {
        if let Some(audit) = &self.audit {
            audit.record(kind);
        }
    }
}

fn spawn_action(
    registered: &RegisteredCapability,
    pool: ConnectionPool,
    call: CapabilityCall,
    started: Instant,
) -> JoinHandle<CapabilityResult> {
    match &registered.handler {
        CapabilityHandler::Local(handler) => {
            let handler = handler.clone();
            tokio::spawn(async move {
                match handler.invoke(call.arguments).await {
                    Ok(output) => CapabilityResult::success(call.id, output, started.elapsed()),
                    Err(message) => CapabilityResult::handler_failure(
                        call.id,
                        Value::String(message),
                        started.elapsed(),
                    ),
                }
            })
        }
        CapabilityHandler::Remote { server } => {
            let server = server.clone();
            tokio::spawn(async move {
                let outcome = match pool.acquire(&server).await {
                    Ok(client) => client.call_tool(&call.name, Some(call.arguments)).await,
                    Err(error) => Err(error),
                };
                pipeline::remote_result(call.id, outcome, started.elapsed())
            })
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CapabilityDescriptor;
    use crate::registry::LocalCapability;
    use policy::ConfirmationPolicy;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl LocalCapability for Echo {
        async fn invoke(&self, arguments: Value) -> Result<Value, String> {
            Ok(arguments)
        }
    }

    struct Sleeper(Duration);

    #[async_trait]
    impl LocalCapability for Sleeper {
        async fn invoke(&self, _arguments: Value) -> Result<Value, String> {
            tokio::time::sleep(self.0).await;
            Ok(json!("done"))
        }
    }

    /// Counts invocations and tracks the concurrency high-water mark.
    #[derive(Default)]
    struct Tracker {
        invocations: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Tracked {
        tracker: Arc<Tracker>,
        hold: Duration,
    }

    #[async_trait]
    impl LocalCapability for Tracked {
        async fn invoke(&self, _arguments: Value) -> Result<Value, String> {
            self.tracker.invocations.fetch_add(1, Ordering::SeqCst);
            let now = self.tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.tracker.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.tracker.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    /// Confirmation handler that counts how often it is consulted.
    struct CountingConfirmer {
        consulted: AtomicUsize,
        decision: ConfirmationDecision,
    }

    impl CountingConfirmer {
        fn new(decision: ConfirmationDecision) -> Arc<Self> {
            Arc::new(Self {
                consulted: AtomicUsize::new(0),
                decision,
            })
        }
    }

    #[async_trait]
    impl ConfirmationHandler for CountingConfirmer {
        async fn confirm(&self, _request: ConfirmationRequest) -> ConfirmationDecision {
            self.consulted.fetch_add(1, Ordering::SeqCst);
            self.decision.clone()
        }
    }

    struct FailingCheckpoint;

    #[async_trait]
    impl CheckpointHook for FailingCheckpoint {
        async fn checkpoint(&self, _call: &CapabilityCall) -> Result<(), String> {
            Err("snapshot volume unavailable".to_string())
        }
    }

    async fn engine_with(
        capabilities: Vec<(CapabilityDescriptor, Arc<dyn LocalCapability>)>,
        options: EngineOptions,
    ) -> ExecutionEngine {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let registry = Arc::new(CapabilityRegistry::new());
        for (descriptor, handler) in capabilities {
            registry
                .register(descriptor, CapabilityHandler::Local(handler))
                .await
                .unwrap();
        }
        ExecutionEngine::new(registry, ConnectionPool::new(), options)
    }

    #[tokio::test]
    async fn local_call_succeeds_end_to_end() {
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("echo", json!({"type": "object"}))
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Echo),
            )],
            EngineOptions::default(),
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("echo", json!({"msg": "hi"})))
            .await;
        assert!(result.success);
        assert_eq!(result.output, json!({"msg": "hi"}));
        assert!(result.metadata.bytes_produced > 0);
    }

    #[tokio::test]
    async fn unknown_capability_is_not_found() {
        let engine = engine_with(vec![], EngineOptions::default()).await;
        let result = engine
            .execute(CapabilityCall::new("nope", Value::Null))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn schema_violation_short_circuits_before_confirmation() {
        let confirmer = CountingConfirmer::new(ConfirmationDecision::Approved);
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local(
                    "strict",
                    json!({"type": "object", "required": ["path"]}),
                )
                .confirmation(ConfirmationPolicy::Always),
                Arc::new(Echo),
            )],
            EngineOptions {
                confirmer: confirmer.clone(),
                ..Default::default()
            },
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("strict", json!({})))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Validation));
        assert_eq!(confirmer.consulted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn denied_permission_never_reaches_the_gate() {
        let confirmer = CountingConfirmer::new(ConfirmationDecision::Approved);
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("run_cmd", Value::Null)
                    .permission(PermissionClass::Shell)
                    .confirmation(ConfirmationPolicy::Always),
                Arc::new(Echo),
            )],
            EngineOptions {
                policy: Policy::restrictive(),
                confirmer: confirmer.clone(),
                ..Default::default()
            },
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("run_cmd", json!({"cmd": "ls"})))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::PermissionDenied));
        assert_eq!(confirmer.consulted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn never_policy_skips_the_confirmer() {
        let confirmer = CountingConfirmer::new(ConfirmationDecision::Rejected { reason: None });
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("quiet", Value::Null)
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Echo),
            )],
            EngineOptions {
                confirmer: confirmer.clone(),
                ..Default::default()
            },
        )
        .await;

        let result = engine.execute(CapabilityCall::new("quiet", json!(1))).await;
        assert!(result.success);
        assert_eq!(confirmer.consulted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejection_resolves_without_invoking() {
        let tracker = Arc::new(Tracker::default());
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("guarded", Value::Null)
                    .confirmation(ConfirmationPolicy::Always),
                Arc::new(Tracked {
                    tracker: tracker.clone(),
                    hold: Duration::ZERO,
                }),
            )],
            EngineOptions {
                confirmer: CountingConfirmer::new(ConfirmationDecision::Rejected {
                    reason: Some("not today".to_string()),
                }),
                ..Default::default()
            },
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("guarded", Value::Null))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::UserRejected));
        assert_eq!(result.output, json!("not today"));
        assert_eq!(tracker.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn modified_arguments_substitute_and_revalidate() {
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("edit", json!({"type": "object"}))
                    .confirmation(ConfirmationPolicy::Always),
                Arc::new(Echo),
            )],
            EngineOptions {
                confirmer: CountingConfirmer::new(ConfirmationDecision::Modified(
                    json!({"path": "/tmp/safe"}),
                )),
                ..Default::default()
            },
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("edit", json!({"path": "/etc/passwd"})))
            .await;
        assert!(result.success);
        assert_eq!(result.output, json!({"path": "/tmp/safe"}));
    }

    #[tokio::test]
    async fn failed_checkpoint_aborts_before_invocation() {
        let tracker = Arc::new(Tracker::default());
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("write_file", Value::Null)
                    .permission(PermissionClass::Write)
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Tracked {
                    tracker: tracker.clone(),
                    hold: Duration::ZERO,
                }),
            )],
            EngineOptions {
                checkpoint: Arc::new(FailingCheckpoint),
                ..Default::default()
            },
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("write_file", Value::Null))
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::CheckpointFailed));
        assert_eq!(result.output, json!("snapshot volume unavailable"));
        assert_eq!(tracker.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_error_is_failure_without_kind() {
        struct Broken;

        #[async_trait]
        impl LocalCapability for Broken {
            async fn invoke(&self, _arguments: Value) -> Result<Value, String> {
                Err("disk on fire".to_string())
            }
        }

        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("broken", Value::Null)
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Broken),
            )],
            EngineOptions::default(),
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("broken", Value::Null))
            .await;
        assert!(!result.success);
        assert!(result.error_kind.is_none());
        assert_eq!(result.output, json!("disk on fire"));
    }

    #[tokio::test]
    async fn deadline_expiry_abandons_and_frees_the_slot() {
        let engine = engine_with(
            vec![
                (
                    CapabilityDescriptor::local("slow", Value::Null)
                        .confirmation(ConfirmationPolicy::Never)
                        .timeout(Duration::from_millis(50)),
                    Arc::new(Sleeper(Duration::from_secs(30))),
                ),
                (
                    CapabilityDescriptor::local("fast", Value::Null)
                        .confirmation(ConfirmationPolicy::Never),
                    Arc::new(Echo),
                ),
            ],
            EngineOptions {
                concurrency: 1,
                ..Default::default()
            },
        )
        .await;

        let result = engine.execute(CapabilityCall::new("slow", Value::Null)).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));

        // With a single permit, the next call only runs if the expired
        // call released its slot.
        let next = tokio::time::timeout(
            Duration::from_secs(1),
            engine.execute(CapabilityCall::new("fast", json!("ok"))),
        )
        .await
        .unwrap();
        assert!(next.success);
    }

    #[tokio::test]
    async fn concurrency_limit_is_a_hard_ceiling() {
        let tracker = Arc::new(Tracker::default());
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("busy", Value::Null)
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Tracked {
                    tracker: tracker.clone(),
                    hold: Duration::from_millis(30),
                }),
            )],
            EngineOptions {
                concurrency: 3,
                ..Default::default()
            },
        )
        .await;

        let entries: Vec<BatchEntry> = (0..10)
            .map(|_| BatchEntry::new(CapabilityCall::new("busy", Value::Null)))
            .collect();
        let results = engine.execute_batch(entries).await;

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(tracker.invocations.load(Ordering::SeqCst), 10);
        assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn batch_dependencies_complete_in_order() {
        let order: Arc<std::sync::Mutex<Vec<String>>> = Arc::default();

        struct Recorder {
            name: &'static str,
            delay: Duration,
            order: Arc<std::sync::Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl LocalCapability for Recorder {
            async fn invoke(&self, _arguments: Value) -> Result<Value, String> {
                tokio::time::sleep(self.delay).await;
                lock(&self.order).push(self.name.to_string());
                Ok(Value::Null)
            }
        }

        let engine = engine_with(
            vec![
                (
                    CapabilityDescriptor::local("first", Value::Null)
                        .confirmation(ConfirmationPolicy::Never),
                    Arc::new(Recorder {
                        name: "first",
                        delay: Duration::from_millis(80),
                        order: order.clone(),
                    }),
                ),
                (
                    CapabilityDescriptor::local("second", Value::Null)
                        .confirmation(ConfirmationPolicy::Never),
                    Arc::new(Recorder {
                        name: "second",
                        delay: Duration::ZERO,
                        order: order.clone(),
                    }),
                ),
            ],
            EngineOptions::default(),
        )
        .await;

        let results = engine
            .execute_batch(vec![
                BatchEntry::new(CapabilityCall::new("first", Value::Null)),
                BatchEntry::after(CapabilityCall::new("second", Value::Null), 0),
            ])
            .await;

        assert!(results.iter().all(|r| r.success));
        let seen = lock(&order).clone();
        assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn dependent_runs_even_when_dependency_fails() {
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("echo", Value::Null)
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Echo),
            )],
            EngineOptions::default(),
        )
        .await;

        let results = engine
            .execute_batch(vec![
                BatchEntry::new(CapabilityCall::new("missing", Value::Null)),
                BatchEntry::after(CapabilityCall::new("echo", json!("still runs")), 0),
            ])
            .await;

        assert_eq!(results[0].error_kind, Some(ErrorKind::NotFound));
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn forward_dependency_fails_validation() {
        let engine = engine_with(vec![], EngineOptions::default()).await;
        let results = engine
            .execute_batch(vec![BatchEntry::after(
                CapabilityCall::new("echo", Value::Null),
                0,
            )])
            .await;
        assert_eq!(results[0].error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn cancel_aborts_a_running_call() {
        let engine = Arc::new(
            engine_with(
                vec![(
                    CapabilityDescriptor::local("stuck", Value::Null)
                        .confirmation(ConfirmationPolicy::Never)
                        .timeout(Duration::from_secs(60)),
                    Arc::new(Sleeper(Duration::from_secs(60))),
                )],
                EngineOptions::default(),
            )
            .await,
        );

        let call = CapabilityCall::new("stuck", Value::Null);
        let call_id = call.id;
        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute(call).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.cancel(call_id));
        let result = running.await.unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::UserRejected));
        assert!(!engine.cancel(call_id));
    }

    #[tokio::test]
    async fn audit_trail_records_submission_and_completion() {
        let audit = AuditLog::new(storage::EventStore::in_memory().unwrap(), storage::RunId::new());
        let engine = engine_with(
            vec![(
                CapabilityDescriptor::local("save", Value::Null)
                    .permission(PermissionClass::Write)
                    .confirmation(ConfirmationPolicy::Never),
                Arc::new(Echo),
            )],
            EngineOptions {
                policy: Policy::permissive(),
                audit: Some(audit.clone()),
                ..Default::default()
            },
        )
        .await;

        let result = engine
            .execute(CapabilityCall::new("save", json!({"k": "v"})))
            .await;
        assert!(result.success);

        let events = audit.replay().unwrap();
        let kinds: Vec<&EventKind> = events.iter().map(|e| &e.kind).collect();
        assert!(matches!(kinds[0], EventKind::CallSubmitted { .. }));
        assert!(matches!(kinds[1], EventKind::Checkpoint { .. }));
        assert!(matches!(
            kinds[2],
            EventKind::CallCompleted { success: true, .. }
        ));
    }
}
