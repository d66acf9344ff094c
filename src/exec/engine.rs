use crate::adapters::{AdapterRegistry, LanguageAdapter};
use crate::config::loader::EngineConfig;
use crate::config::policy::{PolicyRegistry, SandboxPolicy};
use crate::config::types::{
    EngineError, ErrorKind, ExecutionLimits, ExecutionRequest, ExecutionResult, ExecutionStatus,
    Language, LimitOverrides, ResultBuilder,
};
use crate::core::supervisor::Supervisor;
use crate::core::types::{CancelToken, RawOutcome};
use crate::exec::admission::{AdmissionLimiter, AdmissionPermit};
use crate::exec::handle::{ExecutionHandle, StatusCell};
use crate::observability::audit::{self, AuditEvent, AuditEventType};
use crate::observability::metrics::Metrics;
use crate::safety::workspace::WorkspaceManager;
use crate::verdict::ResultClassifier;
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A request that got past language resolution and admission
struct Admitted {
    execution_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    started: Instant,
    policy: Arc<SandboxPolicy>,
    _permit: AdmissionPermit,
}

/// The execution engine: resolves a policy, runs the code in a fresh
/// workspace and hands back a normalized result.
///
/// Stateless across calls. Everything shared between executions is either
/// read-only (policies, adapters) or atomic (admission, metrics).
pub struct Engine {
    config: EngineConfig,
    policies: PolicyRegistry,
    adapters: AdapterRegistry,
    workspaces: WorkspaceManager,
    supervisor: Supervisor,
    admission: AdmissionLimiter,
    metrics: Arc<Metrics>,
}

impl Engine {
    /// Build an engine from configuration, with the builtin adapters.
    pub fn new(config: EngineConfig) -> crate::config::types::Result<Self> {
        let policies = PolicyRegistry::from_config(&config)?;
        Self::with_parts(config, policies, AdapterRegistry::builtin())
    }

    /// Build an engine with explicit policies and adapters.
    pub fn with_parts(
        config: EngineConfig,
        policies: PolicyRegistry,
        adapters: AdapterRegistry,
    ) -> crate::config::types::Result<Self> {
        config.validate()?;
        let workspaces = WorkspaceManager::new(config.workspace_root.clone())?;

        if let Some(max_age) = config.stale_workspace_max_age_secs {
            match workspaces.sweep_stale(Duration::from_secs(max_age)) {
                Ok(0) => {}
                Ok(n) => log::info!("Removed {} stale workspace(s)", n),
                Err(e) => log::warn!("Stale workspace sweep failed: {}", e),
            }
        }

        log::info!(
            "Engine ready: {} language(s), workspace root {}, concurrency ceiling {}",
            policies.len(),
            workspaces.root().display(),
            config.max_concurrent_executions
        );

        Ok(Self {
            supervisor: Supervisor::new(config.kill_grace(), config.output_drain_timeout()),
            admission: AdmissionLimiter::new(config.max_concurrent_executions),
            metrics: Arc::new(Metrics::new()),
            config,
            policies,
            adapters,
            workspaces,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Executions currently holding an admission slot
    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    /// Policy defaults, then caller overrides, clamped to the hard ceiling.
    pub fn effective_limits(
        &self,
        policy: &SandboxPolicy,
        overrides: Option<&LimitOverrides>,
    ) -> ExecutionLimits {
        let requested = match overrides {
            Some(overrides) => policy.default_limits.with_overrides(overrides),
            None => policy.default_limits.clone(),
        };
        if !requested.fits_within(&self.config.hard_ceiling) {
            log::debug!("Requested limits {:?} clamped to the hard ceiling", requested);
        }
        requested.clamp_to(&self.config.hard_ceiling)
    }

    /// Run `code` written in `language` (any accepted alias). Unknown
    /// language names come back as a rejected result.
    pub fn execute_source(
        &self,
        code: &str,
        language: &str,
        limits: Option<LimitOverrides>,
    ) -> ExecutionResult {
        match language.parse::<Language>() {
            Ok(language) => {
                let mut request = ExecutionRequest::new(code, language);
                if let Some(limits) = limits {
                    request = request.with_limits(limits);
                }
                self.execute(request)
            }
            Err(e) => self.reject(
                &new_execution_id(),
                language,
                None,
                ErrorKind::UnsupportedLanguage,
                &e.to_string(),
            ),
        }
    }

    /// Blocking execution
    pub fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute_with_cancel(request, &CancelToken::new())
    }

    /// Blocking execution that stops early once `cancel` fires
    pub fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        match self.admit(&request, new_execution_id()) {
            Ok(admitted) => self.run_admitted(admitted, &request, cancel, &StatusCell::new()),
            Err(rejected) => rejected,
        }
    }

    /// Start an execution on its own thread.
    ///
    /// Admission is decided before this returns: a rejected request yields a
    /// handle whose result is already available.
    pub fn submit(self: &Arc<Self>, request: ExecutionRequest) -> ExecutionHandle {
        let execution_id = new_execution_id();
        let language = request.language().as_str();
        let status = StatusCell::new();
        let cancel = CancelToken::new();
        let (tx, rx) = bounded(1);
        let handle = ExecutionHandle::new(
            execution_id.clone(),
            language.to_string(),
            status.clone(),
            cancel.clone(),
            rx,
        );

        let admitted = match self.admit(&request, execution_id.clone()) {
            Ok(admitted) => admitted,
            Err(rejected) => {
                status.set(rejected.status());
                let _ = tx.send(rejected);
                return handle;
            }
        };

        let engine = Arc::clone(self);
        let worker_tx = tx.clone();
        let worker_status = status.clone();
        let spawned = thread::Builder::new()
            .name(format!("execbox-{}", &execution_id[..8.min(execution_id.len())]))
            .spawn(move || {
                let result = engine.run_admitted(admitted, &request, &cancel, &worker_status);
                let _ = worker_tx.send(result);
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn worker for {}: {}", execution_id, e);
            let result = ResultBuilder::new(&execution_id, language, chrono::Utc::now())
                .outcome(ExecutionStatus::Error, Some(ErrorKind::InternalError))
                .message(format!("failed to start execution worker: {}", e))
                .finish(Duration::ZERO);
            self.metrics.record_execution(result.status(), Duration::ZERO);
            status.set(result.status());
            let _ = tx.send(result);
        }

        handle
    }

    /// Resolve the policy and claim an admission slot. Neither step touches
    /// the filesystem or spawns anything.
    fn admit(
        &self,
        request: &ExecutionRequest,
        execution_id: String,
    ) -> std::result::Result<Admitted, ExecutionResult> {
        let language = request.language();

        let policy = match self.policies.resolve(language) {
            Ok(policy) => policy,
            Err(e) => {
                return Err(self.reject(
                    &execution_id,
                    language.as_str(),
                    request.correlation_id(),
                    ErrorKind::UnsupportedLanguage,
                    &e.to_string(),
                ))
            }
        };

        let Some(permit) = self.admission.try_acquire() else {
            let reason = format!(
                "concurrency ceiling of {} executions reached",
                self.admission.ceiling()
            );
            audit::emit(
                &AuditEvent::new(AuditEventType::AdmissionRejected, &execution_id, &reason)
                    .with_correlation_id(request.correlation_id())
                    .with_language(language.as_str()),
            );
            return Err(self.reject(
                &execution_id,
                language.as_str(),
                request.correlation_id(),
                ErrorKind::CapacityExceeded,
                &reason,
            ));
        };

        Ok(Admitted {
            execution_id,
            started_at: chrono::Utc::now(),
            started: Instant::now(),
            policy,
            _permit: permit,
        })
    }

    fn reject(
        &self,
        execution_id: &str,
        language: &str,
        correlation_id: Option<&str>,
        kind: ErrorKind,
        reason: &str,
    ) -> ExecutionResult {
        log::info!("Rejected execution {} ({}): {}", execution_id, language, reason);
        let result = ResultBuilder::new(execution_id, language, chrono::Utc::now())
            .correlation_id(correlation_id)
            .outcome(ExecutionStatus::Rejected, Some(kind))
            .message(reason)
            .finish(Duration::ZERO);
        self.metrics.record_execution(result.status(), Duration::ZERO);
        result
    }

    fn run_admitted(
        &self,
        admitted: Admitted,
        request: &ExecutionRequest,
        cancel: &CancelToken,
        status: &StatusCell,
    ) -> ExecutionResult {
        let policy = Arc::clone(&admitted.policy);
        let language = request.language();
        let limits = self.effective_limits(&policy, request.limits());

        let adapter = self.adapters.get(language);
        let strategy = match &adapter {
            Ok(adapter) => adapter.strategy().as_str(),
            Err(_) => "none",
        };

        status.set(ExecutionStatus::Running);
        self.metrics.active_executions.inc();
        audit::emit(
            &AuditEvent::new(
                AuditEventType::ExecutionStart,
                &admitted.execution_id,
                format!(
                    "strategy={} timeout={}ms memory={}B output={}B",
                    strategy,
                    limits.timeout_millis,
                    limits.memory_limit_bytes,
                    limits.max_captured_output_bytes
                ),
            )
            .with_correlation_id(request.correlation_id())
            .with_language(language.as_str())
            .with_policy(&policy.id),
        );

        let builder = ResultBuilder::new(
            &admitted.execution_id,
            language.as_str(),
            admitted.started_at,
        )
        .correlation_id(request.correlation_id())
        .policy(&policy.id, &policy.fingerprint());

        let result = match adapter {
            Ok(adapter) => {
                match self.run_in_workspace(&admitted, adapter, &policy, &limits, request, cancel) {
                    Ok(raw) => self.classify(builder, &raw, adapter, request.code(), &limits),
                    Err(e) => internal_error(builder, &e),
                }
            }
            Err(e) => internal_error(builder, &e),
        }
        .finish(admitted.started.elapsed());

        self.metrics.active_executions.dec();
        self.metrics
            .record_execution(result.status(), admitted.started.elapsed());
        audit::emit(
            &AuditEvent::new(
                AuditEventType::ExecutionEnd,
                &admitted.execution_id,
                result.message().unwrap_or(""),
            )
            .with_correlation_id(request.correlation_id())
            .with_language(language.as_str())
            .with_policy(&policy.id)
            .with_outcome(result.status(), result.error_kind(), result.duration_millis()),
        );
        log::info!(
            "Execution {} finished: {} in {} ms",
            admitted.execution_id,
            result.status(),
            result.duration_millis()
        );

        status.set(result.status());
        result
    }

    /// Acquire, prepare, run, release. The workspace is released on every
    /// path out of here, and dropped as a fallback if release itself panics.
    fn run_in_workspace(
        &self,
        admitted: &Admitted,
        adapter: &dyn LanguageAdapter,
        policy: &SandboxPolicy,
        limits: &ExecutionLimits,
        request: &ExecutionRequest,
        cancel: &CancelToken,
    ) -> crate::config::types::Result<RawOutcome> {
        let workspace = self.workspaces.acquire(&admitted.execution_id)?;

        let outcome = adapter
            .prepare(request.code(), policy, &workspace, limits)
            .and_then(|steps| self.supervisor.run(&steps, policy, limits, cancel));

        if let Err(e) = self.workspaces.release(workspace) {
            self.metrics.cleanup_failures.inc();
            audit::emit(
                &AuditEvent::new(
                    AuditEventType::CleanupFailure,
                    &admitted.execution_id,
                    e.to_string(),
                )
                .with_policy(&policy.id),
            );
        }

        if let Ok(raw) = &outcome {
            self.record_kills(admitted, raw);
        }
        outcome
    }

    fn record_kills(&self, admitted: &Admitted, raw: &RawOutcome) {
        for step in &raw.steps {
            let Some(report) = &step.kill_report else {
                continue;
            };
            if step.timed_out {
                self.metrics.timeout_kills.inc();
                audit::emit(
                    &AuditEvent::new(
                        AuditEventType::TimeoutKill,
                        &admitted.execution_id,
                        format!("{:?} step exceeded its wall-clock budget", step.kind),
                    )
                    .with_kill_report(report),
                );
            }
            if report.kill_sent {
                self.metrics.forced_kills.inc();
                audit::emit(
                    &AuditEvent::new(
                        AuditEventType::ForcedKill,
                        &admitted.execution_id,
                        "process group outlived the grace period",
                    )
                    .with_kill_report(report),
                );
            }
        }
    }

    fn classify(
        &self,
        builder: ResultBuilder,
        raw: &RawOutcome,
        adapter: &dyn LanguageAdapter,
        code: &str,
        limits: &ExecutionLimits,
    ) -> ResultBuilder {
        let source_name = adapter.source_file_name(code);
        let verdict = ResultClassifier::classify(raw, adapter, &source_name);

        let mut builder = builder
            .outcome(verdict.status, verdict.error_kind)
            .exit(raw.exit_code(), raw.signal())
            .stages(raw.stage_reports())
            .diagnostic(verdict.diagnostic);

        if let Some(last) = raw.last() {
            builder = builder.streams(
                last.stdout.text.clone(),
                last.stderr.text.clone(),
                last.stdout.truncated,
                last.stderr.truncated,
            );
        }

        match verdict.status {
            ExecutionStatus::Timeout => builder.message(format!(
                "wall-clock limit of {} ms exceeded",
                limits.timeout_millis
            )),
            ExecutionStatus::Cancelled => builder.message("cancelled by caller"),
            ExecutionStatus::Error if verdict.error_kind == Some(ErrorKind::InternalError) => {
                builder.message("no step ran")
            }
            _ => builder,
        }
    }
}

fn internal_error(builder: ResultBuilder, error: &EngineError) -> ResultBuilder {
    log::error!("Execution failed inside the engine: {}", error);
    builder
        .outcome(ExecutionStatus::Error, Some(ErrorKind::InternalError))
        .message(error.to_string())
}

fn new_execution_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
