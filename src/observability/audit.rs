/// Structured audit events for the execution lifecycle.
///
/// Every event is one JSON object written through the `log` facade under the
/// `execbox::audit` target, so operators can route it with `RUST_LOG` like
/// any other log line.
use crate::config::types::{ErrorKind, ExecutionStatus};
use crate::kernel::process_group::KillReport;
use serde::{Deserialize, Serialize};

pub const AUDIT_TARGET: &str = "execbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    #[serde(rename = "high")]
    High,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "low")]
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExecutionStart,
    ExecutionEnd,
    /// Wall-clock budget expired and the group was torn down
    TimeoutKill,
    /// The group ignored SIGTERM and needed SIGKILL
    ForcedKill,
    AdmissionRejected,
    CleanupFailure,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::ExecutionStart | AuditEventType::ExecutionEnd => AuditSeverity::Low,
            AuditEventType::TimeoutKill | AuditEventType::AdmissionRejected => {
                AuditSeverity::Medium
            }
            AuditEventType::ForcedKill | AuditEventType::CleanupFailure => AuditSeverity::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ExecutionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kill_report: Option<KillReport>,
    pub details: String,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, execution_id: &str, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: chrono::Utc::now(),
            execution_id: execution_id.to_string(),
            correlation_id: None,
            language: None,
            policy_id: None,
            status: None,
            error_kind: None,
            duration_millis: None,
            kill_report: None,
            details: details.into(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(str::to_string);
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn with_policy(mut self, policy_id: &str) -> Self {
        self.policy_id = Some(policy_id.to_string());
        self
    }

    pub fn with_outcome(
        mut self,
        status: ExecutionStatus,
        error_kind: Option<ErrorKind>,
        duration_millis: u64,
    ) -> Self {
        self.status = Some(status);
        self.error_kind = error_kind;
        self.duration_millis = Some(duration_millis);
        self
    }

    pub fn with_kill_report(mut self, report: &KillReport) -> Self {
        self.kill_report = Some(report.clone());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"event_type\":\"{:?}\",\"serialization_error\":\"{}\"}}",
                self.event_type, e
            )
        })
    }
}

/// Write an audit event to the log at a level matching its severity.
pub fn emit(event: &AuditEvent) {
    let line = event.to_json();
    match event.severity {
        AuditSeverity::High => log::warn!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Medium | AuditSeverity::Low => log::info!(target: AUDIT_TARGET, "{}", line),
    }
}
