/// Core types shared by every execbox layer
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Languages the engine knows how to run.
///
/// Whether a language is actually accepted is decided by the policy registry;
/// a variant without a registered policy resolves to `UnsupportedLanguage`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Language {
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "javascript")]
    JavaScript,
    #[serde(rename = "java")]
    Java,
    #[serde(rename = "cpp")]
    Cpp,
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Python,
        Language::JavaScript,
        Language::Java,
        Language::Cpp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "java" => Ok(Language::Java),
            "cpp" | "c++" | "cxx" | "cc" => Ok(Language::Cpp),
            _ => Err(EngineError::UnsupportedLanguage(value.to_string())),
        }
    }
}

/// Effective resource limits for one execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Wall-clock budget of the run step
    pub timeout_millis: u64,
    /// OS memory ceiling for the child process
    pub memory_limit_bytes: u64,
    /// Per-stream capture ceiling
    pub max_captured_output_bytes: usize,
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    pub fn memory_limit_mb(&self) -> u64 {
        (self.memory_limit_bytes / (1024 * 1024)).max(1)
    }

    /// Replace the fields the caller supplied, keeping the rest.
    pub fn with_overrides(&self, overrides: &LimitOverrides) -> Self {
        Self {
            timeout_millis: overrides.timeout_millis.unwrap_or(self.timeout_millis),
            memory_limit_bytes: overrides
                .memory_limit_bytes
                .unwrap_or(self.memory_limit_bytes),
            max_captured_output_bytes: overrides
                .max_captured_output_bytes
                .unwrap_or(self.max_captured_output_bytes),
        }
    }

    /// Clamp every field into `1..=ceiling`.
    pub fn clamp_to(&self, ceiling: &ExecutionLimits) -> Self {
        Self {
            timeout_millis: self.timeout_millis.clamp(1, ceiling.timeout_millis),
            memory_limit_bytes: self.memory_limit_bytes.clamp(1, ceiling.memory_limit_bytes),
            max_captured_output_bytes: self
                .max_captured_output_bytes
                .clamp(1, ceiling.max_captured_output_bytes),
        }
    }

    /// True when no field exceeds the matching ceiling field.
    pub fn fits_within(&self, ceiling: &ExecutionLimits) -> bool {
        self.timeout_millis <= ceiling.timeout_millis
            && self.memory_limit_bytes <= ceiling.memory_limit_bytes
            && self.max_captured_output_bytes <= ceiling.max_captured_output_bytes
    }
}

/// Caller-supplied overrides; unset fields fall back to the policy defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitOverrides {
    pub timeout_millis: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub max_captured_output_bytes: Option<usize>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self.timeout_millis.is_none()
            && self.memory_limit_bytes.is_none()
            && self.max_captured_output_bytes.is_none()
    }
}

/// One unit of work handed to the engine. Immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRequest {
    code: String,
    language: Language,
    limits: Option<LimitOverrides>,
    correlation_id: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: Language) -> Self {
        Self {
            code: code.into(),
            language,
            limits: None,
            correlation_id: None,
        }
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn limits(&self) -> Option<&LimitOverrides> {
        self.limits.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}

/// Lifecycle of an execution. Everything after `Running` is terminal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Rejected => "rejected",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ExecutionStatus::Pending => 0,
            ExecutionStatus::Running => 1,
            ExecutionStatus::Completed => 2,
            ExecutionStatus::Error => 3,
            ExecutionStatus::Timeout => 4,
            ExecutionStatus::Rejected => 5,
            ExecutionStatus::Cancelled => 6,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutionStatus::Pending,
            1 => ExecutionStatus::Running,
            2 => ExecutionStatus::Completed,
            3 => ExecutionStatus::Error,
            4 => ExecutionStatus::Timeout,
            5 => ExecutionStatus::Rejected,
            _ => ExecutionStatus::Cancelled,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy carried by every non-completed result.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedLanguage,
    CompileError,
    SyntaxError,
    RuntimeError,
    TimeoutExceeded,
    ResourceLimitExceeded,
    InternalError,
    CapacityExceeded,
    Cancelled,
}

impl ErrorKind {
    /// Only infrastructure faults are retry-eligible; user-code failures are
    /// deterministic for the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::InternalError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageKind {
    #[serde(rename = "compile")]
    Compile,
    #[serde(rename = "run")]
    Run,
}

/// What happened to one subprocess step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReport {
    pub kind: StageKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_millis: u64,
    pub timed_out: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagnosticCategory {
    #[serde(rename = "syntax")]
    Syntax,
    #[serde(rename = "compile")]
    Compile,
    #[serde(rename = "import")]
    Import,
    #[serde(rename = "type")]
    Type,
    #[serde(rename = "capability_denied")]
    CapabilityDenied,
    #[serde(rename = "resource")]
    Resource,
    #[serde(rename = "runtime")]
    Runtime,
    #[serde(rename = "other")]
    Other,
}

/// Human-facing summary of why user code failed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub category: DiagnosticCategory,
    /// Line in the submitted source, when the toolchain reported one
    pub line: Option<u32>,
    pub summary: String,
}

/// Normalized, immutable record returned for every execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    execution_id: String,
    correlation_id: Option<String>,
    language: String,
    status: ExecutionStatus,
    error_kind: Option<ErrorKind>,
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
    exit_code: Option<i32>,
    signal: Option<i32>,
    duration_millis: u64,
    stages: Vec<StageReport>,
    diagnostic: Option<Diagnostic>,
    message: Option<String>,
    policy_id: Option<String>,
    policy_fingerprint: Option<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: chrono::DateTime<chrono::Utc>,
}

impl ExecutionResult {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_kind
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn stdout_truncated(&self) -> bool {
        self.stdout_truncated
    }

    pub fn stderr_truncated(&self) -> bool {
        self.stderr_truncated
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    pub fn duration_millis(&self) -> u64 {
        self.duration_millis
    }

    pub fn stages(&self) -> &[StageReport] {
        &self.stages
    }

    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        self.diagnostic.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn policy_id(&self) -> Option<&str> {
        self.policy_id.as_deref()
    }

    pub fn policy_fingerprint(&self) -> Option<&str> {
        self.policy_fingerprint.as_deref()
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.finished_at
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn ran_stage(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|stage| stage.kind == kind)
    }
}

/// Assembles an `ExecutionResult`; only the engine and classifier build results.
#[derive(Debug)]
pub(crate) struct ResultBuilder {
    result: ExecutionResult,
}

impl ResultBuilder {
    pub(crate) fn new(
        execution_id: &str,
        language: &str,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            result: ExecutionResult {
                execution_id: execution_id.to_string(),
                correlation_id: None,
                language: language.to_string(),
                status: ExecutionStatus::Error,
                error_kind: Some(ErrorKind::InternalError),
                stdout: String::new(),
                stderr: String::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                exit_code: None,
                signal: None,
                duration_millis: 0,
                stages: Vec::new(),
                diagnostic: None,
                message: None,
                policy_id: None,
                policy_fingerprint: None,
                started_at,
                finished_at: started_at,
            },
        }
    }

    pub(crate) fn correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.result.correlation_id = correlation_id.map(str::to_string);
        self
    }

    pub(crate) fn outcome(mut self, status: ExecutionStatus, error_kind: Option<ErrorKind>) -> Self {
        self.result.status = status;
        self.result.error_kind = if status == ExecutionStatus::Completed {
            None
        } else {
            error_kind
        };
        self
    }

    pub(crate) fn streams(
        mut self,
        stdout: String,
        stderr: String,
        stdout_truncated: bool,
        stderr_truncated: bool,
    ) -> Self {
        self.result.stdout = stdout;
        self.result.stderr = stderr;
        self.result.stdout_truncated = stdout_truncated;
        self.result.stderr_truncated = stderr_truncated;
        self
    }

    pub(crate) fn exit(mut self, exit_code: Option<i32>, signal: Option<i32>) -> Self {
        self.result.exit_code = exit_code;
        self.result.signal = signal;
        self
    }

    pub(crate) fn stages(mut self, stages: Vec<StageReport>) -> Self {
        self.result.stages = stages;
        self
    }

    pub(crate) fn diagnostic(mut self, diagnostic: Option<Diagnostic>) -> Self {
        self.result.diagnostic = diagnostic;
        self
    }

    pub(crate) fn message(mut self, message: impl Into<String>) -> Self {
        self.result.message = Some(message.into());
        self
    }

    pub(crate) fn policy(mut self, id: &str, fingerprint: &str) -> Self {
        self.result.policy_id = Some(id.to_string());
        self.result.policy_fingerprint = Some(fingerprint.to_string());
        self
    }

    pub(crate) fn finish(mut self, duration: Duration) -> ExecutionResult {
        self.result.duration_millis = duration.as_millis() as u64;
        self.result.finished_at = chrono::Utc::now();
        self.result
    }
}

/// Errors raised inside the engine. User-code failures never use this type;
/// they are reported as data in `ExecutionResult`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),
}

impl From<nix::errno::Errno> for EngineError {
    fn from(err: nix::errno::Errno) -> Self {
        EngineError::Process(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
