use crate::config::types::{StageKind, StageReport};
use crate::kernel::process_group::KillReport;
use crate::utils::output::CapturedOutput;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One concrete subprocess invocation produced by a language adapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunStep {
    pub kind: StageKind,
    /// Bare name resolved against the sandbox PATH, or an absolute path
    pub executable: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Added on top of the minimal child environment
    pub env: Vec<(String, String)>,
}

impl RunStep {
    pub fn new(kind: StageKind, executable: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            kind,
            executable: executable.into(),
            args: Vec::new(),
            working_dir,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line as a single string, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Cooperative cancellation shared between the caller and the supervisor.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one step did
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub kind: StageKind,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Present when the engine tore the group down
    pub kill_report: Option<KillReport>,
    /// Died of SIGSYS under the step's syscall filter
    pub syscall_denied: bool,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Whether a terminating signal came from the engine itself
    pub fn killed_by_engine(&self) -> bool {
        self.kill_report.is_some()
    }

    pub fn report(&self) -> StageReport {
        StageReport {
            kind: self.kind,
            exit_code: self.exit_code,
            signal: self.signal,
            duration_millis: self.duration.as_millis() as u64,
            timed_out: self.timed_out,
        }
    }
}

/// Everything the supervisor observed, before classification.
#[derive(Clone, Debug, Default)]
pub struct RawOutcome {
    pub steps: Vec<StepOutcome>,
    pub duration: Duration,
}

impl RawOutcome {
    pub fn timed_out(&self) -> bool {
        self.steps.iter().any(|step| step.timed_out)
    }

    pub fn cancelled(&self) -> bool {
        self.steps.iter().any(|step| step.cancelled)
    }

    /// The step whose output becomes the result's output
    pub fn last(&self) -> Option<&StepOutcome> {
        self.steps.last()
    }

    pub fn failed_compile(&self) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|step| step.kind == StageKind::Compile && !step.succeeded())
    }

    pub fn stage_reports(&self) -> Vec<StageReport> {
        self.steps.iter().map(StepOutcome::report).collect()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.last().and_then(|step| step.exit_code)
    }

    pub fn signal(&self) -> Option<i32> {
        self.last().and_then(|step| step.signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(kind: StageKind, exit_code: Option<i32>) -> StepOutcome {
        StepOutcome {
            kind,
            exit_code,
            signal: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration: Duration::from_millis(5),
            timed_out: false,
            cancelled: false,
            kill_report: None,
            syscall_denied: false,
        }
    }

    #[test]
    fn test_run_step_builder() {
        let run = RunStep::new(StageKind::Run, "node", PathBuf::from("/ws"))
            .arg("--no-warnings")
            .args(["main.js"])
            .env("NODE_ENV", "production");
        assert_eq!(run.display(), "node --no-warnings main.js");
        assert_eq!(run.env.len(), 1);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_failed_compile_detection() {
        let outcome = RawOutcome {
            steps: vec![step(StageKind::Compile, Some(1))],
            duration: Duration::from_millis(5),
        };
        assert!(outcome.failed_compile().is_some());
        assert_eq!(outcome.exit_code(), Some(1));

        let outcome = RawOutcome {
            steps: vec![step(StageKind::Compile, Some(0)), step(StageKind::Run, Some(3))],
            duration: Duration::from_millis(10),
        };
        assert!(outcome.failed_compile().is_none());
        assert_eq!(outcome.stage_reports().len(), 2);
        assert_eq!(outcome.exit_code(), Some(3));
    }
}
