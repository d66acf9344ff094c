/// Result classification
///
/// Maps what the supervisor observed to a status and error kind. Pure over
/// its inputs, so the same outcome always yields the same verdict.
///
/// Precedence: cancelled -> timeout -> compile failure -> clean exit ->
/// resource exhaustion -> syntax -> runtime.
use crate::adapters::LanguageAdapter;
use crate::config::types::{Diagnostic, DiagnosticCategory, ErrorKind, ExecutionStatus};
use crate::core::types::{RawOutcome, StepOutcome};
use crate::kernel::seccomp;
use crate::verdict::diagnostics;
use nix::sys::signal::Signal;

/// Runtime messages printed when a heap or allocation limit was hit
pub const OUT_OF_MEMORY_SIGNATURES: &[&str] = &[
    "MemoryError",
    "java.lang.OutOfMemoryError",
    "JavaScript heap out of memory",
    "Array buffer allocation failed",
    "Fatal process out of memory",
    "insufficient memory for the Java Runtime Environment",
    "std::bad_alloc",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: ExecutionStatus,
    pub error_kind: Option<ErrorKind>,
    pub diagnostic: Option<Diagnostic>,
}

impl Verdict {
    fn new(status: ExecutionStatus, error_kind: Option<ErrorKind>) -> Self {
        Self {
            status,
            error_kind,
            diagnostic: None,
        }
    }
}

pub struct ResultClassifier;

impl ResultClassifier {
    pub fn classify(raw: &RawOutcome, adapter: &dyn LanguageAdapter, source_name: &str) -> Verdict {
        if raw.cancelled() {
            return Verdict::new(ExecutionStatus::Cancelled, Some(ErrorKind::Cancelled));
        }
        if raw.timed_out() {
            return Verdict::new(ExecutionStatus::Timeout, Some(ErrorKind::TimeoutExceeded));
        }

        let Some(last) = raw.last() else {
            return Verdict::new(ExecutionStatus::Error, Some(ErrorKind::InternalError));
        };

        let kind = if raw.failed_compile().is_some() {
            ErrorKind::CompileError
        } else if last.exit_code == Some(0) {
            return Verdict::new(ExecutionStatus::Completed, None);
        } else if Self::resource_exhausted(last) {
            ErrorKind::ResourceLimitExceeded
        } else if adapter.is_syntax_error(&last.stderr.text) {
            ErrorKind::SyntaxError
        } else {
            ErrorKind::RuntimeError
        };

        let mut verdict = Verdict::new(ExecutionStatus::Error, Some(kind));
        if kind == ErrorKind::RuntimeError && last.syscall_denied {
            verdict.diagnostic = Some(Diagnostic {
                category: DiagnosticCategory::CapabilityDenied,
                line: None,
                summary: seccomp::DENIAL_NOTE.to_string(),
            });
            return verdict;
        }

        let language = adapter.language();
        let fallback = Self::termination_summary(last);
        verdict.diagnostic = diagnostics::extract(
            kind,
            &last.stderr.text,
            source_name,
            language,
            adapter.denial_signature(),
            &fallback,
        );
        verdict
    }

    /// SIGKILL the engine didn't send is the kernel enforcing a limit.
    pub fn resource_exhausted(step: &StepOutcome) -> bool {
        let by_signal = match step.signal.and_then(|sig| Signal::try_from(sig).ok()) {
            Some(Signal::SIGKILL) => !step.killed_by_engine(),
            Some(Signal::SIGXCPU) | Some(Signal::SIGXFSZ) => true,
            _ => false,
        };
        by_signal
            || OUT_OF_MEMORY_SIGNATURES
                .iter()
                .any(|signature| step.stderr.text.contains(signature))
    }

    fn termination_summary(step: &StepOutcome) -> String {
        match (step.exit_code, step.signal) {
            (_, Some(sig)) => match Signal::try_from(sig) {
                Ok(signal) => format!("terminated by signal {} ({})", sig, signal.as_str()),
                Err(_) => format!("terminated by signal {}", sig),
            },
            (Some(code), None) => format!("exited with code {}", code),
            (None, None) => "exited abnormally".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::languages::{cpp::CppAdapter, java::JavaAdapter, python::PythonAdapter};
    use crate::config::types::{DiagnosticCategory, StageKind};
    use crate::kernel::process_group::KillReport;
    use crate::utils::output::CapturedOutput;
    use std::time::Duration;

    fn step(kind: StageKind, exit_code: Option<i32>, signal: Option<i32>, stderr: &str) -> StepOutcome {
        StepOutcome {
            kind,
            exit_code,
            signal,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput {
                text: stderr.to_string(),
                total_bytes: stderr.len() as u64,
                truncated: false,
                complete: true,
            },
            duration: Duration::from_millis(10),
            timed_out: false,
            cancelled: false,
            kill_report: None,
            syscall_denied: false,
        }
    }

    fn outcome(steps: Vec<StepOutcome>) -> RawOutcome {
        RawOutcome {
            steps,
            duration: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_clean_exit_is_completed() {
        let raw = outcome(vec![step(StageKind::Run, Some(0), None, "")]);
        let verdict = ResultClassifier::classify(&raw, &PythonAdapter, "main.py");
        assert_eq!(verdict.status, ExecutionStatus::Completed);
        assert_eq!(verdict.error_kind, None);
        assert_eq!(verdict.diagnostic, None);
    }

    #[test]
    fn test_timeout_beats_everything_but_cancel() {
        let mut run = step(StageKind::Run, None, Some(9), "");
        run.timed_out = true;
        run.kill_report = Some(KillReport::default());
        let verdict = ResultClassifier::classify(&outcome(vec![run.clone()]), &PythonAdapter, "main.py");
        assert_eq!(verdict.status, ExecutionStatus::Timeout);
        assert_eq!(verdict.error_kind, Some(ErrorKind::TimeoutExceeded));

        run.cancelled = true;
        let verdict = ResultClassifier::classify(&outcome(vec![run]), &PythonAdapter, "main.py");
        assert_eq!(verdict.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_cancelled_clean_exit_is_not_completed() {
        let mut run = step(StageKind::Run, Some(0), None, "");
        run.cancelled = true;
        let verdict = ResultClassifier::classify(&outcome(vec![run]), &PythonAdapter, "main.py");
        assert_eq!(verdict.status, ExecutionStatus::Cancelled);
        assert_eq!(verdict.error_kind, Some(ErrorKind::Cancelled));
    }

    #[test]
    fn test_compile_failure() {
        let raw = outcome(vec![step(
            StageKind::Compile,
            Some(1),
            None,
            "/ws/Main.java:2: error: ';' expected\n1 error\n",
        )]);
        let verdict = ResultClassifier::classify(&raw, &JavaAdapter, "Main.java");
        assert_eq!(verdict.error_kind, Some(ErrorKind::CompileError));
        let diagnostic = verdict.diagnostic.unwrap();
        assert_eq!(diagnostic.category, DiagnosticCategory::Compile);
        assert_eq!(diagnostic.line, Some(2));
    }

    #[test]
    fn test_kernel_kill_is_resource_limit() {
        let raw = outcome(vec![
            step(StageKind::Compile, Some(0), None, ""),
            step(StageKind::Run, None, Some(9), ""),
        ]);
        let verdict = ResultClassifier::classify(&raw, &CppAdapter, "main.cpp");
        assert_eq!(verdict.error_kind, Some(ErrorKind::ResourceLimitExceeded));
        assert!(verdict.diagnostic.unwrap().summary.contains("SIGKILL"));
    }

    #[test]
    fn test_cpu_and_file_size_signals() {
        for sig in [libc::SIGXCPU, libc::SIGXFSZ] {
            let raw = outcome(vec![step(StageKind::Run, None, Some(sig), "")]);
            let verdict = ResultClassifier::classify(&raw, &CppAdapter, "main.cpp");
            assert_eq!(verdict.error_kind, Some(ErrorKind::ResourceLimitExceeded));
        }
    }

    #[test]
    fn test_out_of_memory_signature() {
        let raw = outcome(vec![step(
            StageKind::Run,
            Some(1),
            None,
            "Traceback (most recent call last):\n  File \"/ws/main.py\", line 1, in <module>\nMemoryError\n",
        )]);
        let verdict = ResultClassifier::classify(&raw, &PythonAdapter, "main.py");
        assert_eq!(verdict.error_kind, Some(ErrorKind::ResourceLimitExceeded));
        assert_eq!(verdict.diagnostic.unwrap().category, DiagnosticCategory::Resource);
    }

    #[test]
    fn test_node_allocation_failure_is_resource_limit() {
        let raw = outcome(vec![step(
            StageKind::Run,
            Some(1),
            None,
            "/ws/main.js:3\n    chunks.push(Buffer.alloc(size, 1));\n\nRangeError: Array buffer allocation failed\n",
        )]);
        let verdict = ResultClassifier::classify(&raw, &CppAdapter, "main.js");
        assert_eq!(verdict.error_kind, Some(ErrorKind::ResourceLimitExceeded));
    }

    #[test]
    fn test_filtered_syscall_is_capability_denial() {
        let mut run = step(StageKind::Run, None, Some(libc::SIGSYS), "");
        run.syscall_denied = true;
        let raw = outcome(vec![step(StageKind::Compile, Some(0), None, ""), run]);

        let verdict = ResultClassifier::classify(&raw, &CppAdapter, "main.cpp");
        assert_eq!(verdict.status, ExecutionStatus::Error);
        assert_eq!(verdict.error_kind, Some(ErrorKind::RuntimeError));
        let diagnostic = verdict.diagnostic.unwrap();
        assert_eq!(diagnostic.category, DiagnosticCategory::CapabilityDenied);
        assert!(diagnostic.summary.starts_with("capability denied"));
    }

    #[test]
    fn test_python_syntax_error() {
        let raw = outcome(vec![step(
            StageKind::Run,
            Some(1),
            None,
            "  File \"/ws/main.py\", line 3\n    def f(\n         ^\nSyntaxError: '(' was never closed\n",
        )]);
        let verdict = ResultClassifier::classify(&raw, &PythonAdapter, "main.py");
        assert_eq!(verdict.error_kind, Some(ErrorKind::SyntaxError));
        let diagnostic = verdict.diagnostic.unwrap();
        assert_eq!(diagnostic.category, DiagnosticCategory::Syntax);
        assert_eq!(diagnostic.line, Some(3));
    }

    #[test]
    fn test_nonzero_exit_is_runtime_error() {
        let raw = outcome(vec![step(StageKind::Run, Some(3), None, "")]);
        let verdict = ResultClassifier::classify(&raw, &PythonAdapter, "main.py");
        assert_eq!(verdict.status, ExecutionStatus::Error);
        assert_eq!(verdict.error_kind, Some(ErrorKind::RuntimeError));
        assert_eq!(verdict.diagnostic.unwrap().summary, "exited with code 3");
    }

    #[test]
    fn test_no_steps_is_internal_error() {
        let verdict = ResultClassifier::classify(&RawOutcome::default(), &PythonAdapter, "main.py");
        assert_eq!(verdict.error_kind, Some(ErrorKind::InternalError));
    }
}
