use crate::config::policy::{CommandTemplate, SandboxPolicy};
use crate::config::types::{EngineError, ExecutionLimits, Language, Result};
use crate::core::types::RunStep;
use crate::safety::workspace::Workspace;

/// How an adapter gets user code running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStrategy {
    /// Source runs unmodified under the interpreter
    InterpretedDirect,
    /// Source runs behind an in-process capability guard
    InterpretedRestricted,
    /// A compile step, then the artifact runs
    CompileThenRun,
}

impl AdapterStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterStrategy::InterpretedDirect => "interpreted-direct",
            AdapterStrategy::InterpretedRestricted => "interpreted-restricted",
            AdapterStrategy::CompileThenRun => "compile-then-run",
        }
    }
}

impl std::fmt::Display for AdapterStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter contract for language-specific preparation.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;

    fn strategy(&self) -> AdapterStrategy;

    /// File name the submitted source is written to
    fn source_file_name(&self, code: &str) -> String;

    /// Write the source (and any support files) into `workspace` and return
    /// the steps to run, in order.
    fn prepare(
        &self,
        code: &str,
        policy: &SandboxPolicy,
        workspace: &Workspace,
        limits: &ExecutionLimits,
    ) -> Result<Vec<RunStep>>;

    /// True when a failed run's stderr shows the source never parsed.
    fn is_syntax_error(&self, _stderr: &str) -> bool {
        false
    }

    /// Marker the runtime prints when a blocked capability was refused
    fn denial_signature(&self) -> Option<&'static str> {
        None
    }
}

pub(crate) fn runtime_command<'a>(policy: &'a SandboxPolicy) -> Result<&'a CommandTemplate> {
    policy.toolchain.runtime.as_ref().ok_or_else(|| {
        EngineError::Policy(format!("policy {} has no runtime command", policy.id))
    })
}

pub(crate) fn compiler_command<'a>(policy: &'a SandboxPolicy) -> Result<&'a CommandTemplate> {
    policy.toolchain.compiler.as_ref().ok_or_else(|| {
        EngineError::Policy(format!("policy {} has no compiler command", policy.id))
    })
}

pub(crate) fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}
