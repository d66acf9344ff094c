use crate::adapters::adapter::{path_arg, runtime_command, AdapterStrategy, LanguageAdapter};
use crate::config::policy::SandboxPolicy;
use crate::config::types::{EngineError, ExecutionLimits, Language, Result, StageKind};
use crate::core::types::RunStep;
use crate::safety::workspace::Workspace;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub const SOURCE_FILE: &str = "main.py";
pub const GUARD_FILE: &str = "_guard.py";

const GUARD_TEMPLATE: &str = include_str!("../python_guard.py");

/// Interpreted-restricted Python: the user file is written untouched and a
/// generated guard installs an audit hook before running it.
#[derive(Debug, Clone, Default)]
pub struct PythonAdapter;

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Policy(format!("Failed to render guard value: {}", e)))
}

/// Fill the guard template from the policy.
pub fn render_guard(policy: &SandboxPolicy, workspace: &Path, source: &Path) -> Result<String> {
    let capabilities: Vec<&str> = policy
        .blocked_capabilities
        .iter()
        .map(|capability| capability.as_str())
        .collect();
    let libraries: Vec<&str> = policy
        .allowed_libraries
        .iter()
        .map(String::as_str)
        .filter(|name| policy.allows_library(name))
        .collect();

    Ok(GUARD_TEMPLATE
        .replace("__WORKSPACE__", &json(&path_arg(workspace))?)
        .replace("__USER_SOURCE__", &json(&path_arg(source))?)
        .replace("__BLOCKED_CAPABILITIES__", &json(&capabilities)?)
        .replace("__BLOCKED_MODULES__", &json(&policy.blocked_modules)?)
        .replace("__ALLOWED_LIBRARIES__", &json(&libraries)?))
}

fn syntax_error_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(SyntaxError|IndentationError|TabError):").expect("valid regex")
    })
}

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn strategy(&self) -> AdapterStrategy {
        AdapterStrategy::InterpretedRestricted
    }

    fn source_file_name(&self, _code: &str) -> String {
        SOURCE_FILE.to_string()
    }

    fn prepare(
        &self,
        code: &str,
        policy: &SandboxPolicy,
        workspace: &Workspace,
        _limits: &ExecutionLimits,
    ) -> Result<Vec<RunStep>> {
        let runtime = runtime_command(policy)?;
        let source = workspace.write_file(SOURCE_FILE, code.as_bytes())?;
        let guard = render_guard(policy, workspace.path(), &source)?;
        let guard_path = workspace.write_file(GUARD_FILE, guard.as_bytes())?;

        Ok(vec![RunStep::new(
            StageKind::Run,
            runtime.executable.clone(),
            workspace.path().to_path_buf(),
        )
        .args(runtime.args.iter().cloned())
        .arg(path_arg(&guard_path))])
    }

    /// A parse failure is reported without a traceback: the source never ran.
    fn is_syntax_error(&self, stderr: &str) -> bool {
        syntax_error_line().is_match(stderr) && !stderr.contains("Traceback (most recent call last)")
    }

    fn denial_signature(&self) -> Option<&'static str> {
        Some("capability denied:")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::policy::PolicyRegistry;
    use crate::safety::workspace::WorkspaceManager;

    fn policy() -> SandboxPolicy {
        (*PolicyRegistry::builtin().resolve(Language::Python).unwrap()).clone()
    }

    #[test]
    fn test_prepare_writes_source_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("root")).unwrap();
        let workspace = manager.acquire("py-prepare").unwrap();
        let policy = policy();

        let code = "print('hi')\n";
        let steps = PythonAdapter
            .prepare(code, &policy, &workspace, &policy.default_limits)
            .unwrap();

        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].kind, StageKind::Run);
        assert_eq!(steps[0].executable, "python3");
        assert!(steps[0].args.contains(&"-I".to_string()));
        assert!(steps[0].args.last().unwrap().ends_with(GUARD_FILE));

        let written = std::fs::read_to_string(workspace.path().join(SOURCE_FILE)).unwrap();
        assert_eq!(written, code);
        manager.release(workspace).unwrap();
    }

    #[test]
    fn test_guard_has_no_placeholders_left() {
        let policy = policy();
        let guard = render_guard(&policy, Path::new("/ws"), Path::new("/ws/main.py")).unwrap();
        for placeholder in [
            "__WORKSPACE__",
            "__USER_SOURCE__",
            "__BLOCKED_CAPABILITIES__",
            "__BLOCKED_MODULES__",
            "__ALLOWED_LIBRARIES__",
        ] {
            assert!(!guard.contains(placeholder), "{} left in guard", placeholder);
        }
        assert!(guard.contains("_USER_SOURCE = \"/ws/main.py\""));
        assert!(guard.contains("\"process_spawn\""));
        assert!(guard.contains("\"subprocess\""));
        assert!(guard.contains("\"numpy\""));
    }

    #[test]
    fn test_guard_never_allows_a_blocked_module() {
        let mut policy = policy();
        policy.allowed_libraries.insert("socket".to_string());
        let guard = render_guard(&policy, Path::new("/ws"), Path::new("/ws/main.py")).unwrap();
        let allowed = guard
            .lines()
            .find(|line| line.starts_with("_ALLOWED_LIBRARIES"))
            .unwrap();
        assert!(!allowed.contains("\"socket\""), "{}", allowed);
        assert!(allowed.contains("\"numpy\""));
    }

    #[test]
    fn test_guard_escapes_quotes_in_paths() {
        let guard = render_guard(&policy(), Path::new("/w\"s"), Path::new("/w\"s/main.py")).unwrap();
        assert!(guard.contains(r#"_WORKSPACE = "/w\"s""#));
    }

    #[test]
    fn test_syntax_error_detection() {
        let parse_failure = "  File \"/ws/main.py\", line 1\n    print(\n         ^\nSyntaxError: '(' was never closed\n";
        assert!(PythonAdapter.is_syntax_error(parse_failure));

        let runtime = "Traceback (most recent call last):\n  File \"/ws/main.py\", line 1, in <module>\n    compile('x(', 'y', 'exec')\nSyntaxError: unexpected EOF\n";
        assert!(!PythonAdapter.is_syntax_error(runtime));

        let indentation = "  File \"/ws/main.py\", line 2\n    x\nIndentationError: unexpected indent\n";
        assert!(PythonAdapter.is_syntax_error(indentation));
    }
}
