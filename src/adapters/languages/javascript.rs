use crate::adapters::adapter::{path_arg, runtime_command, AdapterStrategy, LanguageAdapter};
use crate::config::policy::{Capability, SandboxPolicy};
use crate::config::types::{ExecutionLimits, Language, Result, StageKind};
use crate::core::types::RunStep;
use crate::safety::workspace::Workspace;
use crate::utils::env_hygiene::SANDBOX_PATH;
use regex::Regex;
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::{Mutex, OnceLock};

pub const SOURCE_FILE: &str = "main.js";

/// Interpreted-direct Node.js: the source runs as written.
///
/// Filesystem writes outside the workspace, child processes, workers and
/// native addons are refused by Node's permission model when the runtime
/// has one (v20+), with a readable `ERR_ACCESS_DENIED`. The permission
/// model has no network switch; sockets are stopped by the run step's
/// syscall filter instead.
#[derive(Debug, Clone, Default)]
pub struct JavaScriptAdapter;

/// Major version from `node --version` output ("v20.11.1")
pub fn parse_node_major(version: &str) -> Option<u32> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
}

/// Cached major version of the Node.js runtime at `executable`.
pub fn detect_node_major(executable: &str) -> Option<u32> {
    static CACHE: OnceLock<Mutex<HashMap<String, Option<u32>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    if let Ok(guard) = cache.lock() {
        if let Some(major) = guard.get(executable) {
            return *major;
        }
    }

    let major = which::which_in(executable, Some(SANDBOX_PATH), "/")
        .ok()
        .and_then(|program| {
            Command::new(program)
                .arg("--version")
                .env_clear()
                .env("PATH", SANDBOX_PATH)
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .ok()
        })
        .filter(|output| output.status.success())
        .and_then(|output| parse_node_major(&String::from_utf8_lossy(&output.stdout)));

    match major {
        Some(major) => log::debug!("Detected Node.js major version {}", major),
        None => log::warn!("Could not determine Node.js version for {}", executable),
    }
    if let Ok(mut guard) = cache.lock() {
        guard.insert(executable.to_string(), major);
    }
    major
}

/// Permission-model flags for a Node major version; empty when the runtime
/// has no permission model.
pub fn permission_flags(major: Option<u32>, workspace: &str) -> Vec<String> {
    let enable = match major {
        Some(major) if major >= 23 => "--permission",
        Some(major) if major >= 20 => "--experimental-permission",
        _ => return Vec::new(),
    };
    vec![
        enable.to_string(),
        "--allow-fs-read=*".to_string(),
        format!("--allow-fs-write={}", workspace),
        // The experimental-feature warning would otherwise land in stderr
        "--no-warnings".to_string(),
    ]
}

fn syntax_error_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^SyntaxError: ").expect("valid regex"))
}

fn user_frame() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"main\.js:\d+:\d+").expect("valid regex"))
}

impl LanguageAdapter for JavaScriptAdapter {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn strategy(&self) -> AdapterStrategy {
        AdapterStrategy::InterpretedDirect
    }

    fn source_file_name(&self, _code: &str) -> String {
        SOURCE_FILE.to_string()
    }

    fn prepare(
        &self,
        code: &str,
        policy: &SandboxPolicy,
        workspace: &Workspace,
        limits: &ExecutionLimits,
    ) -> Result<Vec<RunStep>> {
        let runtime = runtime_command(policy)?;
        let source = workspace.write_file(SOURCE_FILE, code.as_bytes())?;

        let mut step = RunStep::new(
            StageKind::Run,
            runtime.executable.clone(),
            workspace.path().to_path_buf(),
        )
        .args(runtime.args.iter().cloned())
        .arg(format!("--max-old-space-size={}", limits.memory_limit_mb()));

        let sandboxed = policy.blocks(Capability::ProcessSpawn)
            || policy.blocks(Capability::FilesystemOutsideWorkspace)
            || policy.blocks(Capability::NativeCode);
        if sandboxed {
            let flags = permission_flags(
                detect_node_major(&runtime.executable),
                &path_arg(workspace.path()),
            );
            if flags.is_empty() {
                log::warn!("Node.js permission model unavailable; running without it");
            }
            step = step.args(flags);
        }

        Ok(vec![step.arg(path_arg(&source))])
    }

    /// Parse failures carry no stack frame inside the user file.
    fn is_syntax_error(&self, stderr: &str) -> bool {
        syntax_error_line().is_match(stderr) && !user_frame().is_match(stderr)
    }

    fn denial_signature(&self) -> Option<&'static str> {
        Some("ERR_ACCESS_DENIED")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_major() {
        assert_eq!(parse_node_major("v20.11.1\n"), Some(20));
        assert_eq!(parse_node_major("v18.19.0"), Some(18));
        assert_eq!(parse_node_major("garbage"), None);
    }

    #[test]
    fn test_permission_flags_by_version() {
        assert!(permission_flags(Some(18), "/ws").is_empty());
        assert!(permission_flags(None, "/ws").is_empty());

        let v20 = permission_flags(Some(20), "/ws");
        assert_eq!(v20[0], "--experimental-permission");
        assert!(v20.contains(&"--allow-fs-write=/ws".to_string()));

        let v23 = permission_flags(Some(23), "/ws");
        assert_eq!(v23[0], "--permission");
    }

    #[test]
    fn test_syntax_error_detection() {
        let parse_failure = "/ws/main.js:1\nconsole.log(\n           ^\n\nSyntaxError: missing ) after argument list\n    at wrapSafe (node:internal/modules/cjs/loader:1281:20)\n";
        assert!(JavaScriptAdapter.is_syntax_error(parse_failure));

        let runtime = "undefined:1\n\nSyntaxError: Unexpected end of JSON input\n    at JSON.parse (<anonymous>)\n    at Object.<anonymous> (/ws/main.js:1:6)\n";
        assert!(!JavaScriptAdapter.is_syntax_error(runtime));
    }
}
