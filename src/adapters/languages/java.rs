use crate::adapters::adapter::{
    compiler_command, path_arg, runtime_command, AdapterStrategy, LanguageAdapter,
};
use crate::config::policy::SandboxPolicy;
use crate::config::types::{ExecutionLimits, Language, Result, StageKind};
use crate::core::types::RunStep;
use crate::safety::workspace::Workspace;

const DEFAULT_CLASS: &str = "Main";
const MODIFIERS: &[&str] = &[
    "public", "final", "abstract", "static", "strictfp", "sealed", "non-sealed",
];

#[derive(Debug, Clone, Default)]
pub struct JavaAdapter;

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' || first == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

/// Top-level class the launcher should start. A `public class` wins, then
/// the first class declared, then `Main`.
pub fn detect_class_name(code: &str) -> String {
    let mut first = None;

    for line in code.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(at) = tokens.iter().position(|token| *token == "class") else {
            continue;
        };
        if !tokens[..at].iter().all(|token| MODIFIERS.contains(token)) {
            continue;
        }
        let Some(raw) = tokens.get(at + 1) else {
            continue;
        };
        let name = raw
            .split(|c: char| c == '{' || c == '<')
            .next()
            .unwrap_or_default();
        if !is_identifier(name) {
            continue;
        }
        if tokens[..at].contains(&"public") {
            return name.to_string();
        }
        first.get_or_insert_with(|| name.to_string());
    }

    first.unwrap_or_else(|| DEFAULT_CLASS.to_string())
}

impl LanguageAdapter for JavaAdapter {
    fn language(&self) -> Language {
        Language::Java
    }

    fn strategy(&self) -> AdapterStrategy {
        AdapterStrategy::CompileThenRun
    }

    fn source_file_name(&self, code: &str) -> String {
        format!("{}.java", detect_class_name(code))
    }

    fn prepare(
        &self,
        code: &str,
        policy: &SandboxPolicy,
        workspace: &Workspace,
        limits: &ExecutionLimits,
    ) -> Result<Vec<RunStep>> {
        let compiler = compiler_command(policy)?;
        let runtime = runtime_command(policy)?;
        let class_name = detect_class_name(code);
        let source = workspace.write_file(&self.source_file_name(code), code.as_bytes())?;
        let dir = path_arg(workspace.path());

        let mut compile = RunStep::new(
            StageKind::Compile,
            compiler.executable.clone(),
            workspace.path().to_path_buf(),
        )
        .args(compiler.args.iter().cloned());
        if let Some(compile_limits) = &policy.compile_limits {
            let mb = (compile_limits.memory_limit_bytes / (1024 * 1024)).max(16);
            compile = compile.arg(format!("-J-Xmx{}m", mb));
        }
        let compile = compile.args(["-d".to_string(), dir.clone(), path_arg(&source)]);

        let run = RunStep::new(
            StageKind::Run,
            runtime.executable.clone(),
            workspace.path().to_path_buf(),
        )
        .args(runtime.args.iter().cloned())
        .arg(format!("-Xmx{}m", limits.memory_limit_mb()))
        .args(["-cp".to_string(), dir, class_name]);

        Ok(vec![compile, run])
    }
}
