use crate::adapters::adapter::{compiler_command, path_arg, AdapterStrategy, LanguageAdapter};
use crate::config::policy::SandboxPolicy;
use crate::config::types::{ExecutionLimits, Language, Result, StageKind};
use crate::core::types::RunStep;
use crate::safety::workspace::Workspace;

pub const SOURCE_FILE: &str = "main.cpp";
pub const ARTIFACT: &str = "main";

#[derive(Debug, Clone, Default)]
pub struct CppAdapter;

impl LanguageAdapter for CppAdapter {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn strategy(&self) -> AdapterStrategy {
        AdapterStrategy::CompileThenRun
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
        let compiler = compiler_command(policy)?;
        let source = workspace.write_file(SOURCE_FILE, code.as_bytes())?;
        let artifact = path_arg(&workspace.path().join(ARTIFACT));

        let compile = RunStep::new(
            StageKind::Compile,
            compiler.executable.clone(),
            workspace.path().to_path_buf(),
        )
        .args(compiler.args.iter().cloned())
        .args(["-o".to_string(), artifact.clone(), path_arg(&source)]);

        // Memory is bounded by the address-space rlimit on the artifact
        let run = RunStep::new(StageKind::Run, artifact, workspace.path().to_path_buf());

        Ok(vec![compile, run])
    }
}
