//! Sandbox policies and the registry that resolves them.
//!
//! A policy is static, versioned configuration: which capabilities are
//! blocked, which third-party libraries are allowed, which toolchain commands
//! run, and which limits apply when the caller does not override them.
//! Policies are built once at engine start and shared read-only behind `Arc`.

use crate::config::loader::{EngineConfig, LanguageOverride};
use crate::config::presets;
use crate::config::types::{EngineError, ExecutionLimits, Language, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Named dangerous operations a policy may block.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    #[serde(rename = "process_spawn")]
    ProcessSpawn,
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "filesystem_outside_workspace")]
    FilesystemOutsideWorkspace,
    #[serde(rename = "native_code")]
    NativeCode,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::ProcessSpawn,
        Capability::Network,
        Capability::FilesystemOutsideWorkspace,
        Capability::NativeCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ProcessSpawn => "process_spawn",
            Capability::Network => "network",
            Capability::FilesystemOutsideWorkspace => "filesystem_outside_workspace",
            Capability::NativeCode => "native_code",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the memory ceiling reaches the child.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemoryEnforcement {
    /// RLIMIT_AS applied between fork and exec
    #[serde(rename = "address_space")]
    AddressSpace,
    /// Runtime heap flag, backed by RLIMIT_DATA at the limit plus the
    /// policy's runtime overhead. JVM/V8 reserve large virtual ranges and
    /// cannot start under a tight RLIMIT_AS; reserved-but-unwritable ranges
    /// do not count against RLIMIT_DATA.
    #[serde(rename = "runtime_flag")]
    RuntimeFlag,
}

/// Executable plus fixed leading arguments.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTemplate {
    pub executable: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(executable: &str, args: &[&str]) -> Self {
        Self {
            executable: executable.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

/// Ordered toolchain invocations: an optional compile step, then the run step.
/// A missing runtime means the compiled artifact is executed directly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Toolchain {
    pub compiler: Option<CommandTemplate>,
    pub runtime: Option<CommandTemplate>,
}

impl Toolchain {
    pub fn is_compiled(&self) -> bool {
        self.compiler.is_some()
    }

    /// Executables that must be present for this language to run.
    pub fn executables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        if let Some(compiler) = &self.compiler {
            names.push(compiler.executable.as_str());
        }
        if let Some(runtime) = &self.runtime {
            names.push(runtime.executable.as_str());
        }
        names
    }
}

/// Limits for the compile step; independent of the caller's run limits.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompileLimits {
    pub timeout_millis: u64,
    pub memory_limit_bytes: u64,
}

/// Secondary OS ceilings applied to every step.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessCeilings {
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub processes: Option<u64>,
    /// Added to the memory limit for RLIMIT_DATA under
    /// `MemoryEnforcement::RuntimeFlag` (thread stacks, JIT code, GC metadata)
    #[serde(default)]
    pub runtime_overhead_bytes: u64,
}

impl Default for ProcessCeilings {
    fn default() -> Self {
        Self {
            file_size_bytes: 16 * 1024 * 1024,
            open_files: 256,
            processes: None,
            runtime_overhead_bytes: 0,
        }
    }
}

/// Per-language sandbox policy.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxPolicy {
    /// Policy ID (e.g. "python3-v1")
    pub id: String,
    pub version: String,
    pub language: Language,
    pub blocked_capabilities: BTreeSet<Capability>,
    /// Third-party modules user code may import
    pub allowed_libraries: BTreeSet<String>,
    /// Modules user code may never import, standard library included
    pub blocked_modules: BTreeSet<String>,
    pub toolchain: Toolchain,
    pub default_limits: ExecutionLimits,
    pub compile_limits: Option<CompileLimits>,
    pub memory_enforcement: MemoryEnforcement,
    pub ceilings: ProcessCeilings,
    /// Blocked capabilities the kernel also enforces on the run step:
    /// seccomp for process spawn and network, Landlock for writes
    #[serde(default)]
    pub kernel_enforced: BTreeSet<Capability>,
}

impl SandboxPolicy {
    pub fn blocks(&self, capability: Capability) -> bool {
        self.blocked_capabilities.contains(&capability)
    }

    /// Capabilities to confine at the kernel level; never more than the
    /// policy blocks.
    pub fn kernel_confined(&self) -> BTreeSet<Capability> {
        self.kernel_enforced
            .intersection(&self.blocked_capabilities)
            .copied()
            .collect()
    }

    pub fn allows_library(&self, name: &str) -> bool {
        let top_level = name.split('.').next().unwrap_or(name);
        self.allowed_libraries.contains(top_level) && !self.blocked_modules.contains(top_level)
    }

    /// SHA-256 over the canonical JSON form; recorded in every result so a
    /// stored result can be traced to the exact policy that produced it.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn apply_override(&mut self, over: &LanguageOverride) {
        let limits = &mut self.default_limits;
        if let Some(timeout) = over.timeout_millis {
            limits.timeout_millis = timeout;
        }
        if let Some(memory) = over.memory_limit_bytes {
            limits.memory_limit_bytes = memory;
        }
        if let Some(output) = over.max_captured_output_bytes {
            limits.max_captured_output_bytes = output;
        }
        if let Some(libraries) = &over.allowed_libraries {
            self.allowed_libraries = libraries.iter().cloned().collect();
        }
        if let (Some(executable), Some(runtime)) =
            (&over.runtime_executable, self.toolchain.runtime.as_mut())
        {
            runtime.executable = executable.clone();
        }
        if let (Some(executable), Some(compiler)) =
            (&over.compiler_executable, self.toolchain.compiler.as_mut())
        {
            compiler.executable = executable.clone();
        }
    }
}

/// Read-only map from language to policy.
#[derive(Clone, Debug, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<Language, Arc<SandboxPolicy>>,
}

impl PolicyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every builtin preset.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for policy in presets::builtin_policies() {
            registry.register(policy);
        }
        registry
    }

    /// Builtin presets with the config file's per-language overrides applied.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut registry = Self::empty();
        for mut policy in presets::builtin_policies() {
            policy.default_limits = policy
                .default_limits
                .with_overrides(&config.default_overrides);
            let key = policy.language.as_str();
            if let Some(over) = config.languages.get(key) {
                if !over.enabled {
                    log::info!("Language {} disabled by configuration", key);
                    continue;
                }
                policy.apply_override(over);
            }
            if !policy.default_limits.fits_within(&config.hard_ceiling) {
                return Err(EngineError::Policy(format!(
                    "default limits of {} exceed the hard ceiling",
                    policy.id
                )));
            }
            registry.register(policy);
        }

        for name in config.languages.keys() {
            if name.parse::<Language>().is_err() {
                log::warn!("Ignoring configuration for unknown language: {}", name);
            }
        }

        Ok(registry)
    }

    /// Add or replace the policy for its language.
    pub fn register(&mut self, policy: SandboxPolicy) {
        log::debug!("Registered sandbox policy {} ({})", policy.id, policy.language);
        self.policies.insert(policy.language, Arc::new(policy));
    }

    pub fn resolve(&self, language: Language) -> Result<Arc<SandboxPolicy>> {
        self.policies
            .get(&language)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    /// Resolve from a caller-supplied language name.
    pub fn resolve_name(&self, name: &str) -> Result<Arc<SandboxPolicy>> {
        self.resolve(name.parse::<Language>()?)
    }

    pub fn languages(&self) -> Vec<Language> {
        self.policies.keys().copied().collect()
    }

    pub fn policies(&self) -> impl Iterator<Item = &Arc<SandboxPolicy>> {
        self.policies.values()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
