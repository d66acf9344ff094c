//! Builtin language policies
//!
//! Each preset is an explicit, versioned policy. Changing any field changes
//! the policy fingerprint recorded in results, so bump `version` together
//! with behavioral changes.

use crate::config::policy::{
    Capability, CommandTemplate, CompileLimits, MemoryEnforcement, ProcessCeilings,
    SandboxPolicy, Toolchain,
};
use crate::config::types::{ExecutionLimits, Language};
use std::collections::BTreeSet;

const MIB: u64 = 1024 * 1024;

/// Limits applied when neither the caller nor the policy says otherwise.
pub const DEFAULT_LIMITS: ExecutionLimits = ExecutionLimits {
    timeout_millis: 30_000,
    memory_limit_bytes: 512 * MIB,
    max_captured_output_bytes: 64 * 1024,
};

/// No request may go above these, whatever it asks for.
pub const HARD_CEILING: ExecutionLimits = ExecutionLimits {
    timeout_millis: 120_000,
    memory_limit_bytes: 2048 * MIB,
    max_captured_output_bytes: 1024 * 1024,
};

/// Third-party Python packages user code may import.
pub const PYTHON_ALLOWED_LIBRARIES: &[&str] = &[
    "numpy",
    "pandas",
    "scipy",
    "matplotlib",
    "seaborn",
    "sympy",
    "sklearn",
    "statsmodels",
    "networkx",
    "PIL",
    "dateutil",
    "pytz",
    "tabulate",
    "more_itertools",
    "attr",
    "attrs",
];

/// Python modules user code may never import, stdlib included.
pub const PYTHON_BLOCKED_MODULES: &[&str] = &[
    "subprocess",
    "_posixsubprocess",
    "multiprocessing",
    "pty",
    "socket",
    "_socket",
    "socketserver",
    "ssl",
    "_ssl",
    "ftplib",
    "smtplib",
    "telnetlib",
    "ctypes",
    "_ctypes",
    "cffi",
    "resource",
];

fn capabilities(values: &[Capability]) -> BTreeSet<Capability> {
    values.iter().copied().collect()
}

/// Confined by seccomp and Landlock on every run step
const KERNEL_ENFORCED: [Capability; 3] = [
    Capability::ProcessSpawn,
    Capability::Network,
    Capability::FilesystemOutsideWorkspace,
];

/// Headroom over the heap flag for runtimes under RLIMIT_DATA
const RUNTIME_OVERHEAD: u64 = 256 * MIB;

fn names(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Python 3, interpreted-restricted: runs behind the audit-hook guard.
fn register_python3_v1() -> SandboxPolicy {
    SandboxPolicy {
        id: "python3-v1".to_string(),
        version: "1.1".to_string(),
        language: Language::Python,
        blocked_capabilities: capabilities(&Capability::ALL),
        allowed_libraries: names(PYTHON_ALLOWED_LIBRARIES),
        blocked_modules: names(PYTHON_BLOCKED_MODULES),
        toolchain: Toolchain {
            compiler: None,
            runtime: Some(CommandTemplate::new(
                "python3",
                &[
                    "-I", // Isolated mode: no PYTHON* env, no user site
                    "-B", // Don't write .pyc files
                    "-u", // Unbuffered, so output survives a kill
                ],
            )),
        },
        default_limits: DEFAULT_LIMITS,
        compile_limits: None,
        memory_enforcement: MemoryEnforcement::AddressSpace,
        ceilings: ProcessCeilings::default(),
        kernel_enforced: capabilities(&KERNEL_ENFORCED),
    }
}

/// Node.js, interpreted-direct: source runs unmodified.
fn register_node_v1() -> SandboxPolicy {
    SandboxPolicy {
        id: "node-v1".to_string(),
        version: "1.1".to_string(),
        language: Language::JavaScript,
        // Addons are refused by Node's permission model
        blocked_capabilities: capabilities(&Capability::ALL),
        allowed_libraries: BTreeSet::new(),
        blocked_modules: BTreeSet::new(),
        toolchain: Toolchain {
            compiler: None,
            runtime: Some(CommandTemplate::new("node", &["--stack-size=984"])),
        },
        default_limits: DEFAULT_LIMITS,
        compile_limits: None,
        memory_enforcement: MemoryEnforcement::RuntimeFlag,
        ceilings: ProcessCeilings {
            open_files: 1024,
            runtime_overhead_bytes: RUNTIME_OVERHEAD,
            ..ProcessCeilings::default()
        },
        kernel_enforced: capabilities(&KERNEL_ENFORCED),
    }
}

/// Java 17+, compile-then-run.
fn register_java17_v1() -> SandboxPolicy {
    SandboxPolicy {
        id: "java17-v1".to_string(),
        version: "1.1".to_string(),
        language: Language::Java,
        // JNI is not blockable here; only what the kernel enforces is claimed
        blocked_capabilities: capabilities(&KERNEL_ENFORCED),
        allowed_libraries: BTreeSet::new(),
        blocked_modules: BTreeSet::new(),
        toolchain: Toolchain {
            compiler: Some(CommandTemplate::new(
                "javac",
                &["-encoding", "UTF-8", "-J-XX:-UsePerfData"],
            )),
            runtime: Some(CommandTemplate::new(
                "java",
                &[
                    "-Xss1m",
                    "-XX:+UseSerialGC",
                    "-XX:-UsePerfData",
                    "-XX:TieredStopAtLevel=1",
                    "-Dfile.encoding=UTF-8",
                ],
            )),
        },
        default_limits: DEFAULT_LIMITS,
        compile_limits: Some(CompileLimits {
            timeout_millis: 30_000,
            memory_limit_bytes: 768 * MIB,
        }),
        memory_enforcement: MemoryEnforcement::RuntimeFlag,
        ceilings: ProcessCeilings {
            open_files: 1024,
            runtime_overhead_bytes: RUNTIME_OVERHEAD,
            ..ProcessCeilings::default()
        },
        kernel_enforced: capabilities(&KERNEL_ENFORCED),
    }
}

/// C++17 via GCC, compile-then-run.
fn register_cpp17_v1() -> SandboxPolicy {
    SandboxPolicy {
        id: "cpp17-v1".to_string(),
        version: "1.1".to_string(),
        language: Language::Cpp,
        // All of it is native code
        blocked_capabilities: capabilities(&KERNEL_ENFORCED),
        allowed_libraries: BTreeSet::new(),
        blocked_modules: BTreeSet::new(),
        toolchain: Toolchain {
            compiler: Some(CommandTemplate::new(
                "g++",
                &["-std=c++17", "-O2", "-pipe"],
            )),
            // The compiled artifact runs directly
            runtime: None,
        },
        default_limits: DEFAULT_LIMITS,
        compile_limits: Some(CompileLimits {
            timeout_millis: 30_000,
            memory_limit_bytes: 1024 * MIB,
        }),
        memory_enforcement: MemoryEnforcement::AddressSpace,
        ceilings: ProcessCeilings {
            file_size_bytes: 64 * 1024 * 1024,
            ..ProcessCeilings::default()
        },
        kernel_enforced: capabilities(&KERNEL_ENFORCED),
    }
}

/// Every builtin policy, one per language.
pub fn builtin_policies() -> Vec<SandboxPolicy> {
    vec![
        register_python3_v1(),
        register_node_v1(),
        register_java17_v1(),
        register_cpp17_v1(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preset(language: Language) -> SandboxPolicy {
        builtin_policies()
            .into_iter()
            .find(|policy| policy.language == language)
            .unwrap()
    }

    #[test]
    fn test_defaults_fit_under_ceiling() {
        assert!(DEFAULT_LIMITS.fits_within(&HARD_CEILING));
        for policy in builtin_policies() {
            assert!(policy.default_limits.fits_within(&HARD_CEILING), "{}", policy.id);
        }
    }

    #[test]
    fn test_one_policy_per_language() {
        let policies = builtin_policies();
        let languages: BTreeSet<Language> = policies.iter().map(|p| p.language).collect();
        assert_eq!(languages.len(), policies.len());
    }

    #[test]
    fn test_python_policy() {
        let python = preset(Language::Python);
        assert_eq!(python.id, "python3-v1");
        assert!(!python.toolchain.is_compiled());
        assert!(python.blocks(Capability::ProcessSpawn));
        assert!(python.blocks(Capability::Network));
        assert!(python.allowed_libraries.contains("numpy"));
        assert!(python.blocked_modules.contains("subprocess"));
        assert_eq!(python.memory_enforcement, MemoryEnforcement::AddressSpace);
    }

    #[test]
    fn test_allow_and_block_lists_are_disjoint() {
        let python = preset(Language::Python);
        assert!(python.allowed_libraries.is_disjoint(&python.blocked_modules));
    }

    #[test]
    fn test_java_policy() {
        let java = preset(Language::Java);
        assert!(java.toolchain.is_compiled());
        assert_eq!(java.toolchain.executables(), vec!["javac", "java"]);
        assert_eq!(java.memory_enforcement, MemoryEnforcement::RuntimeFlag);
        assert!(java.compile_limits.is_some());
    }

    #[test]
    fn test_javascript_policy() {
        let node = preset(Language::JavaScript);
        assert!(!node.toolchain.is_compiled());
        assert_eq!(node.memory_enforcement, MemoryEnforcement::RuntimeFlag);
    }

    #[test]
    fn test_cpp_policy() {
        let cpp = preset(Language::Cpp);
        assert_eq!(cpp.id, "cpp17-v1");
        assert_eq!(cpp.toolchain.executables(), vec!["g++"]);
        assert!(cpp.toolchain.runtime.is_none());
        assert!(!cpp.blocks(Capability::NativeCode));
    }

    #[test]
    fn test_every_blocked_capability_is_enforced() {
        for policy in builtin_policies() {
            for capability in &policy.blocked_capabilities {
                let by_kernel = policy.kernel_confined().contains(capability);
                // Python's guard and Node's permission model cover native code
                let by_runtime = *capability == Capability::NativeCode
                    && matches!(policy.language, Language::Python | Language::JavaScript);
                assert!(by_kernel || by_runtime, "{} claims {}", policy.id, capability);
            }
        }
    }

    #[test]
    fn test_runtime_flag_policies_have_overhead() {
        for policy in builtin_policies() {
            if policy.memory_enforcement == MemoryEnforcement::RuntimeFlag {
                assert!(policy.ceilings.runtime_overhead_bytes > 0, "{}", policy.id);
            }
        }
    }
}
