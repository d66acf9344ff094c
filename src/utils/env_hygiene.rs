/// Child environment hygiene
///
/// Children never inherit the engine's environment. They get a fixed,
/// deterministic set of variables with HOME and TMPDIR pointing into their
/// own workspace.
use std::collections::BTreeMap;
use std::path::Path;

/// PATH given to every child and used to resolve toolchain executables
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Loader and interpreter variables that must never reach a child
const DANGEROUS_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PYTHONHOME",
    "NODE_OPTIONS",
    "NODE_PATH",
    "JAVA_TOOL_OPTIONS",
    "_JAVA_OPTIONS",
    "JDK_JAVA_OPTIONS",
    "CLASSPATH",
];

/// Build the environment for a child running inside `workspace`.
///
/// `extra` entries are added last and may not reintroduce a dangerous
/// variable; those are dropped with a warning.
pub fn child_environment(workspace: &Path, extra: &[(String, String)]) -> BTreeMap<String, String> {
    let workspace = workspace.to_string_lossy().into_owned();

    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), SANDBOX_PATH.to_string());
    env.insert("HOME".to_string(), workspace.clone());
    env.insert("TMPDIR".to_string(), workspace);
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.insert("LC_ALL".to_string(), "C.UTF-8".to_string());

    for (key, value) in extra {
        if DANGEROUS_VARS.contains(&key.as_str()) {
            log::warn!("Dropping dangerous environment variable for child: {}", key);
            continue;
        }
        env.insert(key.clone(), value.clone());
    }

    env
}
