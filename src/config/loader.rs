//! Engine configuration: builtin defaults, then an optional JSON file, then
//! `EXECBOX_*` environment overrides.

use crate::config::presets::HARD_CEILING;
use crate::config::types::{EngineError, ExecutionLimits, LimitOverrides, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a JSON config file
pub const CONFIG_PATH_ENV: &str = "EXECBOX_CONFIG";

/// Per-language adjustments applied on top of the builtin preset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LanguageOverride {
    pub enabled: bool,
    pub timeout_millis: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub max_captured_output_bytes: Option<usize>,
    pub allowed_libraries: Option<Vec<String>>,
    pub runtime_executable: Option<String>,
    pub compiler_executable: Option<String>,
}

impl Default for LanguageOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_millis: None,
            memory_limit_bytes: None,
            max_captured_output_bytes: None,
            allowed_libraries: None,
            runtime_executable: None,
            compiler_executable: None,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Parent directory of every execution workspace
    pub workspace_root: PathBuf,
    /// Admission ceiling; requests above it are rejected, never queued
    pub max_concurrent_executions: usize,
    /// Time between SIGTERM and SIGKILL when a process group is torn down
    pub kill_grace_millis: u64,
    /// How long to wait for stream readers after the process group is gone
    pub output_drain_timeout_millis: u64,
    /// Remove leftover workspaces older than this when the engine starts
    pub stale_workspace_max_age_secs: Option<u64>,
    /// No request limit may exceed these values
    pub hard_ceiling: ExecutionLimits,
    /// Applied to every language's defaults before per-language overrides
    pub default_overrides: LimitOverrides,
    /// Keyed by language name ("python", "javascript", "java", "cpp")
    pub languages: BTreeMap<String, LanguageOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::runtime_root_dir(),
            max_concurrent_executions: 16,
            kill_grace_millis: 500,
            output_drain_timeout_millis: 2_000,
            stale_workspace_max_age_secs: Some(3_600),
            hard_ceiling: HARD_CEILING,
            default_overrides: LimitOverrides::default(),
            languages: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Workspace root scoped by effective UID, so runs by different users
    /// never collide under the shared temp directory.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("execbox-uid-{}", euid))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_millis)
    }

    pub fn output_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.output_drain_timeout_millis)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Resolve the effective configuration.
    ///
    /// `path` wins over `EXECBOX_CONFIG`; with neither, builtin defaults are
    /// used. Environment overrides are applied last and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                log::info!("Loading engine configuration from {}", path.display());
                Self::load_from_file(path)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `EXECBOX_*` overrides read through `lookup`.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EXECBOX_TIMEOUT_MS") {
            self.default_overrides.timeout_millis = Some(parse_env("EXECBOX_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = lookup("EXECBOX_MEMORY_MB") {
            let mb: u64 = parse_env("EXECBOX_MEMORY_MB", &value)?;
            self.default_overrides.memory_limit_bytes = Some(mb * 1024 * 1024);
        }
        if let Some(value) = lookup("EXECBOX_MAX_OUTPUT_BYTES") {
            self.default_overrides.max_captured_output_bytes =
                Some(parse_env("EXECBOX_MAX_OUTPUT_BYTES", &value)?);
        }
        if let Some(value) = lookup("EXECBOX_MAX_CONCURRENCY") {
            self.max_concurrent_executions = parse_env("EXECBOX_MAX_CONCURRENCY", &value)?;
        }
        if let Some(value) = lookup("EXECBOX_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(value);
        }
        Ok(())
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.workspace_root.is_absolute() {
            return Err(EngineError::Config(format!(
                "workspace_root must be absolute: {}",
                self.workspace_root.display()
            )));
        }
        if self.max_concurrent_executions == 0 {
            return Err(EngineError::Config(
                "max_concurrent_executions must be at least 1".to_string(),
            ));
        }

        let ceiling = &self.hard_ceiling;
        if ceiling.timeout_millis == 0
            || ceiling.memory_limit_bytes == 0
            || ceiling.max_captured_output_bytes == 0
        {
            return Err(EngineError::Config(
                "hard_ceiling limits must be non-zero".to_string(),
            ));
        }

        let defaults = ExecutionLimits {
            timeout_millis: 1,
            memory_limit_bytes: 1,
            max_captured_output_bytes: 1,
        }
        .with_overrides(&self.default_overrides);
        if !defaults.fits_within(ceiling) {
            return Err(EngineError::Config(
                "default limit overrides exceed hard_ceiling".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("Invalid value for {}: {:?}", key, value)))
}
