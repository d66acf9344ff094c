use crate::config::loader::EngineConfig;
use crate::config::types::{ExecutionRequest, Language, LimitOverrides};
use crate::exec::Engine;
use crate::kernel::signal::SignalHandler;
use crate::safety::workspace::WorkspaceManager;
use crate::utils::env_hygiene::SANDBOX_PATH;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file (overrides EXECBOX_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute source code and print the result as JSON
    ExecuteCode {
        /// Programming language (python, javascript, java, cpp); inferred
        /// from --file when omitted
        #[arg(long)]
        language: Option<String>,
        /// Source code as string
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,
        /// Read source code from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Wall-clock limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,
        /// Per-stream output ceiling in bytes
        #[arg(long)]
        max_output_bytes: Option<usize>,
        /// Opaque id echoed back in the result
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// List registered languages and their policies
    Languages,
    /// Check that every toolchain executable is installed
    CheckDeps {
        /// Verbose output showing detailed version information
        #[arg(long)]
        verbose: bool,
    },
    /// Remove leftover workspaces
    Sweep {
        /// Only remove workspaces older than this
        #[arg(long, default_value_t = 0)]
        max_age_secs: u64,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();
    let signals = SignalHandler::init()?;

    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::ExecuteCode {
            language,
            code,
            file,
            timeout_ms,
            memory_mb,
            max_output_bytes,
            correlation_id,
        } => {
            let code = match (code, &file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("either --code or --file is required"),
            };
            let language = match (language, &file) {
                (Some(language), _) => language,
                (None, Some(path)) => language_from_extension(path)?.to_string(),
                (None, None) => bail!("--language is required with --code"),
            };
            let limits = LimitOverrides {
                timeout_millis: timeout_ms,
                memory_limit_bytes: memory_mb.map(|mb| mb * 1024 * 1024),
                max_captured_output_bytes: max_output_bytes,
            };

            let success = execute_code(config, &signals, &code, &language, limits, correlation_id)?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Languages => list_languages(config),
        Commands::CheckDeps { verbose } => check_language_dependencies(config, verbose),
        Commands::Sweep { max_age_secs } => {
            let manager = WorkspaceManager::new(config.workspace_root.clone())?;
            let removed = manager.sweep_stale(Duration::from_secs(max_age_secs))?;
            println!(
                "Removed {} workspace(s) from {}",
                removed,
                manager.root().display()
            );
            Ok(())
        }
    }
}

fn language_from_extension(path: &Path) -> Result<Language> {
    let language = match path.extension().and_then(|ext| ext.to_str()) {
        Some("py") => Language::Python,
        Some("js") | Some("mjs") | Some("cjs") => Language::JavaScript,
        Some("java") => Language::Java,
        Some("cpp") | Some("cc") | Some("cxx") => Language::Cpp,
        _ => bail!(
            "cannot infer language from {}; pass --language",
            path.display()
        ),
    };
    Ok(language)
}

/// Run one execution, cancelling it if a shutdown signal arrives. Returns
/// whether it completed.
fn execute_code(
    config: EngineConfig,
    signals: &SignalHandler,
    code: &str,
    language: &str,
    limits: LimitOverrides,
    correlation_id: Option<String>,
) -> Result<bool> {
    let engine = Arc::new(Engine::new(config)?);

    let result = match language.parse::<Language>() {
        Ok(language) => {
            let mut request = ExecutionRequest::new(code, language).with_limits(limits);
            if let Some(correlation_id) = correlation_id {
                request = request.with_correlation_id(correlation_id);
            }

            let handle = engine.submit(request);
            let mut cancel_sent = false;
            loop {
                if let Some(result) = handle.wait_timeout(POLL_INTERVAL) {
                    break result;
                }
                if signals.shutdown_requested() && !cancel_sent {
                    log::warn!(
                        "Received signal {}; cancelling {}",
                        signals.get_signal(),
                        handle.execution_id()
                    );
                    handle.cancel();
                    cancel_sent = true;
                }
            }
        }
        // Reported as a rejected result, same as any other caller sees it
        Err(_) => engine.execute_source(code, language, Some(limits)),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.is_success())
}

fn list_languages(config: EngineConfig) -> Result<()> {
    let registry = crate::config::policy::PolicyRegistry::from_config(&config)?;
    for policy in registry.policies() {
        let limits = &policy.default_limits;
        println!(
            "{:<11} {:<11} timeout={}ms memory={}MB output={}B fingerprint={}",
            policy.language.as_str(),
            policy.id,
            limits.timeout_millis,
            limits.memory_limit_mb(),
            limits.max_captured_output_bytes,
            &policy.fingerprint()[..12]
        );
    }
    Ok(())
}

fn version_line(program: &Path) -> Option<String> {
    // javac/java print their version to stderr
    ["--version", "-version"].iter().find_map(|flag| {
        let output = Command::new(program)
            .arg(flag)
            .stdin(Stdio::null())
            .output()
            .ok()
            .filter(|output| output.status.success())?;
        let text = if output.stdout.is_empty() {
            output.stderr
        } else {
            output.stdout
        };
        String::from_utf8_lossy(&text)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
    })
}

fn check_language_dependencies(config: EngineConfig, verbose: bool) -> Result<()> {
    let registry = crate::config::policy::PolicyRegistry::from_config(&config)?;

    println!("🔍 Checking language toolchains...");
    println!();

    let mut missing = Vec::new();
    for policy in registry.policies() {
        let mut lines = Vec::new();
        let mut ok = true;

        for executable in policy.toolchain.executables() {
            match which::which_in(executable, Some(SANDBOX_PATH), "/") {
                Ok(path) => {
                    if verbose {
                        let version = version_line(&path).unwrap_or_else(|| "unknown".to_string());
                        lines.push(format!("  {} -> {} ({})", executable, path.display(), version));
                    }
                }
                Err(_) => {
                    ok = false;
                    lines.push(format!("  {} -> NOT FOUND on {}", executable, SANDBOX_PATH));
                }
            }
        }

        if ok {
            println!("✅ {} - OK", policy.language);
        } else {
            println!("❌ {} - MISSING", policy.language);
            missing.push(policy.language.as_str());
        }
        for line in lines {
            println!("{}", line);
        }
    }

    println!();
    if missing.is_empty() {
        println!("🎉 All language toolchains are installed");
        Ok(())
    } else {
        println!("Missing toolchains: {}", missing.join(", "));
        std::process::exit(1);
    }
}
