//! execbox: sandboxed execution of untrusted source code
//!
//! Runs Python, JavaScript, Java and C++ submissions in throwaway
//! workspaces under per-language capability policies and resource limits,
//! and reports a normalized result for every request.
//!
//! # Architecture
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::loader`]: Engine configuration from file and environment
//! - [`config::policy`]: Sandbox policies and the policy registry
//! - [`config::presets`]: Builtin per-language policies
//! - [`config::types`]: Requests, results and the error type
//!
//! ## Language Adapters ([`adapters`])
//! - [`adapters::adapter`]: The adapter trait and strategy split
//! - [`adapters::languages`]: Python, JavaScript, Java and C++ adapters
//! - [`adapters::registry`]: Language to adapter lookup
//!
//! ## Execution Core ([`core`](crate::core))
//! - [`core::supervisor`](crate::core::supervisor): Runs steps under limits, kills on timeout or cancel
//! - [`core::types`](crate::core::types): Steps, step outcomes and cancellation tokens
//!
//! ## Execution Control ([`exec`])
//! - [`exec::engine`]: Orchestration from request to result
//! - [`exec::admission`]: Concurrency ceiling
//! - [`exec::handle`]: Status, cancellation and results of submitted runs
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classifier`]: Status and error kind from raw outcomes
//! - [`verdict::diagnostics`]: Error summaries and source lines
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::rlimit`]: Resource ceilings applied before exec
//! - [`kernel::fs_confine`]: Landlock write confinement to the workspace
//! - [`kernel::seccomp`]: Syscall filter for process spawn and network
//! - [`kernel::process_group`]: Process group teardown
//! - [`kernel::signal`]: Shutdown signal handling
//!
//! ## Safety ([`safety`]), Observability ([`observability`]), Utilities ([`utils`])
//!
//! # Example
//!
//! ```no_run
//! use execbox::{Engine, EngineConfig, ExecutionRequest, Language};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let result = engine.execute(ExecutionRequest::new("print('hi')", Language::Python));
//! println!("{} {}", result.status(), result.stdout());
//! # Ok::<(), execbox::EngineError>(())
//! ```

// Language adapters
pub mod adapters;

// CLI entrypoint
pub mod cli;

// Configuration & Policy
pub mod config;

// Language-agnostic execution core
pub mod core;

// Execution Control
pub mod exec;

// Kernel Primitives
pub mod kernel;

// Observability
pub mod observability;

// Safety & Cleanup
pub mod safety;

// Utilities
pub mod utils;

// Verdict
pub mod verdict;

// Re-export commonly used types for convenience
pub use config::loader::EngineConfig;
pub use config::policy::{PolicyRegistry, SandboxPolicy};
pub use config::types::*;
pub use crate::core::types::CancelToken;
pub use exec::{Engine, ExecutionHandle};
