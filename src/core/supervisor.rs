/// Execution supervisor
///
/// Runs the steps an adapter prepared, one at a time:
/// - each step is its own process group, cwd and HOME in the workspace,
///   environment cleared, stdin closed
/// - resource ceilings are set between fork and exec; run steps are also
///   confined by Landlock (writes) and a seccomp filter (spawn, network)
/// - stdout and stderr are drained by independent bounded readers
/// - a 10ms watchdog enforces the wall-clock budget and cancellation,
///   escalating SIGTERM -> grace -> SIGKILL on the whole group
/// - a failed step stops the sequence
use crate::config::policy::{Capability, MemoryEnforcement, SandboxPolicy};
use crate::config::types::{EngineError, ExecutionLimits, Result, StageKind};
use crate::core::types::{CancelToken, RawOutcome, RunStep, StepOutcome};
use crate::kernel::fs_confine;
use crate::kernel::process_group::{self, KillReport};
use crate::kernel::rlimit::{cpu_seconds_for_timeout, RlimitPlan};
use crate::kernel::seccomp::SyscallFilter;
use crate::utils::env_hygiene::{child_environment, SANDBOX_PATH};
use crate::utils::output::StreamCapture;
use landlock::RulesetCreated;
use nix::sys::resource::Resource;
use std::collections::BTreeSet;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Budget for a single step
#[derive(Debug, Clone, PartialEq, Eq)]
struct StepBudget {
    timeout: Duration,
    memory_limit_bytes: u64,
    output_cap: usize,
}

pub struct Supervisor {
    kill_grace: Duration,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(kill_grace: Duration, drain_timeout: Duration) -> Self {
        Self {
            kill_grace,
            drain_timeout,
        }
    }

    /// Run `steps` in order and report what happened.
    ///
    /// Compile steps use the policy's compile limits when it has them; run
    /// steps share the request's wall-clock budget. Errors are infrastructure
    /// failures only; user-code failures are data in the outcome.
    pub fn run(
        &self,
        steps: &[RunStep],
        policy: &SandboxPolicy,
        limits: &ExecutionLimits,
        cancel: &CancelToken,
    ) -> Result<RawOutcome> {
        let started = Instant::now();
        let mut outcome = RawOutcome::default();
        let mut run_elapsed = Duration::ZERO;

        for step in steps {
            if cancel.is_cancelled() {
                log::info!("Cancelled before {:?} step", step.kind);
                outcome.steps.push(cancelled_before_start(step.kind));
                break;
            }

            let budget = match step.kind {
                StageKind::Compile => match &policy.compile_limits {
                    Some(compile) => StepBudget {
                        timeout: Duration::from_millis(compile.timeout_millis),
                        memory_limit_bytes: compile.memory_limit_bytes,
                        output_cap: limits.max_captured_output_bytes,
                    },
                    None => StepBudget {
                        timeout: limits.timeout(),
                        memory_limit_bytes: limits.memory_limit_bytes,
                        output_cap: limits.max_captured_output_bytes,
                    },
                },
                StageKind::Run => StepBudget {
                    timeout: limits.timeout().saturating_sub(run_elapsed),
                    memory_limit_bytes: limits.memory_limit_bytes,
                    output_cap: limits.max_captured_output_bytes,
                },
            };

            let result = self.run_step(step, policy, &budget, cancel)?;
            if step.kind == StageKind::Run {
                run_elapsed += result.duration;
            }

            let succeeded = result.succeeded();
            outcome.steps.push(result);
            if !succeeded {
                break;
            }
        }

        outcome.duration = started.elapsed();
        Ok(outcome)
    }

    fn run_step(
        &self,
        step: &RunStep,
        policy: &SandboxPolicy,
        budget: &StepBudget,
        cancel: &CancelToken,
    ) -> Result<StepOutcome> {
        let program = resolve_executable(&step.executable, &step.working_dir)?;
        let plan = rlimit_plan(policy, budget);
        let confined = match step.kind {
            StageKind::Run => policy.kernel_confined(),
            // Toolchains fork helpers and write artifacts
            StageKind::Compile => BTreeSet::new(),
        };
        let (ruleset, filter) = confinement(&confined, &step.working_dir)?;
        let filtered = filter.is_some();

        let mut cmd = Command::new(&program);
        cmd.args(&step.args)
            .current_dir(&step.working_dir)
            .env_clear()
            .envs(child_environment(&step.working_dir, &step.env))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut ruleset = ruleset;
        unsafe {
            cmd.pre_exec(move || {
                plan.apply()?;
                if let Some(ruleset) = ruleset.take() {
                    fs_confine::restrict(ruleset)?;
                }
                if let Some(filter) = &filter {
                    filter.install()?;
                }
                Ok(())
            });
        }

        log::debug!(
            "Spawning {:?} step: {} (timeout {:?})",
            step.kind,
            step.display(),
            budget.timeout
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            EngineError::Spawn(format!("Failed to spawn {}: {}", program.display(), e))
        })?;
        let pid = child.id();

        let captures = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => StreamCapture::spawn("stdout", stdout, budget.output_cap)
                .and_then(|out| {
                    StreamCapture::spawn("stderr", stderr, budget.output_cap).map(|err| (out, err))
                }),
            _ => Err(EngineError::Spawn("Child stdio pipes missing".to_string())),
        };
        let (stdout_capture, stderr_capture) = match captures {
            Ok(pair) => pair,
            Err(e) => {
                process_group::terminate_group(&mut child, Duration::ZERO);
                return Err(e);
            }
        };

        let deadline = started + budget.timeout;
        let mut timed_out = false;
        let mut cancelled = false;
        let mut kill_report: Option<KillReport> = None;
        let exit: Option<ExitStatus>;

        loop {
            match process_group::leader_exited(&child) {
                Ok(true) => {
                    // Nothing the leader started may outlive it
                    match process_group::reap_group(&mut child) {
                        Ok(status) => exit = Some(status),
                        Err(e) => {
                            return Err(EngineError::Process(format!("reap {}: {}", pid, e)));
                        }
                    }
                    break;
                }
                Ok(false) => {
                    if cancel.is_cancelled() {
                        cancelled = true;
                    } else if Instant::now() >= deadline {
                        timed_out = true;
                    } else {
                        std::thread::sleep(POLL_INTERVAL);
                        continue;
                    }

                    log::info!(
                        "Terminating process group {} ({})",
                        pid,
                        if timed_out { "timeout" } else { "cancelled" }
                    );
                    let (report, status) = process_group::terminate_group(&mut child, self.kill_grace);
                    kill_report = Some(report);
                    exit = status;
                    break;
                }
                Err(e) => {
                    process_group::terminate_group(&mut child, Duration::ZERO);
                    return Err(EngineError::Process(format!("wait on {}: {}", pid, e)));
                }
            }
        }

        let duration = started.elapsed();
        let stdout = stdout_capture.finish(self.drain_timeout);
        let stderr = stderr_capture.finish(self.drain_timeout);

        let signal = exit.and_then(|status| status.signal());
        let syscall_denied = filtered && kill_report.is_none() && signal == Some(libc::SIGSYS);
        if syscall_denied {
            log::info!("{:?} step {} hit the syscall filter", step.kind, pid);
        }

        Ok(StepOutcome {
            kind: step.kind,
            exit_code: exit.and_then(|status| status.code()),
            signal,
            stdout,
            stderr,
            duration,
            timed_out,
            cancelled,
            kill_report,
            syscall_denied,
        })
    }
}

/// Resolve a toolchain name against the sandbox PATH; absolute paths must
/// point at an executable file.
fn resolve_executable(executable: &str, cwd: &std::path::Path) -> Result<PathBuf> {
    which::which_in(executable, Some(SANDBOX_PATH), cwd).map_err(|e| {
        EngineError::Spawn(format!(
            "toolchain executable not found: {} ({})",
            executable, e
        ))
    })
}

fn rlimit_plan(policy: &SandboxPolicy, budget: &StepBudget) -> RlimitPlan {
    let cpu = cpu_seconds_for_timeout(budget.timeout.as_millis() as u64);
    let ceilings = &policy.ceilings;

    let mut plan = RlimitPlan::new()
        .limit("RLIMIT_CORE", Resource::RLIMIT_CORE, 0, 0)
        .limit("RLIMIT_CPU", Resource::RLIMIT_CPU, cpu, cpu + 1)
        .limit(
            "RLIMIT_FSIZE",
            Resource::RLIMIT_FSIZE,
            ceilings.file_size_bytes,
            ceilings.file_size_bytes,
        )
        .limit(
            "RLIMIT_NOFILE",
            Resource::RLIMIT_NOFILE,
            ceilings.open_files,
            ceilings.open_files,
        )
        .umask(0o077);

    match policy.memory_enforcement {
        MemoryEnforcement::AddressSpace => {
            plan = plan.limit(
                "RLIMIT_AS",
                Resource::RLIMIT_AS,
                budget.memory_limit_bytes,
                budget.memory_limit_bytes,
            );
        }
        MemoryEnforcement::RuntimeFlag => {
            // Heap flags bound the managed heap only; this bounds the rest
            let data = budget
                .memory_limit_bytes
                .saturating_add(ceilings.runtime_overhead_bytes);
            plan = plan.limit("RLIMIT_DATA", Resource::RLIMIT_DATA, data, data);
        }
    }
    if let Some(processes) = ceilings.processes {
        plan = plan.limit("RLIMIT_NPROC", Resource::RLIMIT_NPROC, processes, processes);
    }
    plan
}

/// Kernel confinement for one step. Landlock takes the filesystem when the
/// kernel has it; seccomp takes everything else, and the filesystem too
/// when Landlock is missing.
fn confinement(
    capabilities: &BTreeSet<Capability>,
    workspace: &Path,
) -> Result<(Option<RulesetCreated>, Option<SyscallFilter>)> {
    let mut filtered = capabilities.clone();
    let mut ruleset = None;

    if capabilities.contains(&Capability::FilesystemOutsideWorkspace)
        && fs_confine::abi_version().is_some()
    {
        let created = fs_confine::workspace_ruleset(workspace).map_err(|e| {
            EngineError::Policy(format!("Failed to build Landlock ruleset: {}", e))
        })?;
        filtered.remove(&Capability::FilesystemOutsideWorkspace);
        ruleset = Some(created);
    }

    Ok((ruleset, SyscallFilter::build(&filtered)?))
}

fn cancelled_before_start(kind: StageKind) -> StepOutcome {
    StepOutcome {
        kind,
        exit_code: None,
        signal: None,
        stdout: Default::default(),
        stderr: Default::default(),
        duration: Duration::ZERO,
        timed_out: false,
        cancelled: true,
        kill_report: None,
        syscall_denied: false,
    }
}
