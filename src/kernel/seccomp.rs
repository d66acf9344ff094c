/// Syscall filtering for blocked capabilities.
///
/// A deny-list seccomp-BPF program is assembled in the parent and installed
/// from `pre_exec`, after the rlimits. Everything not named here stays
/// allowed, so runtimes start normally. Killing rules end the process with
/// SIGSYS, which the supervisor reports as a capability denial.
use crate::config::policy::Capability;
use crate::config::types::{EngineError, Result};
use std::collections::BTreeSet;
use std::io;

/// Diagnostic summary for a step that died on a filtered syscall.
pub const DENIAL_NOTE: &str = "capability denied: system call blocked by sandbox policy";

// Classic BPF opcodes (linux/filter.h)
const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JEQ_K: u16 = 0x15;
const BPF_JGE_K: u16 = 0x35;
const BPF_JSET_K: u16 = 0x45;
const BPF_RET_K: u16 = 0x06;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// struct seccomp_data
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS: u32 = 16;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: Option<u32> = Some(0xC000_003E);
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: Option<u32> = Some(0xC000_00B7);
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const AUDIT_ARCH: Option<u32> = None;

/// x32 syscalls share the x86_64 audit arch but carry this bit
#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    KillProcess,
    Errno(i32),
}

impl Action {
    fn ret(self) -> u32 {
        match self {
            Action::KillProcess => SECCOMP_RET_KILL_PROCESS,
            Action::Errno(errno) => SECCOMP_RET_ERRNO | (errno as u32 & 0xffff),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    Always {
        nr: i64,
        action: Action,
    },
    /// Matches when the low word of `arg` has any bit of `mask` set
    ArgHasAny {
        nr: i64,
        arg: u32,
        mask: u32,
        action: Action,
    },
    /// Matches when the low word of `arg` has none of `mask`
    ArgLacks {
        nr: i64,
        arg: u32,
        mask: u32,
        action: Action,
    },
    /// `then` when the low word of `arg` equals `value`, `otherwise` when not
    ArgIs {
        nr: i64,
        arg: u32,
        value: u32,
        then: Action,
        otherwise: Action,
    },
}

fn always(nr: libc::c_long, action: Action) -> Rule {
    Rule::Always {
        nr: nr as i64,
        action,
    }
}

fn process_spawn_rules() -> Vec<Rule> {
    let kill = Action::KillProcess;
    let mut rules = vec![
        // Threads keep working; fork-style clones do not
        Rule::ArgLacks {
            nr: libc::SYS_clone as i64,
            arg: 0,
            mask: libc::CLONE_THREAD as u32,
            action: kill,
        },
        // clone3 hides its flags behind a pointer; libc falls back to clone
        always(libc::SYS_clone3, Action::Errno(libc::ENOSYS)),
        always(libc::SYS_ptrace, Action::Errno(libc::EPERM)),
        always(libc::SYS_process_vm_writev, Action::Errno(libc::EPERM)),
    ];
    #[cfg(target_arch = "x86_64")]
    rules.extend([always(libc::SYS_fork, kill), always(libc::SYS_vfork, kill)]);
    rules
}

fn network_rules() -> Vec<Rule> {
    // libc reaches for AF_UNIX on its own (nscd lookups behind getpwuid) and
    // copes with a refusal
    vec![Rule::ArgIs {
        nr: libc::SYS_socket as i64,
        arg: 0,
        value: libc::AF_UNIX as u32,
        then: Action::Errno(libc::EACCES),
        otherwise: Action::KillProcess,
    }]
}

/// Path-blind write denial, used only where Landlock is unavailable. It
/// also stops writes inside the workspace.
fn filesystem_rules() -> Vec<Rule> {
    let denied = Action::Errno(libc::EACCES);
    let write_flags = (libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC | libc::O_APPEND) as u32;

    let mut rules = vec![
        Rule::ArgHasAny {
            nr: libc::SYS_openat as i64,
            arg: 2,
            mask: write_flags,
            action: denied,
        },
        always(libc::SYS_openat2, Action::Errno(libc::ENOSYS)),
    ];
    for nr in [
        libc::SYS_unlinkat,
        libc::SYS_renameat,
        libc::SYS_renameat2,
        libc::SYS_mkdirat,
        libc::SYS_linkat,
        libc::SYS_symlinkat,
        libc::SYS_fchmodat,
        libc::SYS_fchownat,
        libc::SYS_mknodat,
        libc::SYS_truncate,
    ] {
        rules.push(always(nr, denied));
    }

    #[cfg(target_arch = "x86_64")]
    {
        rules.push(Rule::ArgHasAny {
            nr: libc::SYS_open as i64,
            arg: 1,
            mask: write_flags,
            action: denied,
        });
        for nr in [
            libc::SYS_creat,
            libc::SYS_unlink,
            libc::SYS_rename,
            libc::SYS_mkdir,
            libc::SYS_rmdir,
            libc::SYS_link,
            libc::SYS_symlink,
            libc::SYS_chmod,
            libc::SYS_chown,
            libc::SYS_lchown,
            libc::SYS_mknod,
        ] {
            rules.push(always(nr, denied));
        }
    }
    rules
}

fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Each rule is a self-contained block that either returns or falls
/// through to the next rule with the syscall number still loaded.
fn emit(rule: Rule, program: &mut Vec<libc::sock_filter>) {
    match rule {
        Rule::Always { nr, action } => {
            program.push(jump(BPF_JEQ_K, nr as u32, 0, 1));
            program.push(stmt(BPF_RET_K, action.ret()));
        }
        Rule::ArgHasAny {
            nr,
            arg,
            mask,
            action,
        } => {
            program.push(jump(BPF_JEQ_K, nr as u32, 0, 4));
            program.push(stmt(BPF_LD_W_ABS, OFFSET_ARGS + 8 * arg));
            program.push(jump(BPF_JSET_K, mask, 0, 1));
            program.push(stmt(BPF_RET_K, action.ret()));
            program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
        }
        Rule::ArgLacks {
            nr,
            arg,
            mask,
            action,
        } => {
            program.push(jump(BPF_JEQ_K, nr as u32, 0, 4));
            program.push(stmt(BPF_LD_W_ABS, OFFSET_ARGS + 8 * arg));
            program.push(jump(BPF_JSET_K, mask, 1, 0));
            program.push(stmt(BPF_RET_K, action.ret()));
            program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
        }
        Rule::ArgIs {
            nr,
            arg,
            value,
            then,
            otherwise,
        } => {
            program.push(jump(BPF_JEQ_K, nr as u32, 0, 4));
            program.push(stmt(BPF_LD_W_ABS, OFFSET_ARGS + 8 * arg));
            program.push(jump(BPF_JEQ_K, value, 0, 1));
            program.push(stmt(BPF_RET_K, then.ret()));
            program.push(stmt(BPF_RET_K, otherwise.ret()));
        }
    }
}

/// An assembled filter, ready to install in a child.
#[derive(Clone)]
pub struct SyscallFilter {
    capabilities: BTreeSet<Capability>,
    program: Vec<libc::sock_filter>,
}

impl std::fmt::Debug for SyscallFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallFilter")
            .field("capabilities", &self.capabilities)
            .field("instructions", &self.program.len())
            .finish()
    }
}

impl SyscallFilter {
    /// Build a filter denying `capabilities`. Returns `None` when there is
    /// nothing to deny; native code has no syscall-level rule.
    pub fn build(capabilities: &BTreeSet<Capability>) -> Result<Option<Self>> {
        let mut rules = Vec::new();
        for capability in capabilities {
            match capability {
                Capability::ProcessSpawn => rules.extend(process_spawn_rules()),
                Capability::Network => rules.extend(network_rules()),
                Capability::FilesystemOutsideWorkspace => rules.extend(filesystem_rules()),
                Capability::NativeCode => {}
            }
        }
        if rules.is_empty() {
            return Ok(None);
        }

        let arch = AUDIT_ARCH.ok_or_else(|| {
            EngineError::Policy("syscall filtering is not supported on this architecture".to_string())
        })?;

        // io_uring submits work the filter never sees
        rules.push(always(libc::SYS_io_uring_setup, Action::Errno(libc::ENOSYS)));

        let mut program = vec![
            stmt(BPF_LD_W_ABS, OFFSET_ARCH),
            jump(BPF_JEQ_K, arch, 1, 0),
            stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
            stmt(BPF_LD_W_ABS, OFFSET_NR),
        ];
        #[cfg(target_arch = "x86_64")]
        {
            program.push(jump(BPF_JGE_K, X32_SYSCALL_BIT, 0, 1));
            program.push(stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS));
        }
        for rule in rules {
            emit(rule, &mut program);
        }
        program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));

        if program.len() > u16::MAX as usize {
            return Err(EngineError::Policy("syscall filter is too large".to_string()));
        }

        Ok(Some(Self {
            capabilities: capabilities.clone(),
            program,
        }))
    }

    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    pub fn len(&self) -> usize {
        self.program.len()
    }

    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Install on the calling process. Only issues `prctl`, so it is safe
    /// between fork and exec.
    pub fn install(&self) -> io::Result<()> {
        let prog = libc::sock_fprog {
            len: self.program.len() as libc::c_ushort,
            filter: self.program.as_ptr() as *mut libc::sock_filter,
        };
        let zero: libc::c_ulong = 0;
        unsafe {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, zero, zero, zero) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER as libc::c_ulong,
                &prog as *const libc::sock_fprog,
            ) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
