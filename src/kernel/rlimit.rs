/// Resource ceilings applied in the child between fork and exec.
///
/// The plan is computed in the parent (where allocation and logging are
/// fine); `apply` only issues `setrlimit`/`umask` so it is safe to call from
/// a `pre_exec` hook.
use nix::sys::resource::{getrlimit, setrlimit, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitEntry {
    pub name: &'static str,
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RlimitPlan {
    entries: Vec<RlimitEntry>,
    umask: Option<u32>,
}

impl RlimitPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a limit, clamped to the engine's own hard limit; an unprivileged
    /// process cannot raise a hard limit, only lower it.
    pub fn limit(mut self, name: &'static str, resource: Resource, soft: u64, hard: u64) -> Self {
        let (soft, hard) = match getrlimit(resource) {
            Ok((_, current_hard)) if current_hard != libc::RLIM_INFINITY => {
                let hard = hard.min(current_hard);
                (soft.min(hard), hard)
            }
            _ => (soft.min(hard), hard),
        };

        self.entries.retain(|entry| entry.resource != resource);
        self.entries.push(RlimitEntry {
            name,
            resource,
            soft,
            hard,
        });
        self
    }

    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = Some(mask);
        self
    }

    pub fn entries(&self) -> &[RlimitEntry] {
        &self.entries
    }

    pub fn get(&self, resource: Resource) -> Option<&RlimitEntry> {
        self.entries.iter().find(|entry| entry.resource == resource)
    }

    /// Apply every entry to the calling process.
    pub fn apply(&self) -> std::io::Result<()> {
        for entry in &self.entries {
            setrlimit(entry.resource, entry.soft, entry.hard)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
        }
        if let Some(mask) = self.umask {
            unsafe {
                libc::umask(mask as libc::mode_t);
            }
        }
        Ok(())
    }
}

/// CPU-seconds ceiling for a wall-clock timeout.
///
/// Multi-threaded runtimes (JIT and GC threads) burn CPU faster than wall
/// time, so the ceiling sits well above the timeout and the wall-clock
/// watchdog stays the primary bound.
pub fn cpu_seconds_for_timeout(timeout_millis: u64) -> u64 {
    let secs = timeout_millis.div_ceil(1000).max(1);
    secs * 2 + 1
}
