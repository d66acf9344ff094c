/// Process-group termination.
///
/// Every step runs as the leader of its own process group, so signalling the
/// negative pid reaches the step and anything it forked.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What happened while tearing a group down
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    /// The leader outlived the grace period and was SIGKILLed
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

fn signal_group(pgid: Pid, signal: Signal) -> Result<(), Errno> {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Whether the leader has exited, without reaping it.
///
/// An unreaped leader keeps its pid (and so the group id) reserved, which
/// makes it safe to signal the group afterwards.
pub fn leader_exited(child: &Child) -> Result<bool, Errno> {
    let pid = Pid::from_raw(child.id() as i32);
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;
    match waitid(Id::Pid(pid), flags)? {
        WaitStatus::StillAlive => Ok(false),
        _ => Ok(true),
    }
}

/// SIGTERM the group, give it `grace` to exit, then SIGKILL it and reap the
/// leader.
pub fn terminate_group(child: &mut Child, grace: Duration) -> (KillReport, Option<ExitStatus>) {
    let mut report = KillReport::default();
    let start = Instant::now();
    let pgid = Pid::from_raw(child.id() as i32);

    match signal_group(pgid, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(e) => {
            // Fall back to the leader alone
            let _ = child.kill();
            report.notes.push(format!("group SIGTERM failed: {}", e));
        }
    }

    let mut exited = false;
    while start.elapsed() < grace {
        match leader_exited(child) {
            Ok(true) => {
                exited = true;
                break;
            }
            Ok(false) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                report.notes.push(format!("waitid during grace: {}", e));
                break;
            }
        }
    }

    if !exited {
        report.kill_sent = true;
    }
    // Stragglers die either way. The leader is not reaped yet, so the
    // group id cannot have been recycled.
    if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
        let _ = child.kill();
        report.notes.push(format!("group SIGKILL failed: {}", e));
    }

    let status = match child.wait() {
        Ok(exit) => Some(exit),
        Err(e) => {
            report.notes.push(format!("wait after SIGKILL: {}", e));
            None
        }
    };

    report.waited_ms = start.elapsed().as_millis() as u64;
    (report, status)
}

/// SIGKILL whatever is left in the group of an exited leader, then reap the
/// leader. Call only after [`leader_exited`] returned true.
pub fn reap_group(child: &mut Child) -> io::Result<ExitStatus> {
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = signal_group(pgid, Signal::SIGKILL) {
        log::warn!("Failed to kill process group {}: {}", pgid, e);
    }
    child.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::Command;

    #[test]
    fn test_terminate_group_kills_sleeping_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();

        let (report, status) = terminate_group(&mut child, Duration::from_millis(500));
        assert!(report.term_sent);
        // sleep honors SIGTERM, so no escalation was needed
        assert!(!report.kill_sent);
        assert_eq!(status.and_then(|s| s.signal()), Some(libc::SIGTERM));
    }

    #[test]
    fn test_terminate_group_escalates_when_term_ignored() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .process_group(0)
            .spawn()
            .unwrap();
        // Let the shell install its trap
        std::thread::sleep(Duration::from_millis(200));

        let (report, status) = terminate_group(&mut child, Duration::from_millis(200));
        assert!(report.kill_sent);
        assert_eq!(status.and_then(|s| s.signal()), Some(libc::SIGKILL));
    }

    /// Alive and not a zombie waiting on whoever adopted it
    fn running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[test]
    fn test_reap_group_kills_orphaned_members() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; exit 0", pid_file.display());
        let mut child = Command::new("sh")
            .args(["-c", &script])
            .process_group(0)
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !leader_exited(&child).unwrap() {
            assert!(Instant::now() < deadline, "leader never exited");
            std::thread::sleep(POLL_INTERVAL);
        }
        // Still a zombie: waitid left it for us to reap
        assert!(leader_exited(&child).unwrap());

        let status = reap_group(&mut child).unwrap();
        assert_eq!(status.code(), Some(0));

        let background: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while running(background) {
            assert!(Instant::now() < deadline, "background sleep survived");
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    #[test]
    fn test_leader_exited_is_false_while_running() {
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        assert!(!leader_exited(&child).unwrap());
        terminate_group(&mut child, Duration::ZERO);
    }
}
