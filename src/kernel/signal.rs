/// Async-safe shutdown signal handling for the CLI.
///
/// The handler only stores atomics. The main loop polls the flag and
/// cancels the running execution, which tears down its process group and
/// workspace on the normal path.
use crate::config::types::{EngineError, Result};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT, SIGTERM and SIGHUP.
    /// Call early in main(), before any threads are spawned.
    pub fn init() -> Result<Self> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            unsafe { signal::sigaction(sig, &sig_action) }.map_err(|e| {
                EngineError::Process(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// No allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    #[allow(dead_code)]
    pub fn reset(&self) {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }
}
