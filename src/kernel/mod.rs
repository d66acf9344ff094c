//! Kernel-facing primitives
//!
//! Resource ceilings and confinement applied before exec, process-group
//! teardown, and the shutdown signal flag used by the CLI.

pub mod fs_confine;
pub mod process_group;
pub mod rlimit;
pub mod seccomp;
pub mod signal;
