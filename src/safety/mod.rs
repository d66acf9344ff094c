//! Safety and cleanup
//!
//! Private per-execution workspaces and symlink-safe removal.

pub mod safe_cleanup;
pub mod workspace;
