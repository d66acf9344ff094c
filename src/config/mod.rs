//! Configuration and policy
//!
//! Engine configuration loading, per-language sandbox policies, and the
//! shared type vocabulary.

pub mod loader;
pub mod policy;
pub mod presets;
pub mod types;
