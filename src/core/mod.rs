//! Language-agnostic execution core.
//!
//! Owns the step model and the supervisor that runs steps under limits.
//! Language-specific preparation lives in the adapters.

pub mod supervisor;
pub mod types;
