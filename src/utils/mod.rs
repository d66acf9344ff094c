//! Utilities
//!
//! Bounded output capture and child environment hygiene.

pub mod env_hygiene;
pub mod output;
