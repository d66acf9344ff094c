//! Observability
//!
//! Structured audit events and lock-free execution metrics.

pub mod audit;
pub mod metrics;
