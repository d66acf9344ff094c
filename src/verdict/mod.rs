//! Result classification
//!
//! Derives status, error kind and diagnostics as pure functions over the
//! supervisor's raw outcome.

pub mod classifier;
pub mod diagnostics;

pub use classifier::{ResultClassifier, Verdict};
