//! Execution control
//!
//! Admission, the blocking and submitted execution paths, and cancellation
//! handles.

pub mod admission;
pub mod engine;
pub mod handle;

pub use engine::Engine;
pub use handle::ExecutionHandle;
