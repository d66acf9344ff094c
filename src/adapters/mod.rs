//! Language adapters.
//!
//! The supervisor stays language-agnostic. Adapters turn source plus policy
//! into the ordered subprocess steps for one language, and know how that
//! language's toolchain reports syntax errors and capability denials.

pub mod adapter;
pub mod languages;
pub mod registry;

pub use adapter::{AdapterStrategy, LanguageAdapter};
pub use registry::AdapterRegistry;
