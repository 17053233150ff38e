#![forbid(unsafe_code)]
//! lazywright public API facade.
//!
//! Re-exports the lazy-writer engine from `lw-core` through a stable
//! external interface. This is the crate downstream consumers depend on.

pub use lw_core::*;
