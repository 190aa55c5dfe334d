#![forbid(unsafe_code)]
//! xfr public API facade.
//!
//! Re-exports the traversal engine from `xfr-core` through a stable external
//! interface. Downstream consumers depend on this crate rather than on the
//! individual parsing and device crates.

pub use xfr_core::*;
