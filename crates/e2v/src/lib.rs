#![forbid(unsafe_code)]
//! ext2view public API facade.
//!
//! Re-exports the read-only ext2 reader from `e2v-core`. The CLI and any
//! downstream consumer depend on this crate.

pub use e2v_core::*;
