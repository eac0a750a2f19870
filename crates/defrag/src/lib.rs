#![forbid(unsafe_code)]
//! disk-defrag public API facade.
//!
//! Re-exports the pipeline from `defrag-core` through a stable external
//! interface. This is the crate that downstream consumers (the CLI, tools
//! embedding the defragmenter) depend on.

pub use defrag_core::*;
