#![forbid(unsafe_code)]
//! Error types for disk-defrag.
//!
//! # Error Taxonomy
//!
//! disk-defrag uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `defrag-types` | Byte-level decode failures (short buffers, bad fields) |
//! | Runtime | `DefragError` | `defrag-error` (this crate) | Errors surfaced by the pipeline |
//!
//! `defrag-error` does not depend on `defrag-types`. The conversion from
//! `ParseError` into `DefragError` lives in `defrag-core`, which sees both and
//! can attach the block number being processed.
//!
//! | Where | ParseError Variant | DefragError Variant |
//! |-------|--------------------|---------------------|
//! | Superblock and geometry | `InsufficientData` | `Format` |
//! | Superblock and geometry | `InvalidField` on a region field or the data block count | `InvalidGeometry` |
//! | Superblock and geometry | `InvalidField` on any other field | `Format` |
//! | Superblock and geometry | `IntegerConversion` | `InvalidGeometry` |
//! | Inode records | any | `Parse` |
//! | Pointers and indirect blocks | any | `Corruption` with the block number |
//!
//! Exhausting the data region while relocating yields `NoSpace`. File I/O
//! is the caller's concern; the CLI reports it through `anyhow`. Every error
//! is fatal to a run. Nothing is written to the output path until the whole
//! transformation has succeeded.

use thiserror::Error;

/// Unified error type for defragmentation runs.
#[derive(Debug, Error)]
pub enum DefragError {
    /// A pointer or indirect block reached during relocation is unusable.
    ///
    /// `block` is the data-relative index of the block being processed, or
    /// the out-of-range pointer value itself.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image does not have the expected superblock layout.
    #[error("invalid image format: {0}")]
    Format(String),

    /// Parse-layer error without block context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Region offsets or block size are inconsistent with the image.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Live blocks do not fit between the data and swap regions.
    #[error("no space left in data region: need {needed} blocks, have {available}")]
    NoSpace { needed: u64, available: u64 },
}

impl DefragError {
    /// Whether this error points at damaged image contents rather than the
    /// superblock geometry.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. } | Self::NoSpace { .. })
    }
}

/// Result alias using `DefragError`.
pub type Result<T> = std::result::Result<T, DefragError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = DefragError::Corruption {
            block: 42,
            detail: "pointer past swap region".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 42: pointer past swap region"
        );

        let space = DefragError::NoSpace {
            needed: 10,
            available: 8,
        };
        assert_eq!(
            space.to_string(),
            "no space left in data region: need 10 blocks, have 8"
        );

        let geom = DefragError::InvalidGeometry("block_size=0".into());
        assert_eq!(geom.to_string(), "invalid geometry: block_size=0");

        let fmt = DefragError::Format("image shorter than superblock".into());
        assert!(fmt.to_string().starts_with("invalid image format:"));

        let parse = DefragError::Parse("insufficient data".into());
        assert!(parse.to_string().contains("parse error:"));
    }

    #[test]
    fn corruption_classification() {
        assert!(
            DefragError::Corruption {
                block: 1,
                detail: String::new(),
            }
            .is_corruption()
        );
        assert!(
            DefragError::NoSpace {
                needed: 1,
                available: 0,
            }
            .is_corruption()
        );
        assert!(!DefragError::Format("x".into()).is_corruption());
        assert!(!DefragError::InvalidGeometry("x".into()).is_corruption());
        assert!(!DefragError::Parse("x".into()).is_corruption());
    }
}
