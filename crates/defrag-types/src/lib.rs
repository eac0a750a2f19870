#![forbid(unsafe_code)]
//! Layout constants and primitive types shared by every defrag crate.
//!
//! The image format is fixed: a 512-byte boot block, a 512-byte superblock,
//! then inode, data and swap regions whose offsets are stored in the
//! superblock as block counts relative to the end of the superblock. Every
//! on-disk integer is a little-endian `i32`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Image geometry ──────────────────────────────────────────────────────────

pub const BOOT_BLOCK_SIZE: usize = 512;
pub const SUPERBLOCK_OFFSET: usize = BOOT_BLOCK_SIZE;
pub const SUPERBLOCK_SIZE: usize = 512;

/// First byte after boot block + superblock. Region offsets count from here.
pub const REGION_BASE: usize = BOOT_BLOCK_SIZE + SUPERBLOCK_SIZE;

/// On-disk inode record size in bytes.
pub const INODE_SIZE: usize = 100;

/// Direct block pointers per inode.
pub const N_DBLOCKS: usize = 10;

/// Single-indirect block pointers per inode.
pub const N_IBLOCKS: usize = 4;

/// Width of every on-disk pointer.
pub const POINTER_SIZE: usize = 4;

/// Raw pointer value meaning "unused".
pub const SENTINEL: i32 = -1;

// ── Pointer types ───────────────────────────────────────────────────────────

/// Data-region-relative block index (block 0 is the first data block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataBlock(pub u32);

impl DataBlock {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Encode as a live on-disk pointer.
    pub fn to_ptr(self) -> Result<BlockPtr, ParseError> {
        i32::try_from(self.0)
            .map(BlockPtr)
            .map_err(|_| ParseError::IntegerConversion {
                field: "block_index",
            })
    }
}

/// Raw on-disk block pointer: either [`BlockPtr::NONE`] or a data-relative index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPtr(pub i32);

impl BlockPtr {
    pub const NONE: Self = Self(SENTINEL);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == SENTINEL
    }

    /// The referenced block, or `None` for the sentinel.
    ///
    /// Negative values other than the sentinel are rejected rather than
    /// silently treated as unused.
    pub fn target(self) -> Result<Option<DataBlock>, ParseError> {
        if self.is_none() {
            return Ok(None);
        }
        u32::try_from(self.0)
            .map(|idx| Some(DataBlock(idx)))
            .map_err(|_| ParseError::InvalidField {
                field: "block_pointer",
                reason: "negative pointer other than sentinel",
            })
    }
}

impl Default for BlockPtr {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<DataBlock> for u64 {
    fn from(block: DataBlock) -> Self {
        u64::from(block.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Checked byte access ─────────────────────────────────────────────────────

fn checked_end(data_len: usize, offset: usize, len: usize) -> Result<usize, ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data_len {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data_len.saturating_sub(offset),
        });
    }

    Ok(end)
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let end = checked_end(data.len(), offset, len)?;
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let end = checked_end(data.len(), offset, len)?;
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn read_ptr(data: &[u8], offset: usize) -> Result<BlockPtr, ParseError> {
    read_le_i32(data, offset).map(BlockPtr)
}

#[inline]
pub fn write_ptr(data: &mut [u8], offset: usize, ptr: BlockPtr) -> Result<(), ParseError> {
    write_le_i32(data, offset, ptr.0)
}

/// Convert a non-negative on-disk field into `usize`.
pub fn field_to_usize(value: i32, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("-")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
