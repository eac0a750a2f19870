#![forbid(unsafe_code)]

use defrag_types::{
    BlockPtr, ParseError, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, ensure_slice, read_le_i32, read_ptr,
    write_ptr,
};
use serde::{Deserialize, Serialize};

const SB_BLOCK_SIZE: usize = 0x00;
const SB_INODE_OFFSET: usize = 0x04;
const SB_DATA_OFFSET: usize = 0x08;
const SB_SWAP_OFFSET: usize = 0x0C;
const SB_FREE_INODE: usize = 0x10;
const SB_FREE_BLOCK: usize = 0x14;

/// Image superblock.
///
/// Region offsets are in blocks, counted from the end of the superblock.
/// Only the leading 24 bytes carry fields; the rest of the 512-byte region
/// is left untouched by every writer in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub block_size: i32,
    pub inode_offset: i32,
    pub data_offset: i32,
    pub swap_offset: i32,
    /// Head of the free-inode list. Carried through unchanged.
    pub free_inode: i32,
    /// Head of the free-block list, data-region relative.
    pub free_block: BlockPtr,
}

impl Superblock {
    /// Parse the fields from a superblock region (at least 24 bytes).
    pub fn parse_from_bytes(region: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            block_size: read_le_i32(region, SB_BLOCK_SIZE)?,
            inode_offset: read_le_i32(region, SB_INODE_OFFSET)?,
            data_offset: read_le_i32(region, SB_DATA_OFFSET)?,
            swap_offset: read_le_i32(region, SB_SWAP_OFFSET)?,
            free_inode: read_le_i32(region, SB_FREE_INODE)?,
            free_block: read_ptr(region, SB_FREE_BLOCK)?,
        })
    }

    /// Parse the superblock out of a whole image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        Self::parse_from_bytes(region)
    }

    /// Rewrite the free-block head in an image's superblock.
    pub fn write_free_block(image: &mut [u8], head: BlockPtr) -> Result<(), ParseError> {
        write_ptr(image, SUPERBLOCK_OFFSET + SB_FREE_BLOCK, head)
    }
}
