#![forbid(unsafe_code)]
//! Free-block list rebuild and traversal.
//!
//! The free list is threaded through the blocks themselves: the first
//! pointer of each free block holds the index of the next one, the last
//! holds the sentinel, and every other byte is zero.

use crate::bitmap::{bitmap_new, bitmap_test_and_set};
use crate::corruption;
use defrag_error::{DefragError, Result};
use defrag_ondisk::{ImageLayout, Superblock};
use defrag_types::{BlockPtr, DataBlock, read_ptr, write_ptr};
use serde::Serialize;
use tracing::debug;

/// Summary of a rebuilt free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeList {
    /// Head as stored in the superblock (sentinel when empty).
    pub head: BlockPtr,
    pub len: u32,
}

/// Rewrite every block in `first_free..swap` as a linked free list and point
/// the superblock's free-block head at it.
///
/// When the data region is fully packed nothing inside the data region is
/// written and the head becomes the sentinel.
pub fn build_free_list(
    image: &mut [u8],
    layout: &ImageLayout,
    first_free: DataBlock,
) -> Result<FreeList> {
    let end = layout.data_block_count();
    let Some(len) = end.checked_sub(first_free.0) else {
        return Err(DefragError::NoSpace {
            needed: u64::from(first_free),
            available: u64::from(end),
        });
    };

    for idx in first_free.0..end {
        let block = DataBlock(idx);
        let next = if idx + 1 < end {
            block.next().to_ptr().map_err(|err| corruption(block, &err))?
        } else {
            BlockPtr::NONE
        };
        let bytes = layout
            .data_block_mut(image, block)
            .map_err(|err| corruption(block, &err))?;
        bytes.fill(0);
        write_ptr(bytes, 0, next).map_err(|err| corruption(block, &err))?;
    }

    let head = if len == 0 {
        BlockPtr::NONE
    } else {
        first_free.to_ptr().map_err(|err| corruption(first_free, &err))?
    };
    Superblock::write_free_block(image, head)
        .map_err(|err| DefragError::Format(format!("cannot update superblock: {err}")))?;

    debug!(head = %head, len, "free list rebuilt");
    Ok(FreeList { head, len })
}

/// Follow the free list from the superblock head, returning the visited
/// blocks in list order. Fails on out-of-range links and cycles.
pub fn walk_free_list(image: &[u8], layout: &ImageLayout) -> Result<Vec<DataBlock>> {
    let sb = Superblock::parse_from_image(image)
        .map_err(|err| DefragError::Format(format!("cannot read superblock: {err}")))?;
    let count = layout.data_block_count();
    let mut visited = bitmap_new(count);
    let mut out = Vec::new();

    let mut cursor = sb.free_block;
    while let Some(block) = cursor
        .target()
        .map_err(|err| DefragError::Corruption {
            block: out.last().map_or(0, |b: &DataBlock| u64::from(*b)),
            detail: err.to_string(),
        })?
    {
        if !layout.contains(block) {
            return Err(DefragError::Corruption {
                block: u64::from(block),
                detail: "free list link points past the data region".to_owned(),
            });
        }
        if bitmap_test_and_set(&mut visited, block.0) {
            return Err(DefragError::Corruption {
                block: u64::from(block),
                detail: "free list contains a cycle".to_owned(),
            });
        }
        out.push(block);
        let bytes = layout
            .data_block(image, block)
            .map_err(|err| corruption(block, &err))?;
        cursor = read_ptr(bytes, 0).map_err(|err| corruption(block, &err))?;
    }

    Ok(out)
}
