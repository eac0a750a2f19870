#![forbid(unsafe_code)]
//! Block placement for the defragmented image.
//!
//! ## Design
//!
//! Allocation in a defragmentation pass is strictly sequential, so the
//! allocator is layered very thinly:
//!
//! 1. **Bitmap**: raw bit manipulation used for visited/used sets.
//! 2. **BlockCursor**: the single monotonic "next free destination block"
//!    shared by every inode of a run.
//! 3. **Free list**: once relocation is done, every block between the cursor
//!    and the swap region is rethreaded into one linked free list.

pub mod bitmap;
pub mod freelist;

pub use freelist::{FreeList, build_free_list, walk_free_list};

use defrag_error::{DefragError, Result};
use defrag_types::{DataBlock, ParseError};
use serde::Serialize;

/// Map a parse failure inside a known data block to a corruption error.
pub(crate) fn corruption(block: DataBlock, err: &ParseError) -> DefragError {
    DefragError::Corruption {
        block: u64::from(block),
        detail: err.to_string(),
    }
}

// ── Block cursor ────────────────────────────────────────────────────────────

/// Monotonic destination-slot allocator.
///
/// Slots are handed out in ascending order; a slot is never returned twice
/// and the position never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockCursor {
    next: DataBlock,
    limit: u32,
}

impl BlockCursor {
    /// Cursor over `0..limit`, where `limit` is the data-region block count.
    #[must_use]
    pub fn new(limit: u32) -> Self {
        Self::starting_at(DataBlock(0), limit)
    }

    #[must_use]
    pub fn starting_at(start: DataBlock, limit: u32) -> Self {
        Self { next: start, limit }
    }

    /// Next slot that `allocate` will return.
    #[must_use]
    pub fn position(&self) -> DataBlock {
        self.next
    }

    pub fn allocate(&mut self) -> Result<DataBlock> {
        if self.next.0 >= self.limit {
            return Err(DefragError::NoSpace {
                needed: u64::from(self.next.0) + 1,
                available: u64::from(self.limit),
            });
        }
        let slot = self.next;
        self.next = slot.next();
        Ok(slot)
    }
}
