#![forbid(unsafe_code)]

use crate::Superblock;
use defrag_types::{
    DataBlock, INODE_SIZE, POINTER_SIZE, ParseError, REGION_BASE, ensure_slice, ensure_slice_mut,
    field_to_usize,
};
use serde::{Deserialize, Serialize};

/// Byte-level geometry derived from a superblock and the image length.
///
/// Invariants, checked once in [`ImageLayout::from_superblock`]:
/// `block_size` is a positive multiple of the pointer width,
/// `inode_offset <= data_offset <= swap_offset`, and the swap region starts
/// inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayout {
    pub block_size: usize,
    pub inode_offset: usize,
    pub data_offset: usize,
    pub swap_offset: usize,
    pub image_len: usize,
}

impl ImageLayout {
    pub fn from_superblock(sb: &Superblock, image_len: usize) -> Result<Self, ParseError> {
        let block_size = field_to_usize(sb.block_size, "block_size")?;
        if block_size == 0 || block_size % POINTER_SIZE != 0 {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a positive multiple of 4",
            });
        }

        let layout = Self {
            block_size,
            inode_offset: field_to_usize(sb.inode_offset, "inode_offset")?,
            data_offset: field_to_usize(sb.data_offset, "data_offset")?,
            swap_offset: field_to_usize(sb.swap_offset, "swap_offset")?,
            image_len,
        };

        if layout.inode_offset > layout.data_offset {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "data region precedes inode region",
            });
        }
        if layout.data_offset > layout.swap_offset {
            return Err(ParseError::InvalidField {
                field: "swap_offset",
                reason: "swap region precedes data region",
            });
        }
        let swap_start = layout
            .swap_offset
            .checked_mul(block_size)
            .and_then(|bytes| bytes.checked_add(REGION_BASE))
            .ok_or(ParseError::IntegerConversion {
                field: "swap_offset",
            })?;
        if swap_start > image_len {
            return Err(ParseError::InvalidField {
                field: "swap_offset",
                reason: "swap region starts past end of image",
            });
        }
        if u32::try_from(layout.swap_offset - layout.data_offset).is_err() {
            return Err(ParseError::IntegerConversion {
                field: "data_block_count",
            });
        }

        Ok(layout)
    }

    /// Byte address of a region that starts `offset_blocks` after the superblock.
    #[must_use]
    pub fn region_start(&self, offset_blocks: usize) -> usize {
        REGION_BASE + offset_blocks * self.block_size
    }

    #[must_use]
    pub fn inode_region_start(&self) -> usize {
        self.region_start(self.inode_offset)
    }

    #[must_use]
    pub fn data_region_start(&self) -> usize {
        self.region_start(self.data_offset)
    }

    #[must_use]
    pub fn swap_region_start(&self) -> usize {
        self.region_start(self.swap_offset)
    }

    /// Number of inode records in the inode region (partial tail ignored).
    #[must_use]
    pub fn inode_slot_count(&self) -> usize {
        (self.data_offset - self.inode_offset) * self.block_size / INODE_SIZE
    }

    #[must_use]
    pub fn inode_addr(&self, slot: usize) -> usize {
        self.inode_region_start() + slot * INODE_SIZE
    }

    /// Blocks between the start of the data region and the swap region.
    #[must_use]
    pub fn data_block_count(&self) -> u32 {
        // Range checked in from_superblock.
        u32::try_from(self.swap_offset - self.data_offset).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn contains(&self, block: DataBlock) -> bool {
        block.0 < self.data_block_count()
    }

    pub fn data_block_addr(&self, block: DataBlock) -> Result<usize, ParseError> {
        if !self.contains(block) {
            return Err(ParseError::InvalidField {
                field: "block_pointer",
                reason: "points past the data region",
            });
        }
        let idx = usize::try_from(block.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_pointer",
        })?;
        Ok(self.data_region_start() + idx * self.block_size)
    }

    pub fn data_block<'a>(&self, image: &'a [u8], block: DataBlock) -> Result<&'a [u8], ParseError> {
        ensure_slice(image, self.data_block_addr(block)?, self.block_size)
    }

    pub fn data_block_mut<'a>(
        &self,
        image: &'a mut [u8],
        block: DataBlock,
    ) -> Result<&'a mut [u8], ParseError> {
        ensure_slice_mut(image, self.data_block_addr(block)?, self.block_size)
    }
}
