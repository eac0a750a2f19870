#![forbid(unsafe_code)]

use defrag_types::{BlockPtr, POINTER_SIZE, ParseError, write_ptr};

/// Read view of an indirect block: a dense array of `block_size / 4`
/// pointers. Levels 1 to 3 share this shape; only the meaning of the
/// children differs.
#[derive(Debug, Clone, Copy)]
pub struct IndirectBlock<'a> {
    bytes: &'a [u8],
}

impl<'a> IndirectBlock<'a> {
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// All slots in ascending order, sentinels included.
    pub fn iter(&self) -> impl Iterator<Item = (usize, BlockPtr)> + 'a {
        self.bytes
            .chunks_exact(POINTER_SIZE)
            .map(|chunk| BlockPtr(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
            .enumerate()
    }

    /// Non-sentinel slots in ascending order.
    pub fn live(&self) -> impl Iterator<Item = (usize, BlockPtr)> + 'a {
        self.iter().filter(|(_, ptr)| !ptr.is_none())
    }
}

/// Overwrite pointer `slot` inside an indirect block.
pub fn write_pointer(block: &mut [u8], slot: usize, ptr: BlockPtr) -> Result<(), ParseError> {
    let offset = slot
        .checked_mul(POINTER_SIZE)
        .ok_or(ParseError::InvalidField {
            field: "indirect_slot",
            reason: "overflow",
        })?;
    write_ptr(block, offset, ptr)
}
