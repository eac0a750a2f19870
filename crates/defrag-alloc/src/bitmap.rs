#![forbid(unsafe_code)]
//! Bit manipulation over plain byte slices, one bit per data block.

/// Allocate a zeroed bitmap large enough for `count` bits.
#[must_use]
pub fn bitmap_new(count: u32) -> Vec<u8> {
    vec![0_u8; count.div_ceil(8) as usize]
}

/// Set bit `idx`, returning whether it was already set.
pub fn bitmap_test_and_set(bitmap: &mut [u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    let was_set = (bitmap[byte_idx] >> bit_idx) & 1 == 1;
    bitmap[byte_idx] |= 1 << bit_idx;
    was_set
}
