#![forbid(unsafe_code)]
//! On-disk format parsing for defrag images.
//!
//! Pure parsing crate, no I/O. Decodes and encodes the superblock, inode
//! records and indirect pointer blocks over bounds-checked byte slices, and
//! derives byte-level region geometry from the superblock.

pub mod indirect;
pub mod inode;
pub mod layout;
pub mod superblock;

pub use indirect::{IndirectBlock, write_pointer};
pub use inode::Inode;
pub use layout::ImageLayout;
pub use superblock::Superblock;
