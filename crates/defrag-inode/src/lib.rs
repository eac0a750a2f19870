#![forbid(unsafe_code)]
//! Inode table scanning.
//!
//! Classifies every slot of the inode region by link count and yields the
//! live ones in ascending slot order. That order is the only placement
//! policy the defragmenter has: files are packed into the data region in
//! exactly the order this scan returns them.
//!
//! [`tree`] walks a single inode's block tree in packing order.

pub mod tree;

pub use tree::{Depth, TreeBlock, inode_blocks, resolve, walk_inode};

use defrag_ondisk::{ImageLayout, Inode};
use defrag_types::ParseError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Position of an inode record in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeLocation {
    /// Slot number within the inode region.
    pub index: usize,
    /// Absolute byte address of the record.
    pub addr: usize,
}

/// Iterate over every inode slot in the inode region, live or not.
pub fn iter_inodes(
    image: &[u8],
    layout: ImageLayout,
) -> impl Iterator<Item = Result<(InodeLocation, Inode), ParseError>> + '_ {
    (0..layout.inode_slot_count()).map(move |index| {
        let addr = layout.inode_addr(index);
        Inode::parse_at(image, addr).map(|inode| (InodeLocation { index, addr }, inode))
    })
}

/// Locations of all inodes with a positive link count, ascending by address.
pub fn scan_live_inodes(
    image: &[u8],
    layout: &ImageLayout,
) -> Result<Vec<InodeLocation>, ParseError> {
    let mut live = Vec::new();
    for entry in iter_inodes(image, *layout) {
        let (loc, inode) = entry?;
        if inode.is_live() {
            trace!(slot = loc.index, addr = loc.addr, nlink = inode.nlink, "live inode");
            live.push(loc);
        }
    }
    debug!(
        slots = layout.inode_slot_count(),
        live = live.len(),
        "inode scan complete"
    );
    Ok(live)
}
