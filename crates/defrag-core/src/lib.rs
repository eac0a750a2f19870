#![forbid(unsafe_code)]
//! Offline defragmentation of a disk image.
//!
//! [`defragment`] takes the raw bytes of an image and returns a new image in
//! which every live file's blocks occupy one contiguous run at the start of
//! the data region, in inode order, with all remaining data blocks chained
//! into a single ascending free list. The boot block, the inode region
//! (except pointer fields), and the swap region are carried over verbatim.
//!
//! The source buffer is never written. All output goes to a fresh buffer, so
//! an error at any point leaves nothing half-written for the caller.

pub mod analyze;
pub mod relocate;

pub use analyze::{FragmentationReport, analyze};
pub use defrag_error::{DefragError, Result};
pub use defrag_inode::Depth;
pub use relocate::{RelocationStats, Relocator};

use defrag_alloc::{BlockCursor, build_free_list};
use defrag_inode::scan_live_inodes;
use defrag_ondisk::{ImageLayout, Inode, Superblock};
use defrag_types::{BlockPtr, ParseError};
use serde::Serialize;
use tracing::{debug, info, warn};

// ── Error boundary ──────────────────────────────────────────────────────────

/// Convert a superblock or layout decode failure into a `DefragError`.
fn geometry_error(e: &ParseError) -> DefragError {
    match e {
        ParseError::InvalidField { field, reason } => {
            if matches!(
                *field,
                "block_size" | "inode_offset" | "data_offset" | "swap_offset" | "data_block_count"
            ) {
                DefragError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                DefragError::Format(e.to_string())
            }
        }
        ParseError::InsufficientData { .. } => {
            DefragError::Format(format!("image too small for superblock: {e}"))
        }
        ParseError::IntegerConversion { .. } => DefragError::InvalidGeometry(e.to_string()),
    }
}

/// Convert a decode failure with no block context.
pub(crate) fn parse_error_at(e: &ParseError, what: &str) -> DefragError {
    DefragError::Parse(format!("{what}: {e}"))
}

/// Decode the superblock and validate region geometry against the image size.
pub fn read_geometry(image: &[u8]) -> Result<(Superblock, ImageLayout)> {
    let sb = Superblock::parse_from_image(image).map_err(|e| geometry_error(&e))?;
    let layout = ImageLayout::from_superblock(&sb, image.len()).map_err(|e| geometry_error(&e))?;
    Ok((sb, layout))
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// Outcome of a defragmentation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefragReport {
    pub block_size: usize,
    pub inode_slots: usize,
    pub live_inodes: u64,
    pub inodes_relocated: u64,
    /// Live inodes with pointers whose first direct and first indirect
    /// slots are both unset. Their blocks are left where they are.
    pub inodes_skipped: u64,
    pub data_blocks: u64,
    pub indirect_blocks: u64,
    pub data_region_blocks: u32,
    pub free_blocks: u32,
    pub free_list_head: BlockPtr,
    pub before: FragmentationReport,
    pub after: FragmentationReport,
}

impl DefragReport {
    #[must_use]
    pub fn blocks_copied(&self) -> u64 {
        self.data_blocks + self.indirect_blocks
    }
}

/// A defragmented image together with its run report.
#[derive(Debug, Clone)]
pub struct Defragmented {
    pub image: Vec<u8>,
    pub report: DefragReport,
}

fn has_any_pointer(inode: &Inode) -> bool {
    inode
        .dblocks
        .iter()
        .chain(inode.iblocks.iter())
        .chain([&inode.i2block, &inode.i3block])
        .any(|ptr| !ptr.is_none())
}

/// Defragment `source`, returning the new image.
pub fn defragment(source: &[u8]) -> Result<Defragmented> {
    let (sb, layout) = read_geometry(source)?;
    debug!(
        block_size = sb.block_size,
        inode_offset = sb.inode_offset,
        data_offset = sb.data_offset,
        swap_offset = sb.swap_offset,
        "superblock"
    );

    let live =
        scan_live_inodes(source, &layout).map_err(|e| parse_error_at(&e, "inode scan"))?;

    let mut image = source.to_vec();
    let mut cursor = BlockCursor::new(layout.data_block_count());
    let mut skipped = 0_u64;
    let mut relocated = 0_u64;

    let stats = {
        let mut relocator = Relocator::new(source, &mut image, &layout)?;
        for loc in &live {
            let mut inode = Inode::parse_at(source, loc.addr)
                .map_err(|e| parse_error_at(&e, "inode record"))?;
            let Some(depth) = Depth::for_inode(&inode) else {
                if has_any_pointer(&inode) {
                    warn!(
                        slot = loc.index,
                        "inode has blocks but no first direct or indirect pointer; left in place"
                    );
                    skipped += 1;
                }
                continue;
            };

            let start = cursor.position();
            relocator.relocate_inode(&mut inode, depth, &mut cursor)?;
            relocator.commit_inode(&inode, loc.addr)?;
            relocated += 1;
            debug!(
                slot = loc.index,
                ?depth,
                first = start.0,
                blocks = cursor.position().0 - start.0,
                "inode relocated"
            );
        }
        relocator.stats()
    };

    // Every source tree fit in the cursor, so this walk is bounded by the
    // data region size.
    let before = analyze::analyze_layout(source, &layout)?;
    let free = build_free_list(&mut image, &layout, cursor.position())?;
    let after = analyze::analyze_layout(&image, &layout)?;

    let report = DefragReport {
        block_size: layout.block_size,
        inode_slots: layout.inode_slot_count(),
        live_inodes: u64::try_from(live.len()).unwrap_or(u64::MAX),
        inodes_relocated: relocated,
        inodes_skipped: skipped,
        data_blocks: stats.data_blocks,
        indirect_blocks: stats.indirect_blocks,
        data_region_blocks: layout.data_block_count(),
        free_blocks: free.len,
        free_list_head: free.head,
        before,
        after,
    };
    info!(
        live = report.live_inodes,
        relocated = report.inodes_relocated,
        skipped = report.inodes_skipped,
        copied = report.blocks_copied(),
        free = report.free_blocks,
        breaks_before = before.breaks,
        "defragmentation complete"
    );
    Ok(Defragmented { image, report })
}
