#![forbid(unsafe_code)]
//! Fragmentation metrics.
//!
//! A *break* is a pair of consecutive blocks in a file's packing order whose
//! indices are not adjacent. A freshly defragmented image has none.

use crate::{parse_error_at, read_geometry};
use defrag_error::Result;
use defrag_inode::{scan_live_inodes, walk_inode};
use defrag_ondisk::{ImageLayout, Inode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentationReport {
    /// Live inodes with at least one reachable block.
    pub files: u64,
    /// Data and indirect blocks reachable from live inodes.
    pub blocks: u64,
    /// Files with at least one break.
    pub fragmented_files: u64,
    pub breaks: u64,
}

impl FragmentationReport {
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.breaks == 0
    }
}

/// Measure fragmentation of a whole image.
pub fn analyze(image: &[u8]) -> Result<FragmentationReport> {
    let (_, layout) = read_geometry(image)?;
    analyze_layout(image, &layout)
}

pub(crate) fn analyze_layout(image: &[u8], layout: &ImageLayout) -> Result<FragmentationReport> {
    let live = scan_live_inodes(image, layout).map_err(|err| parse_error_at(&err, "inode scan"))?;
    let mut report = FragmentationReport::default();

    for loc in live {
        let inode = Inode::parse_at(image, loc.addr)
            .map_err(|err| parse_error_at(&err, "inode record"))?;
        let mut prev: Option<u32> = None;
        let mut blocks = 0_u64;
        let mut breaks = 0_u64;
        walk_inode(image, layout, &inode, |tb| {
            blocks += 1;
            if prev.is_some_and(|p| p.checked_add(1) != Some(tb.block.0)) {
                breaks += 1;
            }
            prev = Some(tb.block.0);
        })?;

        if blocks > 0 {
            report.files += 1;
        }
        report.blocks += blocks;
        report.breaks += breaks;
        if breaks > 0 {
            report.fragmented_files += 1;
        }
    }
    Ok(report)
}
