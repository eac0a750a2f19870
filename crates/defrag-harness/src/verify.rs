#![forbid(unsafe_code)]
//! Post-run verification of a defragmented image against its source.
//!
//! Every check produces one [`CheckVerdict`]; a check that finds several
//! problems reports the first and the total count. Verification never
//! trusts the run's own report, it re-derives everything from the bytes.

use defrag_alloc::bitmap::{bitmap_new, bitmap_test_and_set};
use defrag_alloc::walk_free_list;
use defrag_error::{DefragError, Result};
use defrag_inode::{Depth, TreeBlock, inode_blocks, iter_inodes};
use defrag_ondisk::{ImageLayout, IndirectBlock, Inode, Superblock};
use defrag_types::{BlockPtr, DataBlock, ParseError, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Verdict for a single invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckVerdict {
    /// Invariant name, e.g. "dense_packing".
    pub check: String,
    pub passed: bool,
    /// First violation and count; empty on success.
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub verdicts: Vec<CheckVerdict>,
    pub passed: u64,
    pub failed: u64,
    /// Live blocks found in the output (data and indirect).
    pub live_blocks: u64,
    pub free_blocks: u64,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    /// Verdicts that failed.
    pub fn failures(&self) -> impl Iterator<Item = &CheckVerdict> {
        self.verdicts.iter().filter(|v| !v.passed)
    }

    fn record(&mut self, check: &str, findings: &Findings) {
        let passed = findings.count == 0;
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        let detail = match &findings.first {
            Some(first) if findings.count > 1 => {
                format!("{first} (and {} more)", findings.count - 1)
            }
            Some(first) => first.clone(),
            None => String::new(),
        };
        self.verdicts.push(CheckVerdict {
            check: check.to_owned(),
            passed,
            detail,
        });
    }
}

#[derive(Debug, Default)]
struct Findings {
    first: Option<String>,
    count: u64,
}

impl Findings {
    fn push(&mut self, detail: impl FnOnce() -> String) {
        if self.first.is_none() {
            self.first = Some(detail());
        }
        self.count += 1;
    }
}

fn decode_error(err: &ParseError) -> DefragError {
    DefragError::Parse(format!("verify: {err}"))
}

fn geometry(image: &[u8], which: &str) -> Result<(Superblock, ImageLayout)> {
    let sb = Superblock::parse_from_image(image)
        .map_err(|err| DefragError::Format(format!("{which} superblock: {err}")))?;
    let layout = ImageLayout::from_superblock(&sb, image.len())
        .map_err(|err| DefragError::InvalidGeometry(format!("{which}: {err}")))?;
    Ok((sb, layout))
}

fn pointers_of(inode: &Inode) -> impl Iterator<Item = BlockPtr> + '_ {
    inode
        .dblocks
        .iter()
        .chain(inode.iblocks.iter())
        .chain([&inode.i2block, &inode.i3block])
        .copied()
}

fn with_pointers_cleared(inode: &Inode) -> Inode {
    let mut masked = inode.clone();
    masked.dblocks = [BlockPtr::NONE; defrag_types::N_DBLOCKS];
    masked.iblocks = [BlockPtr::NONE; defrag_types::N_IBLOCKS];
    masked.i2block = BlockPtr::NONE;
    masked.i3block = BlockPtr::NONE;
    masked
}

fn level_histogram(blocks: &[TreeBlock]) -> [usize; 4] {
    let mut hist = [0; 4];
    for tb in blocks {
        hist[usize::from(tb.level.min(3))] += 1;
    }
    hist
}

/// Check `output` against `source` for every invariant a defragmentation run
/// must preserve.
///
/// Returns `Err` only when either image cannot be decoded at all.
pub fn verify_defragmented(source: &[u8], output: &[u8]) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    let (src_sb, layout) = geometry(source, "source")?;
    let (out_sb, out_layout) = geometry(output, "output")?;

    // Geometry and the untouched regions.
    let mut untouched = Findings::default();
    if source.len() != output.len() || layout != out_layout {
        untouched.push(|| "image length or region offsets differ".to_owned());
    }
    let same_header = Superblock {
        free_block: src_sb.free_block,
        ..out_sb
    };
    if same_header != src_sb {
        untouched.push(|| "superblock fields other than free_block changed".to_owned());
    }
    let sb_tail = SUPERBLOCK_OFFSET + 24..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE;
    for (name, range) in [
        ("boot block", 0..SUPERBLOCK_OFFSET),
        ("superblock padding", sb_tail),
        ("swap region", layout.swap_region_start()..source.len()),
    ] {
        if source.get(range.clone()) != output.get(range) {
            untouched.push(|| format!("{name} differs"));
        }
    }
    if untouched.count > 0 {
        report.record("untouched_regions", &untouched);
        return Ok(report);
    }

    let mut inode_fields = Findings::default();
    let mut shape = Findings::default();
    let mut packing = Findings::default();
    let mut integrity = Findings::default();
    let mut aliasing = Findings::default();

    let mut used = bitmap_new(layout.data_block_count());
    let mut expected_next = 0_u32;

    let sources = iter_inodes(source, layout);
    let outputs = iter_inodes(output, layout);
    for (src, out) in sources.zip(outputs) {
        let (loc, src_inode) = src.map_err(|err| decode_error(&err))?;
        let (_, out_inode) = out.map_err(|err| decode_error(&err))?;

        let relocated = src_inode.is_live() && Depth::for_inode(&src_inode).is_some();
        if !relocated {
            if src_inode != out_inode {
                inode_fields.push(|| format!("inode {} changed but was not relocated", loc.index));
            }
            continue;
        }
        if with_pointers_cleared(&src_inode) != with_pointers_cleared(&out_inode) {
            inode_fields.push(|| format!("inode {} metadata fields changed", loc.index));
        }
        let set_before = pointers_of(&src_inode).map(BlockPtr::is_none);
        let set_after = pointers_of(&out_inode).map(BlockPtr::is_none);
        if !set_before.eq(set_after) {
            inode_fields.push(|| format!("inode {} pointer slots changed occupancy", loc.index));
        }

        let old_tree = inode_blocks(source, &layout, &src_inode)?;
        let new_tree = match inode_blocks(output, &layout, &out_inode) {
            Ok(tree) => tree,
            Err(err) => {
                shape.push(|| format!("inode {}: output tree unreadable: {err}", loc.index));
                continue;
            }
        };
        if level_histogram(&old_tree) != level_histogram(&new_tree) {
            shape.push(|| {
                format!(
                    "inode {}: blocks per level {:?} became {:?}",
                    loc.index,
                    level_histogram(&old_tree),
                    level_histogram(&new_tree)
                )
            });
            continue;
        }

        let mut mapping: HashMap<u32, u32> = HashMap::with_capacity(old_tree.len());
        for (old, new) in old_tree.iter().zip(&new_tree) {
            if new.block.0 != expected_next {
                packing.push(|| {
                    format!(
                        "inode {}: block expected at {expected_next}, found at {}",
                        loc.index, new.block.0
                    )
                });
            }
            expected_next = new.block.0.saturating_add(1);
            if bitmap_test_and_set(&mut used, new.block.0) {
                aliasing.push(|| format!("block {} reached twice", new.block.0));
            }
            mapping.insert(old.block.0, new.block.0);
        }

        for (old, new) in old_tree.iter().zip(&new_tree) {
            let old_bytes = layout
                .data_block(source, old.block)
                .map_err(|err| decode_error(&err))?;
            let new_bytes = layout
                .data_block(output, new.block)
                .map_err(|err| decode_error(&err))?;
            if new.is_data() {
                if old_bytes != new_bytes {
                    integrity.push(|| {
                        format!("data block {} -> {} differs", old.block.0, new.block.0)
                    });
                }
                continue;
            }
            let old_ptrs = IndirectBlock::new(old_bytes).iter();
            let new_ptrs = IndirectBlock::new(new_bytes).iter();
            for ((slot, was), (_, now)) in old_ptrs.zip(new_ptrs) {
                let expected = match was.target() {
                    Ok(Some(block)) => mapping
                        .get(&block.0)
                        .map_or(was, |mapped| BlockPtr(i32::try_from(*mapped).unwrap_or(-1))),
                    _ => was,
                };
                if now != expected {
                    integrity.push(|| {
                        format!(
                            "indirect {} slot {slot}: expected {expected}, found {now}",
                            new.block.0
                        )
                    });
                }
            }
        }
    }

    report.record("untouched_regions", &untouched);
    report.record("inode_fields", &inode_fields);
    report.record("tree_shape", &shape);
    report.record("dense_packing", &packing);
    report.record("no_aliasing", &aliasing);
    report.record("copy_integrity", &integrity);
    report.live_blocks = u64::from(expected_next);

    let mut free = Findings::default();
    match walk_free_list(output, &layout) {
        Ok(list) => {
            report.free_blocks = u64::try_from(list.len()).unwrap_or(u64::MAX);
            let expected: Vec<DataBlock> =
                (expected_next..layout.data_block_count()).map(DataBlock).collect();
            if list != expected {
                free.push(|| {
                    format!(
                        "free list has {} blocks starting at {:?}, expected {} from {expected_next}",
                        list.len(),
                        list.first().map(|b| b.0),
                        expected.len()
                    )
                });
            }
            for block in &list {
                let dirty = layout
                    .data_block(output, *block)
                    .map_or(true, |bytes| bytes[4..].iter().any(|&b| b != 0));
                if dirty {
                    free.push(|| format!("free block {} has non-zero payload", block.0));
                }
            }
        }
        Err(err) => free.push(|| err.to_string()),
    }
    report.record("free_list", &free);

    Ok(report)
}
