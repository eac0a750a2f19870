#![forbid(unsafe_code)]
//! Block relocation engine.
//!
//! Relocation reads only from the source image and writes only to the
//! destination image, so a block can never be overwritten before it has
//! been read regardless of where the cursor lands.
//!
//! For an inode of depth `d` the engine first relocates everything at
//! depth `d - 1`, then the roots of tier `d` itself. Each root is copied to
//! the cursor slot, its new index is stored in the inode working copy and,
//! for indirect nodes, the children listed in the *source* node are
//! relocated depth-first with their new indices patched into the
//! *destination* node.

use defrag_alloc::BlockCursor;
use defrag_error::{DefragError, Result};
use defrag_inode::{Depth, resolve};
use defrag_ondisk::{ImageLayout, IndirectBlock, Inode, write_pointer};
use defrag_types::{BlockPtr, DataBlock, ParseError};
use serde::Serialize;
use tracing::trace;

/// Counters accumulated over a relocation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelocationStats {
    pub inodes: u64,
    pub data_blocks: u64,
    pub indirect_blocks: u64,
}

impl RelocationStats {
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.data_blocks + self.indirect_blocks
    }
}

fn block_error(block: DataBlock, err: &ParseError) -> DefragError {
    DefragError::Corruption {
        block: u64::from(block),
        detail: err.to_string(),
    }
}

/// Copies block trees from `source` into `dest`.
pub struct Relocator<'a> {
    source: &'a [u8],
    dest: &'a mut [u8],
    layout: &'a ImageLayout,
    stats: RelocationStats,
}

impl<'a> Relocator<'a> {
    /// `dest` must be the same length as `source`.
    pub fn new(source: &'a [u8], dest: &'a mut [u8], layout: &'a ImageLayout) -> Result<Self> {
        if source.len() != dest.len() {
            return Err(DefragError::InvalidGeometry(format!(
                "destination is {} bytes, source is {}",
                dest.len(),
                source.len()
            )));
        }
        Ok(Self {
            source,
            dest,
            layout,
            stats: RelocationStats::default(),
        })
    }

    #[must_use]
    pub fn stats(&self) -> RelocationStats {
        self.stats
    }

    /// Relocate every tier up to `depth`, rewriting the root pointers of
    /// `inode` in place. `inode` is a private working copy; neither image
    /// holds it until [`Relocator::commit_inode`].
    pub fn relocate_inode(
        &mut self,
        inode: &mut Inode,
        depth: Depth,
        cursor: &mut BlockCursor,
    ) -> Result<()> {
        if let Some(shallower) = depth.shallower() {
            self.relocate_inode(inode, shallower, cursor)?;
        }

        let level = depth.node_level();
        for root in depth.roots_mut(inode) {
            let Some(old) = resolve(*root, self.layout, None)? else {
                continue;
            };
            let new = self.relocate_tree(old, level, cursor)?;
            *root = new.to_ptr().map_err(|err| block_error(new, &err))?;
        }
        Ok(())
    }

    /// Write the rewritten inode to its unchanged address in the destination.
    pub fn commit_inode(&mut self, inode: &Inode, addr: usize) -> Result<()> {
        inode
            .write_at(self.dest, addr)
            .map_err(|err| DefragError::Parse(format!("inode at byte {addr}: {err}")))?;
        self.stats.inodes += 1;
        Ok(())
    }

    /// Copy block `old` (an indirect node when `level > 0`) and its whole
    /// subtree, returning the block's new index.
    fn relocate_tree(
        &mut self,
        old: DataBlock,
        level: u8,
        cursor: &mut BlockCursor,
    ) -> Result<DataBlock> {
        let new = cursor.allocate()?;
        let source = self.source;
        let src = self
            .layout
            .data_block(source, old)
            .map_err(|err| block_error(old, &err))?;
        self.layout
            .data_block_mut(self.dest, new)
            .map_err(|err| block_error(new, &err))?
            .copy_from_slice(src);
        trace!(old = old.0, new = new.0, level, "block copied");

        if level == 0 {
            self.stats.data_blocks += 1;
            return Ok(new);
        }
        self.stats.indirect_blocks += 1;

        for (slot, ptr) in IndirectBlock::new(src).live() {
            let Some(child) = resolve(ptr, self.layout, Some(old))? else {
                continue;
            };
            let child_new = self.relocate_tree(child, level - 1, cursor)?;
            let link: BlockPtr = child_new
                .to_ptr()
                .map_err(|err| block_error(child_new, &err))?;
            let node = self
                .layout
                .data_block_mut(self.dest, new)
                .map_err(|err| block_error(new, &err))?;
            write_pointer(node, slot, link).map_err(|err| block_error(new, &err))?;
        }
        Ok(new)
    }
}
