#![forbid(unsafe_code)]
//! Read-only traversal of an inode's block tree.
//!
//! The walk visits blocks in exactly the order the relocation engine packs
//! them: all direct blocks, then each single-indirect subtree, then the
//! double-indirect subtree, then the triple-indirect subtree. Inside a
//! subtree a node is visited before its children, children left to right.

use defrag_error::{DefragError, Result};
use defrag_ondisk::{ImageLayout, IndirectBlock, Inode};
use defrag_types::{BlockPtr, DataBlock};
use serde::{Deserialize, Serialize};

/// Deepest indirection tier an inode uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Depth {
    Direct,
    Single,
    Double,
    Triple,
}

impl Depth {
    pub const ALL: [Self; 4] = [Self::Direct, Self::Single, Self::Double, Self::Triple];

    /// Pick the depth from the inode's root pointers.
    ///
    /// Checked in order: triple, double, first single-indirect, first direct.
    /// An inode whose checked pointers are all unset has nothing to relocate.
    #[must_use]
    pub fn for_inode(inode: &Inode) -> Option<Self> {
        if !inode.i3block.is_none() {
            Some(Self::Triple)
        } else if !inode.i2block.is_none() {
            Some(Self::Double)
        } else if !inode.iblocks[0].is_none() {
            Some(Self::Single)
        } else if !inode.dblocks[0].is_none() {
            Some(Self::Direct)
        } else {
            None
        }
    }

    /// The next tier towards the inode, `None` for direct blocks.
    #[must_use]
    pub fn shallower(self) -> Option<Self> {
        match self {
            Self::Direct => None,
            Self::Single => Some(Self::Direct),
            Self::Double => Some(Self::Single),
            Self::Triple => Some(Self::Double),
        }
    }

    /// Indirection level of the nodes the inode points at for this tier
    /// (0 means the pointer targets a data block).
    #[must_use]
    pub fn node_level(self) -> u8 {
        match self {
            Self::Direct => 0,
            Self::Single => 1,
            Self::Double => 2,
            Self::Triple => 3,
        }
    }

    /// Root pointers the inode holds for this tier, in slot order.
    #[must_use]
    pub fn roots(self, inode: &Inode) -> &[BlockPtr] {
        match self {
            Self::Direct => &inode.dblocks[..],
            Self::Single => &inode.iblocks[..],
            Self::Double => std::slice::from_ref(&inode.i2block),
            Self::Triple => std::slice::from_ref(&inode.i3block),
        }
    }

    /// Mutable access to the same root pointers.
    pub fn roots_mut(self, inode: &mut Inode) -> &mut [BlockPtr] {
        match self {
            Self::Direct => &mut inode.dblocks[..],
            Self::Single => &mut inode.iblocks[..],
            Self::Double => std::slice::from_mut(&mut inode.i2block),
            Self::Triple => std::slice::from_mut(&mut inode.i3block),
        }
    }

    /// Tiers processed for this depth, shallowest first.
    pub fn tiers(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |tier| *tier <= self)
    }
}

/// One block reached during a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeBlock {
    pub block: DataBlock,
    /// 0 for data blocks, 1 to 3 for indirect nodes.
    pub level: u8,
}

impl TreeBlock {
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.level == 0
    }
}

/// Resolve a pointer found inside `parent` (or the inode when `None`).
pub fn resolve(
    ptr: BlockPtr,
    layout: &ImageLayout,
    parent: Option<DataBlock>,
) -> Result<Option<DataBlock>> {
    let owner = parent.map_or(0, u64::from);
    let Some(block) = ptr.target().map_err(|err| DefragError::Corruption {
        block: owner,
        detail: err.to_string(),
    })?
    else {
        return Ok(None);
    };
    if !layout.contains(block) {
        return Err(DefragError::Corruption {
            block: u64::from(block),
            detail: format!(
                "pointer beyond data region ({} blocks)",
                layout.data_block_count()
            ),
        });
    }
    Ok(Some(block))
}

/// Visit every block reachable from `inode`, in packing order.
pub fn walk_inode<F>(image: &[u8], layout: &ImageLayout, inode: &Inode, mut visit: F) -> Result<()>
where
    F: FnMut(TreeBlock),
{
    let Some(depth) = Depth::for_inode(inode) else {
        return Ok(());
    };
    for tier in depth.tiers() {
        for ptr in tier.roots(inode) {
            if let Some(block) = resolve(*ptr, layout, None)? {
                walk_subtree(image, layout, block, tier.node_level(), &mut visit)?;
            }
        }
    }
    Ok(())
}

fn walk_subtree<F>(
    image: &[u8],
    layout: &ImageLayout,
    block: DataBlock,
    level: u8,
    visit: &mut F,
) -> Result<()>
where
    F: FnMut(TreeBlock),
{
    visit(TreeBlock { block, level });
    if level == 0 {
        return Ok(());
    }
    let bytes = layout
        .data_block(image, block)
        .map_err(|err| DefragError::Corruption {
            block: u64::from(block),
            detail: err.to_string(),
        })?;
    for (_, ptr) in IndirectBlock::new(bytes).live() {
        if let Some(child) = resolve(ptr, layout, Some(block))? {
            walk_subtree(image, layout, child, level - 1, visit)?;
        }
    }
    Ok(())
}

/// Collect the walk into a vector.
pub fn inode_blocks(image: &[u8], layout: &ImageLayout, inode: &Inode) -> Result<Vec<TreeBlock>> {
    let mut out = Vec::new();
    walk_inode(image, layout, inode, |tb| out.push(tb))?;
    Ok(out)
}
