#![forbid(unsafe_code)]
//! Synthetic image construction.
//!
//! [`SyntheticImage`] gives byte-level control (write a superblock, place an
//! inode, fill a block, lay out an indirect node). [`ImageBuilder`] sits on
//! top and turns a list of [`FileShape`]s into a populated image, scattering
//! blocks according to a [`Placement`].

use defrag_error::{DefragError, Result};
use defrag_ondisk::{ImageLayout, Inode, Superblock, write_pointer};
use defrag_types::{
    BlockPtr, DataBlock, INODE_SIZE, N_DBLOCKS, N_IBLOCKS, ParseError, REGION_BASE,
    SUPERBLOCK_OFFSET, write_le_i32,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const BOOT_FILL: u8 = 0xB0;
const SWAP_FILL: u8 = 0x5A;
const STALE_FILL: u8 = 0xEE;

fn fixture_error(err: &ParseError) -> DefragError {
    DefragError::Parse(format!("fixture: {err}"))
}

/// Region sizes of a synthetic image, all in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: usize,
    pub inode_blocks: usize,
    pub data_blocks: usize,
    pub swap_blocks: usize,
}

impl Geometry {
    #[must_use]
    pub fn new(block_size: usize, inode_blocks: usize, data_blocks: usize, swap_blocks: usize) -> Self {
        Self {
            block_size,
            inode_blocks,
            data_blocks,
            swap_blocks,
        }
    }

    #[must_use]
    pub fn image_len(&self) -> usize {
        REGION_BASE + (self.inode_blocks + self.data_blocks + self.swap_blocks) * self.block_size
    }

    #[must_use]
    pub fn inode_slots(&self) -> usize {
        self.inode_blocks * self.block_size / INODE_SIZE
    }

    #[must_use]
    pub fn pointers_per_block(&self) -> usize {
        self.block_size / 4
    }

    fn superblock(&self, free_block: BlockPtr) -> Result<Superblock> {
        let field = |value: usize, name: &str| {
            i32::try_from(value)
                .map_err(|_| DefragError::InvalidGeometry(format!("{name} {value} exceeds i32")))
        };
        Ok(Superblock {
            block_size: field(self.block_size, "block_size")?,
            inode_offset: 0,
            data_offset: field(self.inode_blocks, "data_offset")?,
            swap_offset: field(self.inode_blocks + self.data_blocks, "swap_offset")?,
            free_inode: 0,
            free_block,
        })
    }
}

/// A raw image under construction.
#[derive(Debug, Clone)]
pub struct SyntheticImage {
    pub bytes: Vec<u8>,
    pub layout: ImageLayout,
}

impl SyntheticImage {
    /// Blank image: recognizable boot and swap fill, all inode slots dead,
    /// every data block filled with stale bytes, empty free list.
    pub fn new(geometry: Geometry) -> Result<Self> {
        let sb = geometry.superblock(BlockPtr::NONE)?;
        let len = geometry.image_len();
        let layout = ImageLayout::from_superblock(&sb, len)
            .map_err(|err| DefragError::InvalidGeometry(err.to_string()))?;

        let mut bytes = vec![0_u8; len];
        bytes[..SUPERBLOCK_OFFSET].fill(BOOT_FILL);
        bytes[layout.data_region_start()..layout.swap_region_start()].fill(STALE_FILL);
        bytes[layout.swap_region_start()..].fill(SWAP_FILL);

        let mut image = Self { bytes, layout };
        image.write_superblock(&sb)?;
        Ok(image)
    }

    pub fn write_superblock(&mut self, sb: &Superblock) -> Result<()> {
        let fields = [
            sb.block_size,
            sb.inode_offset,
            sb.data_offset,
            sb.swap_offset,
            sb.free_inode,
            sb.free_block.0,
        ];
        for (i, value) in fields.into_iter().enumerate() {
            write_le_i32(&mut self.bytes, SUPERBLOCK_OFFSET + i * 4, value)
                .map_err(|err| fixture_error(&err))?;
        }
        Ok(())
    }

    pub fn set_free_head(&mut self, head: BlockPtr) -> Result<()> {
        Superblock::write_free_block(&mut self.bytes, head).map_err(|err| fixture_error(&err))
    }

    pub fn set_inode(&mut self, slot: usize, inode: &Inode) -> Result<()> {
        if slot >= self.layout.inode_slot_count() {
            return Err(DefragError::InvalidGeometry(format!(
                "inode slot {slot} outside {} slots",
                self.layout.inode_slot_count()
            )));
        }
        inode
            .write_at(&mut self.bytes, self.layout.inode_addr(slot))
            .map_err(|err| fixture_error(&err))
    }

    pub fn inode(&self, slot: usize) -> Result<Inode> {
        Inode::parse_at(&self.bytes, self.layout.inode_addr(slot)).map_err(|err| fixture_error(&err))
    }

    /// Fill a data block with a pattern unique to `tag`.
    pub fn fill_block(&mut self, block: u32, tag: u32) -> Result<()> {
        let bytes = self
            .layout
            .data_block_mut(&mut self.bytes, DataBlock(block))
            .map_err(|err| fixture_error(&err))?;
        for (word, chunk) in bytes.chunks_exact_mut(4).enumerate() {
            #[expect(clippy::cast_possible_truncation)] // word < block_size / 4
            let value = tag.rotate_left(7) ^ (word as u32).wrapping_mul(0x9E37_79B9);
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Lay out an indirect node: every slot the sentinel except `children`.
    pub fn write_indirect(&mut self, node: u32, children: &[(usize, u32)]) -> Result<()> {
        let bytes = self
            .layout
            .data_block_mut(&mut self.bytes, DataBlock(node))
            .map_err(|err| fixture_error(&err))?;
        bytes.fill(0xFF);
        for &(slot, child) in children {
            let ptr = DataBlock(child).to_ptr().map_err(|err| fixture_error(&err))?;
            write_pointer(bytes, slot, ptr).map_err(|err| fixture_error(&err))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn block(&self, block: u32) -> Option<&[u8]> {
        self.layout.data_block(&self.bytes, DataBlock(block)).ok()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block tree of one file.
///
/// `single` lists leaf counts per single-indirect root (at most four),
/// `double` lists leaf counts per level-1 node under the double-indirect
/// root, and `triple` nests one more level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileShape {
    pub direct: usize,
    pub single: Vec<usize>,
    pub double: Option<Vec<usize>>,
    pub triple: Option<Vec<Vec<usize>>>,
    /// Spread children over every other pointer slot.
    pub holes: bool,
}

impl FileShape {
    #[must_use]
    pub fn direct(count: usize) -> Self {
        Self {
            direct: count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_single(mut self, leaves: &[usize]) -> Self {
        self.single = leaves.to_vec();
        self
    }

    #[must_use]
    pub fn with_double(mut self, leaves: &[usize]) -> Self {
        self.double = Some(leaves.to_vec());
        self
    }

    #[must_use]
    pub fn with_triple(mut self, leaves: &[Vec<usize>]) -> Self {
        self.triple = Some(leaves.to_vec());
        self
    }

    #[must_use]
    pub fn with_holes(mut self) -> Self {
        self.holes = true;
        self
    }

    /// Data blocks reachable from the file.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.direct
            + self.single.iter().sum::<usize>()
            + self.double.iter().flatten().sum::<usize>()
            + self.triple.iter().flatten().flatten().sum::<usize>()
    }

    /// Data plus indirect blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        let double_nodes = self.double.as_ref().map_or(0, |d| 1 + d.len());
        let triple_nodes = self
            .triple
            .as_ref()
            .map_or(0, |t| 1 + t.len() + t.iter().map(Vec::len).sum::<usize>());
        self.leaf_count() + self.single.len() + double_nodes + triple_nodes
    }

    /// Random shape touching every tier up to `max_level`.
    pub fn random<R: Rng>(rng: &mut R, max_level: u8, fanout: usize) -> Self {
        let fanout = fanout.max(1);
        let mut shape = Self::direct(rng.gen_range(1..=N_DBLOCKS));
        if max_level >= 1 {
            let roots = rng.gen_range(1..=N_IBLOCKS);
            shape.single = (0..roots).map(|_| rng.gen_range(0..=fanout)).collect();
        }
        if max_level >= 2 {
            let nodes = rng.gen_range(1..=fanout);
            shape.double = Some((0..nodes).map(|_| rng.gen_range(1..=fanout)).collect());
        }
        if max_level >= 3 {
            let mids = rng.gen_range(1..=fanout.min(3));
            shape.triple = Some(
                (0..mids)
                    .map(|_| {
                        let nodes = rng.gen_range(1..=fanout.min(3));
                        (0..nodes).map(|_| rng.gen_range(1..=fanout)).collect()
                    })
                    .collect(),
            );
        }
        shape.holes = rng.gen_bool(0.25);
        shape
    }
}

/// How the builder chooses source block indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Blocks in packing order; the image is already defragmented.
    Sequential,
    /// Packing order laid out from the end of the data region backwards.
    Reversed,
    /// A seeded random permutation of the data region.
    Shuffled { seed: u64 },
    /// Exact indices, consumed in packing order.
    Explicit(Vec<u32>),
}

/// Builds a [`SyntheticImage`] populated with files.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    geometry: Geometry,
    files: Vec<(usize, FileShape)>,
    placement: Placement,
    free_head: Option<u32>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            files: Vec::new(),
            placement: Placement::Sequential,
            free_head: None,
        }
    }

    /// Add a file in the next unused inode slot.
    #[must_use]
    pub fn file(mut self, shape: FileShape) -> Self {
        let slot = self.files.last().map_or(0, |(slot, _)| slot + 1);
        self.files.push((slot, shape));
        self
    }

    /// Add a file at a specific inode slot (leaving dead slots in between).
    #[must_use]
    pub fn file_at(mut self, slot: usize, shape: FileShape) -> Self {
        self.files.push((slot, shape));
        self
    }

    #[must_use]
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Leave a stale free-list head in the source superblock.
    #[must_use]
    pub fn free_head(mut self, block: u32) -> Self {
        self.free_head = Some(block);
        self
    }

    fn slots(&self, needed: usize) -> Result<Vec<u32>> {
        let count = self.geometry.data_blocks;
        if needed > count {
            return Err(DefragError::NoSpace {
                needed: u64::try_from(needed).unwrap_or(u64::MAX),
                available: u64::try_from(count).unwrap_or(u64::MAX),
            });
        }
        let count = u32::try_from(count)
            .map_err(|_| DefragError::InvalidGeometry(format!("{count} data blocks exceed u32")))?;
        let all = || 0..count;
        let mut slots: Vec<u32> = match &self.placement {
            Placement::Sequential => all().collect(),
            Placement::Reversed => all().rev().collect(),
            Placement::Shuffled { seed } => {
                let mut slots: Vec<u32> = all().collect();
                slots.shuffle(&mut StdRng::seed_from_u64(*seed));
                slots
            }
            Placement::Explicit(slots) => {
                if slots.len() < needed {
                    return Err(DefragError::NoSpace {
                        needed: u64::try_from(needed).unwrap_or(u64::MAX),
                        available: u64::try_from(slots.len()).unwrap_or(u64::MAX),
                    });
                }
                slots.clone()
            }
        };
        slots.truncate(needed);
        Ok(slots)
    }

    pub fn build(self) -> Result<SyntheticImage> {
        let ppb = self.geometry.pointers_per_block();
        let needed = self.files.iter().map(|(_, shape)| shape.block_count()).sum();
        let slots = self.slots(needed)?;
        let mut image = SyntheticImage::new(self.geometry)?;
        let mut alloc = Placer {
            image: &mut image,
            slots: slots.into_iter(),
            ppb,
            next_tag: 0,
        };

        for (file_no, (slot, shape)) in self.files.iter().enumerate() {
            let mut inode = Inode::empty();
            inode.nlink = 1;
            inode.protect = 0o644;
            inode.uid = i32::try_from(1000 + file_no)
                .map_err(|_| DefragError::InvalidGeometry(format!("file {file_no} has no uid")))?;
            inode.gid = 100;
            let size = shape.leaf_count() * self.geometry.block_size;
            inode.size = i32::try_from(size)
                .map_err(|_| DefragError::InvalidGeometry(format!("file size {size} exceeds i32")))?;
            alloc.populate(&mut inode, shape)?;
            alloc.image.set_inode(*slot, &inode)?;
        }

        if let Some(head) = self.free_head {
            image.set_free_head(DataBlock(head).to_ptr().map_err(|err| fixture_error(&err))?)?;
        }
        Ok(image)
    }
}

struct Placer<'a, I> {
    image: &'a mut SyntheticImage,
    slots: I,
    ppb: usize,
    next_tag: u32,
}

impl<I: Iterator<Item = u32>> Placer<'_, I> {
    fn take(&mut self) -> Result<u32> {
        self.slots.next().ok_or(DefragError::NoSpace {
            needed: 1,
            available: 0,
        })
    }

    fn slot_of(&self, index: usize, holes: bool) -> Result<usize> {
        let slot = if holes { index * 2 + 1 } else { index };
        if slot >= self.ppb {
            return Err(DefragError::InvalidGeometry(format!(
                "child {index} does not fit in {} pointer slots",
                self.ppb
            )));
        }
        Ok(slot)
    }

    fn leaf(&mut self) -> Result<u32> {
        let block = self.take()?;
        self.image.fill_block(block, self.next_tag)?;
        self.next_tag += 1;
        Ok(block)
    }

    fn ptr(block: u32) -> Result<BlockPtr> {
        DataBlock(block).to_ptr().map_err(|err| fixture_error(&err))
    }

    /// Allocate a node, then each child subtree produced by `child`.
    fn node<F>(&mut self, count: usize, holes: bool, mut child: F) -> Result<u32>
    where
        F: FnMut(&mut Self, usize) -> Result<u32>,
    {
        let node = self.take()?;
        let mut children = Vec::with_capacity(count);
        for index in 0..count {
            let slot = self.slot_of(index, holes)?;
            children.push((slot, child(&mut *self, index)?));
        }
        self.image.write_indirect(node, &children)?;
        Ok(node)
    }

    fn populate(&mut self, inode: &mut Inode, shape: &FileShape) -> Result<()> {
        if shape.direct > N_DBLOCKS || shape.single.len() > N_IBLOCKS {
            return Err(DefragError::InvalidGeometry(format!(
                "shape needs {} direct and {} single-indirect roots",
                shape.direct,
                shape.single.len()
            )));
        }
        let holes = shape.holes;

        for slot in 0..shape.direct {
            inode.dblocks[slot] = Self::ptr(self.leaf()?)?;
        }
        for (slot, &leaves) in shape.single.iter().enumerate() {
            let node = self.node(leaves, holes, |p, _| p.leaf())?;
            inode.iblocks[slot] = Self::ptr(node)?;
        }
        if let Some(double) = &shape.double {
            let node = self.node(double.len(), holes, |p, i| {
                p.node(double[i], holes, |p, _| p.leaf())
            })?;
            inode.i2block = Self::ptr(node)?;
        }
        if let Some(triple) = &shape.triple {
            let node = self.node(triple.len(), holes, |p, i| {
                let mid = &triple[i];
                p.node(mid.len(), holes, |p, j| p.node(mid[j], holes, |p, _| p.leaf()))
            })?;
            inode.i3block = Self::ptr(node)?;
        }
        Ok(())
    }
}
