#![forbid(unsafe_code)]

use defrag_types::{
    BlockPtr, INODE_SIZE, N_DBLOCKS, N_IBLOCKS, POINTER_SIZE, ParseError, ensure_slice,
    ensure_slice_mut, read_le_i32, read_ptr, write_le_i32, write_ptr,
};
use serde::{Deserialize, Serialize};

// ── Record layout (100 bytes) ───────────────────────────────────────────────

const I_NEXT_INODE: usize = 0x00;
const I_PROTECT: usize = 0x04;
const I_NLINK: usize = 0x08;
const I_SIZE: usize = 0x0C;
const I_UID: usize = 0x10;
const I_GID: usize = 0x14;
const I_CTIME: usize = 0x18;
const I_MTIME: usize = 0x1C;
const I_ATIME: usize = 0x20;
const I_DBLOCKS: usize = 0x24;
const I_IBLOCKS: usize = I_DBLOCKS + N_DBLOCKS * POINTER_SIZE;
const I_I2BLOCK: usize = I_IBLOCKS + N_IBLOCKS * POINTER_SIZE;
const I_I3BLOCK: usize = I_I2BLOCK + POINTER_SIZE;

const _: () = assert!(I_I3BLOCK + POINTER_SIZE == INODE_SIZE);

/// Decoded inode record.
///
/// Every byte of the 100-byte record maps to a field, so
/// `parse_from_bytes` followed by `encode_into` reproduces the record
/// exactly. The metadata fields are opaque to the defragmenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    /// Free-inode list link; meaningful only when `nlink == 0`.
    pub next_inode: i32,
    pub protect: i32,
    pub nlink: i32,
    pub size: i32,
    pub uid: i32,
    pub gid: i32,
    pub ctime: i32,
    pub mtime: i32,
    pub atime: i32,
    pub dblocks: [BlockPtr; N_DBLOCKS],
    pub iblocks: [BlockPtr; N_IBLOCKS],
    pub i2block: BlockPtr,
    pub i3block: BlockPtr,
}

impl Inode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let record = ensure_slice(bytes, 0, INODE_SIZE)?;

        let mut dblocks = [BlockPtr::NONE; N_DBLOCKS];
        for (slot, ptr) in dblocks.iter_mut().enumerate() {
            *ptr = read_ptr(record, I_DBLOCKS + slot * POINTER_SIZE)?;
        }
        let mut iblocks = [BlockPtr::NONE; N_IBLOCKS];
        for (slot, ptr) in iblocks.iter_mut().enumerate() {
            *ptr = read_ptr(record, I_IBLOCKS + slot * POINTER_SIZE)?;
        }

        Ok(Self {
            next_inode: read_le_i32(record, I_NEXT_INODE)?,
            protect: read_le_i32(record, I_PROTECT)?,
            nlink: read_le_i32(record, I_NLINK)?,
            size: read_le_i32(record, I_SIZE)?,
            uid: read_le_i32(record, I_UID)?,
            gid: read_le_i32(record, I_GID)?,
            ctime: read_le_i32(record, I_CTIME)?,
            mtime: read_le_i32(record, I_MTIME)?,
            atime: read_le_i32(record, I_ATIME)?,
            dblocks,
            iblocks,
            i2block: read_ptr(record, I_I2BLOCK)?,
            i3block: read_ptr(record, I_I3BLOCK)?,
        })
    }

    /// Parse the inode stored at absolute byte address `addr`.
    pub fn parse_at(image: &[u8], addr: usize) -> Result<Self, ParseError> {
        Self::parse_from_bytes(ensure_slice(image, addr, INODE_SIZE)?)
    }

    /// Encode into the first `INODE_SIZE` bytes of `out`.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        let record = ensure_slice_mut(out, 0, INODE_SIZE)?;
        write_le_i32(record, I_NEXT_INODE, self.next_inode)?;
        write_le_i32(record, I_PROTECT, self.protect)?;
        write_le_i32(record, I_NLINK, self.nlink)?;
        write_le_i32(record, I_SIZE, self.size)?;
        write_le_i32(record, I_UID, self.uid)?;
        write_le_i32(record, I_GID, self.gid)?;
        write_le_i32(record, I_CTIME, self.ctime)?;
        write_le_i32(record, I_MTIME, self.mtime)?;
        write_le_i32(record, I_ATIME, self.atime)?;
        for (slot, ptr) in self.dblocks.iter().enumerate() {
            write_ptr(record, I_DBLOCKS + slot * POINTER_SIZE, *ptr)?;
        }
        for (slot, ptr) in self.iblocks.iter().enumerate() {
            write_ptr(record, I_IBLOCKS + slot * POINTER_SIZE, *ptr)?;
        }
        write_ptr(record, I_I2BLOCK, self.i2block)?;
        write_ptr(record, I_I3BLOCK, self.i3block)
    }

    /// Encode at absolute byte address `addr` of an image.
    pub fn write_at(&self, image: &mut [u8], addr: usize) -> Result<(), ParseError> {
        self.encode_into(ensure_slice_mut(image, addr, INODE_SIZE)?)
    }

    /// A positive link count marks the record as a live file.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.nlink > 0
    }

    /// An inode with every pointer field set to the sentinel.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            next_inode: 0,
            protect: 0,
            nlink: 0,
            size: 0,
            uid: 0,
            gid: 0,
            ctime: 0,
            mtime: 0,
            atime: 0,
            dblocks: [BlockPtr::NONE; N_DBLOCKS],
            iblocks: [BlockPtr::NONE; N_IBLOCKS],
            i2block: BlockPtr::NONE,
            i3block: BlockPtr::NONE,
        }
    }
}
