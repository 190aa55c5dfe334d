#![forbid(unsafe_code)]
//! Long-form B+tree block headers and record areas.

use crate::extent::{EXTENT_RECORD_SIZE, Extent, parse_extent_list};
use serde::{Deserialize, Serialize};
use xfr_types::{
    BlockNumber, FormatVersion, MagicSet, ParseError, XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC,
    ensure_slice, read_be_u16, read_be_u32, read_be_u64, read_fixed,
    read_le_u32,
};

/// Header bytes shared by both versions.
pub const BTREE_V4_HEADER_SIZE: usize = 24;
/// v4 prefix plus the self-describing tail.
pub const BTREE_V5_HEADER_SIZE: usize = 72;

/// Key (start offset) and pointer (block number) are both 8 bytes.
const NODE_KEY_SIZE: usize = 8;
const NODE_PTR_SIZE: usize = 8;

/// Which long-form tree a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BtreeKind {
    /// Block map of a regular file's data fork.
    DataExtents,
    /// Block map of a directory or attribute fork.
    Directory,
}

/// Accepted `{v4, v5}` magics for one tree kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MagicPair {
    pub v4: u32,
    pub v5: u32,
}

impl MagicPair {
    #[must_use]
    pub fn set(&self) -> MagicSet {
        MagicSet::of_u32(&[self.v4, self.v5])
    }

    /// Version implied by `magic`, if it belongs to this pair.
    #[must_use]
    pub fn version_of(&self, magic: u32) -> Option<FormatVersion> {
        if magic == self.v5 {
            Some(FormatVersion::V5)
        } else if magic == self.v4 {
            Some(FormatVersion::V4)
        } else {
            None
        }
    }
}

impl Default for MagicPair {
    fn default() -> Self {
        Self {
            v4: XFS_BMAP_MAGIC,
            v5: XFS_BMAP_CRC_MAGIC,
        }
    }
}

/// Per-kind magic table supplied by the geometry provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BtreeMagics {
    pub data_extents: MagicPair,
    pub directory: MagicPair,
}

impl BtreeMagics {
    #[must_use]
    pub fn pair(&self, kind: BtreeKind) -> MagicPair {
        match kind {
            BtreeKind::DataExtents => self.data_extents,
            BtreeKind::Directory => self.directory,
        }
    }
}

/// v5-only fields following the shared 24-byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeV5Tail {
    pub block_number: u64,
    pub lsn: u64,
    pub uuid: [u8; 16],
    pub owner: u64,
    pub crc: u32,
}

/// One long-form B+tree block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtreeNodeHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub left_sibling: u64,
    pub right_sibling: u64,
    pub version: FormatVersion,
    pub v5: Option<BtreeV5Tail>,
}

impl BtreeNodeHeader {
    /// Decode a header, validating the magic against `pair`.
    ///
    /// The magic is checked before anything else is read. A v4 magic reads
    /// exactly 24 bytes; a v5 magic reads the full 72.
    pub fn parse(bytes: &[u8], pair: MagicPair) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0)?;
        ParseError::check_magic_u32("bmbt block", pair.set(), magic)?;
        let version = pair.version_of(magic).ok_or(ParseError::InvalidField {
            field: "bb_magic",
            reason: "magic matched no version",
        })?;

        ensure_slice(bytes, 0, BTREE_V4_HEADER_SIZE)?;
        let level = read_be_u16(bytes, 4)?;
        let numrecs = read_be_u16(bytes, 6)?;
        let left_sibling = read_be_u64(bytes, 8)?;
        let right_sibling = read_be_u64(bytes, 16)?;

        let v5 = match version {
            FormatVersion::V4 => None,
            FormatVersion::V5 => {
                ensure_slice(bytes, 0, BTREE_V5_HEADER_SIZE)?;
                Some(BtreeV5Tail {
                    block_number: read_be_u64(bytes, 24)?,
                    lsn: read_be_u64(bytes, 32)?,
                    uuid: read_fixed::<16>(bytes, 40)?,
                    owner: read_be_u64(bytes, 56)?,
                    crc: read_le_u32(bytes, 64)?,
                })
            }
        };

        Ok(Self {
            magic,
            level,
            numrecs,
            left_sibling,
            right_sibling,
            version,
            v5,
        })
    }

    #[must_use]
    pub fn header_size(&self) -> usize {
        match self.version {
            FormatVersion::V4 => BTREE_V4_HEADER_SIZE,
            FormatVersion::V5 => BTREE_V5_HEADER_SIZE,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        self.v5.map(|tail| tail.owner)
    }
}

/// Extent records of a leaf, packed right after the header.
pub fn leaf_extents(block: &[u8], header: &BtreeNodeHeader) -> Result<Vec<Extent>, ParseError> {
    if !header.is_leaf() {
        return Err(ParseError::InvalidField {
            field: "bb_level",
            reason: "extent records requested from an interior node",
        });
    }
    let capacity = block.len().saturating_sub(header.header_size()) / EXTENT_RECORD_SIZE;
    if usize::from(header.numrecs) > capacity {
        return Err(ParseError::InvalidField {
            field: "bb_numrecs",
            reason: "record count exceeds block capacity",
        });
    }
    parse_extent_list(block, header.header_size(), usize::from(header.numrecs))
}

/// Child block pointers of an interior node.
///
/// The record area holds `maxrecs` keys followed by `maxrecs` pointers, where
/// `maxrecs` is fixed by the size of the area (`block` is the whole block, or
/// the whole fork for an inode root). Only the first `numrecs` are live.
pub fn node_child_pointers(
    block: &[u8],
    header: &BtreeNodeHeader,
) -> Result<Vec<BlockNumber>, ParseError> {
    if header.is_leaf() {
        return Err(ParseError::InvalidField {
            field: "bb_level",
            reason: "child pointers requested from a leaf",
        });
    }
    let area = block.len().saturating_sub(header.header_size());
    let maxrecs = area / (NODE_KEY_SIZE + NODE_PTR_SIZE);
    let numrecs = usize::from(header.numrecs);
    if numrecs > maxrecs {
        return Err(ParseError::InvalidField {
            field: "bb_numrecs",
            reason: "record count exceeds block capacity",
        });
    }

    let ptr_base = header.header_size() + maxrecs * NODE_KEY_SIZE;
    (0..numrecs)
        .map(|idx| read_be_u64(block, ptr_base + idx * NODE_PTR_SIZE).map(BlockNumber))
        .collect()
}

/// First logical block of each child, from the key half of the record area.
pub fn node_keys(block: &[u8], header: &BtreeNodeHeader) -> Result<Vec<u64>, ParseError> {
    let numrecs = usize::from(header.numrecs);
    (0..numrecs)
        .map(|idx| read_be_u64(block, header.header_size() + idx * NODE_KEY_SIZE))
        .collect()
}
