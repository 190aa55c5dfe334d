#![forbid(unsafe_code)]
//! Directory/attribute block info header and dabtree interior nodes.

use serde::{Deserialize, Serialize};
use xfr_types::{
    FormatVersion, Magic, MagicSet, ParseError, XFS_ATTR3_LEAF_MAGIC, XFS_ATTR_LEAF_MAGIC,
    XFS_DA_NODE_MAGIC, XFS_DA3_NODE_MAGIC, XFS_DIR2_LEAF1_MAGIC, XFS_DIR2_LEAFN_MAGIC,
    XFS_DIR3_LEAF1_MAGIC, XFS_DIR3_LEAFN_MAGIC, ensure_slice, read_be_u16, read_be_u32,
    read_be_u64, read_fixed, read_le_u32,
};

pub const DA_BLKINFO_V4_SIZE: usize = 12;
pub const DA_BLKINFO_V5_SIZE: usize = 56;

/// Byte offset of the 16-bit magic inside the block info header.
pub const DA_MAGIC_OFFSET: usize = 8;

pub const DA_V4_MAGICS: MagicSet = MagicSet::of_u16(&[
    XFS_DIR2_LEAF1_MAGIC,
    XFS_DIR2_LEAFN_MAGIC,
    XFS_ATTR_LEAF_MAGIC,
    XFS_DA_NODE_MAGIC,
]);
pub const DA_V5_MAGICS: MagicSet = MagicSet::of_u16(&[
    XFS_DIR3_LEAF1_MAGIC,
    XFS_DIR3_LEAFN_MAGIC,
    XFS_ATTR3_LEAF_MAGIC,
    XFS_DA3_NODE_MAGIC,
]);

#[must_use]
pub fn da_magics(version: FormatVersion) -> MagicSet {
    match version {
        FormatVersion::V4 => DA_V4_MAGICS,
        FormatVersion::V5 => DA_V5_MAGICS,
    }
}

#[must_use]
pub fn blkinfo_size(version: FormatVersion) -> usize {
    match version {
        FormatVersion::V4 => DA_BLKINFO_V4_SIZE,
        FormatVersion::V5 => DA_BLKINFO_V5_SIZE,
    }
}

/// What a block in a dabtree-indexed fork holds, judged by its magic alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DaBlockKind {
    /// Single leaf of a leaf-format directory.
    DirLeaf1,
    /// Leaf of a node-format directory.
    DirLeafN,
    AttrLeaf,
    /// Interior dabtree node.
    Node,
}

impl DaBlockKind {
    /// Classify a 16-bit magic of either version.
    #[must_use]
    pub fn from_magic(magic: u16) -> Option<(Self, FormatVersion)> {
        let found = match magic {
            XFS_DIR2_LEAF1_MAGIC => (Self::DirLeaf1, FormatVersion::V4),
            XFS_DIR3_LEAF1_MAGIC => (Self::DirLeaf1, FormatVersion::V5),
            XFS_DIR2_LEAFN_MAGIC => (Self::DirLeafN, FormatVersion::V4),
            XFS_DIR3_LEAFN_MAGIC => (Self::DirLeafN, FormatVersion::V5),
            XFS_ATTR_LEAF_MAGIC => (Self::AttrLeaf, FormatVersion::V4),
            XFS_ATTR3_LEAF_MAGIC => (Self::AttrLeaf, FormatVersion::V5),
            XFS_DA_NODE_MAGIC => (Self::Node, FormatVersion::V4),
            XFS_DA3_NODE_MAGIC => (Self::Node, FormatVersion::V5),
            _ => return None,
        };
        Some(found)
    }
}

/// Read the block magic without decoding the rest of the header.
pub fn peek_da_magic(block: &[u8]) -> Result<u16, ParseError> {
    read_be_u16(block, DA_MAGIC_OFFSET)
}

/// `true` if `block` carries an attribute-leaf magic of either version.
pub fn is_attr_leaf_block(block: &[u8]) -> Result<bool, ParseError> {
    let magic = peek_da_magic(block)?;
    Ok(magic == XFS_ATTR_LEAF_MAGIC || magic == XFS_ATTR3_LEAF_MAGIC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaBlockV5Tail {
    pub crc: u32,
    pub block_number: u64,
    pub lsn: u64,
    pub uuid: [u8; 16],
    pub owner: u64,
}

/// Block info header at the start of every dabtree-indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryBlockHeader {
    pub forward: u32,
    pub backward: u32,
    pub magic: u16,
    pub version: FormatVersion,
    pub v5: Option<DaBlockV5Tail>,
}

impl DirectoryBlockHeader {
    /// Decode the header for a known format version.
    ///
    /// A v4 header never reads past byte 12.
    pub fn parse(bytes: &[u8], version: FormatVersion) -> Result<Self, ParseError> {
        let magic = peek_da_magic(bytes)?;
        ParseError::check_magic_u16("da block", da_magics(version), magic)?;
        ensure_slice(bytes, 0, blkinfo_size(version))?;

        let forward = read_be_u32(bytes, 0)?;
        let backward = read_be_u32(bytes, 4)?;
        let v5 = match version {
            FormatVersion::V4 => None,
            FormatVersion::V5 => Some(DaBlockV5Tail {
                crc: read_le_u32(bytes, 12)?,
                block_number: read_be_u64(bytes, 16)?,
                lsn: read_be_u64(bytes, 24)?,
                uuid: read_fixed::<16>(bytes, 32)?,
                owner: read_be_u64(bytes, 48)?,
            }),
        };

        Ok(Self {
            forward,
            backward,
            magic,
            version,
            v5,
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        blkinfo_size(self.version)
    }

    #[must_use]
    pub fn kind(&self) -> Option<DaBlockKind> {
        DaBlockKind::from_magic(self.magic).map(|(kind, _)| kind)
    }

    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        self.v5.map(|tail| tail.owner)
    }
}

// ── Interior nodes ──────────────────────────────────────────────────────────

/// One `(hashval, before)` pair of a dabtree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaNodeEntry {
    /// Highest hash reachable through `before`.
    pub hashval: u32,
    /// Logical block of the child within the fork.
    pub before: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaNode {
    pub info: DirectoryBlockHeader,
    pub count: u16,
    pub level: u16,
    pub entries: Vec<DaNodeEntry>,
}

impl DaNode {
    pub fn parse(block: &[u8], version: FormatVersion) -> Result<Self, ParseError> {
        let info = DirectoryBlockHeader::parse(block, version)?;
        if info.kind() != Some(DaBlockKind::Node) {
            let expected = match version {
                FormatVersion::V4 => XFS_DA_NODE_MAGIC,
                FormatVersion::V5 => XFS_DA3_NODE_MAGIC,
            };
            return Err(ParseError::SignatureMismatch {
                structure: "da node",
                expected: MagicSet::of_u16(&[expected]),
                actual: Magic::u16(info.magic),
            });
        }

        let base = info.size();
        let count = read_be_u16(block, base)?;
        let level = read_be_u16(block, base + 2)?;
        // v5 pads the node header to 64 bytes.
        let entries_at = match version {
            FormatVersion::V4 => base + 4,
            FormatVersion::V5 => base + 8,
        };
        let entries = (0..usize::from(count))
            .map(|idx| {
                let at = entries_at + idx * 8;
                Ok(DaNodeEntry {
                    hashval: read_be_u32(block, at)?,
                    before: read_be_u32(block, at + 4)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(Self {
            info,
            count,
            level,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(magic: u16, len: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; len];
        buf[0..4].copy_from_slice(&3_u32.to_be_bytes());
        buf[4..8].copy_from_slice(&1_u32.to_be_bytes());
        buf[8..10].copy_from_slice(&magic.to_be_bytes());
        buf
    }

    #[test]
    fn v4_header_is_twelve_bytes() {
        let buf = info(XFS_DIR2_LEAFN_MAGIC, DA_BLKINFO_V4_SIZE);
        let hdr = DirectoryBlockHeader::parse(&buf, FormatVersion::V4).expect("header");
        assert_eq!(hdr.forward, 3);
        assert_eq!(hdr.backward, 1);
        assert_eq!(hdr.kind(), Some(DaBlockKind::DirLeafN));
        assert!(hdr.v5.is_none());
        assert_eq!(hdr.size(), 12);
    }

    #[test]
    fn v5_header_reads_the_tail() {
        let mut buf = info(XFS_ATTR3_LEAF_MAGIC, DA_BLKINFO_V5_SIZE);
        buf[12..16].copy_from_slice(&0xCAFE_u32.to_le_bytes());
        buf[16..24].copy_from_slice(&88_u64.to_be_bytes());
        buf[48..56].copy_from_slice(&131_u64.to_be_bytes());

        let hdr = DirectoryBlockHeader::parse(&buf, FormatVersion::V5).expect("header");
        let tail = hdr.v5.expect("tail");
        assert_eq!(tail.crc, 0xCAFE);
        assert_eq!(tail.block_number, 88);
        assert_eq!(hdr.owner(), Some(131));
        assert_eq!(hdr.size(), 56);

        let short = info(XFS_ATTR3_LEAF_MAGIC, 40);
        assert!(DirectoryBlockHeader::parse(&short, FormatVersion::V5).is_err());
    }

    #[test]
    fn magic_must_match_the_requested_version() {
        let buf = info(XFS_DIR3_LEAF1_MAGIC, 64);
        let err = DirectoryBlockHeader::parse(&buf, FormatVersion::V4).unwrap_err();
        assert_eq!(
            err.to_string(),
            "da block signature mismatch: expected one of {0xd2f1, 0xd2ff, 0xfbee, 0xfebe}, got 0x3df1"
        );
        assert!(DirectoryBlockHeader::parse(&buf, FormatVersion::V5).is_ok());
    }

    #[test]
    fn peek_classifies_attr_leaf_of_either_version() {
        assert!(is_attr_leaf_block(&info(XFS_ATTR_LEAF_MAGIC, 12)).expect("peek"));
        assert!(is_attr_leaf_block(&info(XFS_ATTR3_LEAF_MAGIC, 12)).expect("peek"));
        assert!(!is_attr_leaf_block(&info(XFS_DIR3_LEAFN_MAGIC, 12)).expect("peek"));
        assert!(is_attr_leaf_block(&[0_u8; 9]).is_err());
        assert_eq!(
            DaBlockKind::from_magic(XFS_DA3_NODE_MAGIC),
            Some((DaBlockKind::Node, FormatVersion::V5))
        );
        assert_eq!(DaBlockKind::from_magic(0x1234), None);
    }

    #[test]
    fn da_node_entries_follow_versioned_header() {
        let mut v4 = info(XFS_DA_NODE_MAGIC, 64);
        v4[12..14].copy_from_slice(&2_u16.to_be_bytes());
        v4[14..16].copy_from_slice(&1_u16.to_be_bytes());
        v4[16..20].copy_from_slice(&0x100_u32.to_be_bytes());
        v4[20..24].copy_from_slice(&5_u32.to_be_bytes());
        v4[24..28].copy_from_slice(&0xFFFF_FFFF_u32.to_be_bytes());
        v4[28..32].copy_from_slice(&9_u32.to_be_bytes());

        let node = DaNode::parse(&v4, FormatVersion::V4).expect("node");
        assert_eq!(node.level, 1);
        assert_eq!(
            node.entries,
            vec![
                DaNodeEntry {
                    hashval: 0x100,
                    before: 5
                },
                DaNodeEntry {
                    hashval: 0xFFFF_FFFF,
                    before: 9
                },
            ]
        );

        let mut v5 = info(XFS_DA3_NODE_MAGIC, 80);
        v5[56..58].copy_from_slice(&1_u16.to_be_bytes());
        v5[58..60].copy_from_slice(&1_u16.to_be_bytes());
        v5[64..68].copy_from_slice(&0x42_u32.to_be_bytes());
        v5[68..72].copy_from_slice(&12_u32.to_be_bytes());
        let node = DaNode::parse(&v5, FormatVersion::V5).expect("node");
        assert_eq!(node.entries[0].before, 12);
    }

    #[test]
    fn da_node_rejects_leaf_magic() {
        let buf = info(XFS_DIR2_LEAFN_MAGIC, 64);
        assert!(matches!(
            DaNode::parse(&buf, FormatVersion::V4),
            Err(ParseError::SignatureMismatch { .. })
        ));
    }
}
