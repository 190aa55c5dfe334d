#![forbid(unsafe_code)]
//! Extended attribute leaf blocks.

use crate::dablk::{DaBlockKind, DirectoryBlockHeader};
use serde::{Deserialize, Serialize};
use xfr_types::{
    FormatVersion, Magic, MagicSet, ParseError, XFS_ATTR3_LEAF_MAGIC, XFS_ATTR_LEAF_MAGIC,
    ensure_slice, read_be_u16, read_be_u32, read_u8,
};

pub const XFS_ATTR_LOCAL: u8 = 0x01;
pub const XFS_ATTR_ROOT: u8 = 0x02;
pub const XFS_ATTR_SECURE: u8 = 0x04;
pub const XFS_ATTR_INCOMPLETE: u8 = 0x80;

const ATTR_FREEMAP_SIZE: usize = 3;
const ATTR_ENTRY_SIZE: usize = 8;

/// Which namespace an attribute belongs to, from its entry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrNamespace {
    User,
    Trusted,
    Secure,
}

impl AttrNamespace {
    #[must_use]
    pub fn from_flags(flags: u8) -> Self {
        if flags & XFS_ATTR_SECURE != 0 {
            Self::Secure
        } else if flags & XFS_ATTR_ROOT != 0 {
            Self::Trusted
        } else {
            Self::User
        }
    }

    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "user.",
            Self::Trusted => "trusted.",
            Self::Secure => "secure.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttrFreeMap {
    pub base: u16,
    pub size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrLeafHeader {
    pub info: DirectoryBlockHeader,
    pub count: u16,
    pub used_bytes: u16,
    pub first_used: u16,
    pub holes: u8,
    pub freemap: [AttrFreeMap; ATTR_FREEMAP_SIZE],
}

impl AttrLeafHeader {
    /// 32 bytes for v4, 80 for v5.
    #[must_use]
    pub fn size(&self) -> usize {
        let common = self.info.size() + 8 + ATTR_FREEMAP_SIZE * 4;
        match self.info.version {
            FormatVersion::V4 => common,
            FormatVersion::V5 => common + 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrLeafEntry {
    pub hash: u32,
    /// Offset of the name record within the block.
    pub name_index: u16,
    pub flags: u8,
}

impl AttrLeafEntry {
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.flags & XFS_ATTR_LOCAL != 0
    }

    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        self.flags & XFS_ATTR_INCOMPLETE != 0
    }

    #[must_use]
    pub fn namespace(&self) -> AttrNamespace {
        AttrNamespace::from_flags(self.flags)
    }
}

/// Where an attribute's value lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    /// Stored right after the name in the leaf block.
    Local(Vec<u8>),
    /// Stored in separate blocks starting at this logical fork block.
    Remote { block: u32, length: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrName {
    pub namespace: AttrNamespace,
    pub name: Vec<u8>,
    pub hash: u32,
    pub name_index: u16,
    pub value: AttrValue,
}

impl AttrName {
    /// Name with its namespace prefix, e.g. `user.comment`.
    #[must_use]
    pub fn full_name(&self) -> Vec<u8> {
        let mut out = self.namespace.prefix().as_bytes().to_vec();
        out.extend_from_slice(&self.name);
        out
    }

    /// Bytes the name record occupies in the leaf, rounded to 4.
    #[must_use]
    pub fn record_len(&self) -> usize {
        let raw = match &self.value {
            AttrValue::Local(value) => 3 + self.name.len() + value.len(),
            AttrValue::Remote { .. } => 9 + self.name.len(),
        };
        raw.div_ceil(4) * 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrLeafBlock {
    pub header: AttrLeafHeader,
    pub entries: Vec<AttrLeafEntry>,
}

impl AttrLeafBlock {
    pub fn parse(bytes: &[u8], version: FormatVersion) -> Result<Self, ParseError> {
        let info = DirectoryBlockHeader::parse(bytes, version)?;
        if info.kind() != Some(DaBlockKind::AttrLeaf) {
            let expected = match version {
                FormatVersion::V4 => XFS_ATTR_LEAF_MAGIC,
                FormatVersion::V5 => XFS_ATTR3_LEAF_MAGIC,
            };
            return Err(ParseError::SignatureMismatch {
                structure: "attr leaf",
                expected: MagicSet::of_u16(&[expected]),
                actual: Magic::u16(info.magic),
            });
        }

        let base = info.size();
        let count = read_be_u16(bytes, base)?;
        let used_bytes = read_be_u16(bytes, base + 2)?;
        let first_used = read_be_u16(bytes, base + 4)?;
        let holes = read_u8(bytes, base + 6)?;
        let mut freemap = [AttrFreeMap::default(); ATTR_FREEMAP_SIZE];
        for (idx, slot) in freemap.iter_mut().enumerate() {
            let at = base + 8 + idx * 4;
            *slot = AttrFreeMap {
                base: read_be_u16(bytes, at)?,
                size: read_be_u16(bytes, at + 2)?,
            };
        }
        let header = AttrLeafHeader {
            info,
            count,
            used_bytes,
            first_used,
            holes,
            freemap,
        };

        let start = header.size();
        ensure_slice(bytes, start, usize::from(count) * ATTR_ENTRY_SIZE)?;
        let entries = (0..usize::from(count))
            .map(|idx| {
                let at = start + idx * ATTR_ENTRY_SIZE;
                Ok(AttrLeafEntry {
                    hash: read_be_u32(bytes, at)?,
                    name_index: read_be_u16(bytes, at + 4)?,
                    flags: read_u8(bytes, at + 6)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(Self { header, entries })
    }

    /// Decode every complete entry's name record, in entry order.
    pub fn names(&self, bytes: &[u8]) -> Result<Vec<AttrName>, ParseError> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_incomplete())
            .map(|entry| decode_name(bytes, entry))
            .collect()
    }
}

fn decode_name(bytes: &[u8], entry: &AttrLeafEntry) -> Result<AttrName, ParseError> {
    let at = usize::from(entry.name_index);
    let (name, value) = if entry.is_local() {
        let value_len = usize::from(read_be_u16(bytes, at)?);
        let namelen = usize::from(read_u8(bytes, at + 2)?);
        let name = ensure_slice(bytes, at + 3, namelen)?.to_vec();
        let value = ensure_slice(bytes, at + 3 + namelen, value_len)?.to_vec();
        (name, AttrValue::Local(value))
    } else {
        let block = read_be_u32(bytes, at)?;
        let length = read_be_u32(bytes, at + 4)?;
        let namelen = usize::from(read_u8(bytes, at + 8)?);
        let name = ensure_slice(bytes, at + 9, namelen)?.to_vec();
        (name, AttrValue::Remote { block, length })
    };

    Ok(AttrName {
        namespace: entry.namespace(),
        name,
        hash: entry.hash,
        name_index: entry.name_index,
        value,
    })
}
