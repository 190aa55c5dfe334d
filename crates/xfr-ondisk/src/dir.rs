#![forbid(unsafe_code)]
//! Directory data blocks, leaf blocks, entry scanning and shortform directories.

use crate::dablk::{DaBlockKind, DirectoryBlockHeader};
use serde::{Deserialize, Serialize};
use tracing::trace;
use xfr_types::{
    FormatVersion, InodeNumber, Magic, MagicSet, ParseError, XFS_DIR2_BLOCK_MAGIC,
    XFS_DIR2_DATA_ALIGN, XFS_DIR2_DATA_FREE_TAG, XFS_DIR2_DATA_MAGIC, XFS_DIR2_LEAF1_MAGIC,
    XFS_DIR2_LEAFN_MAGIC, XFS_DIR3_BLOCK_MAGIC, XFS_DIR3_DATA_MAGIC, XFS_DIR3_LEAF1_MAGIC,
    XFS_DIR3_LEAFN_MAGIC, align_up, ensure_slice, read_be_u16, read_be_u32, read_be_u64,
    read_le_u32,
    read_fixed, read_u8,
};

/// Number of best-free slots in every data block header.
pub const DATA_FREE_COUNT: usize = 3;
const FREE_DESCRIPTOR_SIZE: usize = 4;
/// Block header of a v4 data block is just the magic.
const DATA_V4_BLOCK_HEADER: usize = 4;
/// v5 block header: magic, crc, blkno, lsn, uuid, owner.
const DATA_V5_BLOCK_HEADER: usize = 48;

const DATA_V4_MAGICS: MagicSet = MagicSet::of_u32(&[XFS_DIR2_DATA_MAGIC, XFS_DIR2_BLOCK_MAGIC]);
const DATA_V5_MAGICS: MagicSet = MagicSet::of_u32(&[XFS_DIR3_DATA_MAGIC, XFS_DIR3_BLOCK_MAGIC]);

/// Smallest possible entry or unused region.
const MIN_ENTRY_SPAN: usize = 8;
/// Fixed part of an occupied entry: inode (8), namelen (1), tag (2).
const ENTRY_FIXED_SIZE: usize = 11;

// ── File types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirFileType {
    Unknown,
    RegFile,
    Dir,
    Chrdev,
    Blkdev,
    Fifo,
    Sock,
    Symlink,
    Whiteout,
}

impl DirFileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            8 => Self::Whiteout,
            _ => Self::Unknown,
        }
    }
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// One named entry produced by a directory or attribute listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: Vec<u8>,
    /// Target inode; for attributes, the owning inode.
    pub inode: InodeNumber,
    /// Entry offset within its block as recorded on disk.
    pub tag: u16,
    /// Bytes consumed by the entry on disk.
    pub length: usize,
    pub file_type: Option<DirFileType>,
}

impl DirectoryEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// On-disk size of an occupied entry with a `namelen`-byte name.
#[must_use]
pub fn entry_span(namelen: usize, has_ftype: bool) -> usize {
    let raw = ENTRY_FIXED_SIZE + namelen + usize::from(has_ftype);
    // namelen is at most 255, so this cannot overflow.
    raw.div_ceil(XFS_DIR2_DATA_ALIGN) * XFS_DIR2_DATA_ALIGN
}

/// Decode the occupied entry at `offset`.
///
/// Returns `Ok(None)` for a zero-length name, the end-of-block sentinel.
pub fn decode_entry_at(
    region: &[u8],
    offset: usize,
    has_ftype: bool,
) -> Result<Option<DirectoryEntry>, ParseError> {
    let inode = read_be_u64(region, offset)?;
    let namelen = usize::from(read_u8(region, offset + 8)?);
    if namelen == 0 {
        return Ok(None);
    }

    let length = entry_span(namelen, has_ftype);
    ensure_slice(region, offset, length)?;
    let name = region[offset + 9..offset + 9 + namelen].to_vec();
    let file_type = if has_ftype {
        Some(DirFileType::from_raw(read_u8(region, offset + 9 + namelen)?))
    } else {
        None
    };
    let tag = read_be_u16(region, offset + length - 2)?;

    Ok(Some(DirectoryEntry {
        name,
        inode: InodeNumber(inode),
        tag,
        length,
        file_type,
    }))
}

/// Lazy scan over the entry region of one data block.
///
/// Unused regions are skipped. The scan ends at a zero-length name or at the
/// end of the region, whichever comes first. Reading past the region is an
/// error, after which the iterator yields nothing more.
pub struct DirEntryScanner<'a> {
    region: &'a [u8],
    cursor: usize,
    has_ftype: bool,
    done: bool,
}

impl<'a> DirEntryScanner<'a> {
    /// Scan `block[start..end]`; `end` bounds the declared data region.
    pub fn new(
        block: &'a [u8],
        start: usize,
        end: usize,
        has_ftype: bool,
    ) -> Result<Self, ParseError> {
        if start > end || end > block.len() {
            return Err(ParseError::InvalidField {
                field: "data_region",
                reason: "entry region outside block",
            });
        }
        Ok(Self {
            region: &block[..end],
            cursor: start,
            has_ftype,
            done: false,
        })
    }

    fn step(&mut self) -> Result<Option<DirectoryEntry>, ParseError> {
        loop {
            if self.cursor >= self.region.len() {
                return Ok(None);
            }

            let freetag = read_be_u16(self.region, self.cursor)?;
            if freetag == XFS_DIR2_DATA_FREE_TAG {
                let length = usize::from(read_be_u16(self.region, self.cursor + 2)?);
                if length < MIN_ENTRY_SPAN || length % XFS_DIR2_DATA_ALIGN != 0 {
                    return Err(ParseError::InvalidField {
                        field: "dup_length",
                        reason: "unused region length not a positive multiple of 8",
                    });
                }
                ensure_slice(self.region, self.cursor, length)?;
                trace!(offset = self.cursor, length, "skip unused region");
                self.cursor += length;
                continue;
            }

            let Some(entry) = decode_entry_at(self.region, self.cursor, self.has_ftype)? else {
                return Ok(None);
            };
            self.cursor += entry.length;
            return Ok(Some(entry));
        }
    }
}

impl Iterator for DirEntryScanner<'_> {
    type Item = Result<DirectoryEntry, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

// ── Data block header ───────────────────────────────────────────────────────

/// One best-free slot: a free run inside the data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FreeSpaceDescriptor {
    pub offset: u16,
    pub length: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlockV5Tail {
    pub crc: u32,
    pub block_number: u64,
    pub lsn: u64,
    pub uuid: [u8; 16],
    pub owner: u64,
}

/// Header of a directory data block (multi-block or single-block form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlockHeader {
    pub magic: u32,
    pub version: FormatVersion,
    pub best_free: [FreeSpaceDescriptor; DATA_FREE_COUNT],
    pub v5: Option<DataBlockV5Tail>,
}

impl DataBlockHeader {
    pub fn parse(bytes: &[u8], version: FormatVersion) -> Result<Self, ParseError> {
        let magic = read_be_u32(bytes, 0)?;
        let accepted = match version {
            FormatVersion::V4 => DATA_V4_MAGICS,
            FormatVersion::V5 => DATA_V5_MAGICS,
        };
        ParseError::check_magic_u32("dir data block", accepted, magic)?;

        let v5 = match version {
            FormatVersion::V4 => None,
            FormatVersion::V5 => Some(DataBlockV5Tail {
                crc: read_le_u32(bytes, 4)?,
                block_number: read_be_u64(bytes, 8)?,
                lsn: read_be_u64(bytes, 16)?,
                uuid: read_fixed::<16>(bytes, 24)?,
                owner: read_be_u64(bytes, 40)?,
            }),
        };

        let base = block_header_size(version);
        let mut best_free = [FreeSpaceDescriptor::default(); DATA_FREE_COUNT];
        for (idx, slot) in best_free.iter_mut().enumerate() {
            let at = base + idx * FREE_DESCRIPTOR_SIZE;
            *slot = FreeSpaceDescriptor {
                offset: read_be_u16(bytes, at)?,
                length: read_be_u16(bytes, at + 2)?,
            };
        }
        ensure_slice(bytes, 0, entries_offset(version))?;

        Ok(Self {
            magic,
            version,
            best_free,
            v5,
        })
    }

    /// `true` for the single-block form whose leaf lives in the same block.
    #[must_use]
    pub fn is_single_block(&self) -> bool {
        self.magic == XFS_DIR2_BLOCK_MAGIC || self.magic == XFS_DIR3_BLOCK_MAGIC
    }

    #[must_use]
    pub fn entries_offset(&self) -> usize {
        entries_offset(self.version)
    }

    #[must_use]
    pub fn owner(&self) -> Option<u64> {
        self.v5.map(|tail| tail.owner)
    }

    /// End of the declared data region inside `block`.
    pub fn data_end(&self, block: &[u8]) -> Result<usize, ParseError> {
        if self.is_single_block() {
            BlockTail::parse(block)?.data_end(block.len(), self.entries_offset())
        } else {
            Ok(block.len())
        }
    }

    /// Start a scan over this block's entries.
    pub fn scan<'a>(
        &self,
        block: &'a [u8],
        has_ftype: bool,
    ) -> Result<DirEntryScanner<'a>, ParseError> {
        let end = self.data_end(block)?;
        DirEntryScanner::new(block, self.entries_offset(), end, has_ftype)
    }
}

#[must_use]
fn block_header_size(version: FormatVersion) -> usize {
    match version {
        FormatVersion::V4 => DATA_V4_BLOCK_HEADER,
        FormatVersion::V5 => DATA_V5_BLOCK_HEADER,
    }
}

/// Start of the entry region: block header, best-free table, then padding
/// back to 8-byte alignment.
#[must_use]
pub fn entries_offset(version: FormatVersion) -> usize {
    let raw = block_header_size(version) + DATA_FREE_COUNT * FREE_DESCRIPTOR_SIZE;
    align_up(raw, XFS_DIR2_DATA_ALIGN).unwrap_or(raw)
}

/// Trailer of a single-block directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTail {
    /// Leaf entries stored just before the tail.
    pub count: u32,
    pub stale: u32,
}

impl BlockTail {
    pub const SIZE: usize = 8;

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let at = block.len().checked_sub(Self::SIZE).ok_or(ParseError::InsufficientData {
            needed: Self::SIZE,
            offset: 0,
            actual: block.len(),
        })?;
        Ok(Self {
            count: read_be_u32(block, at)?,
            stale: read_be_u32(block, at + 4)?,
        })
    }

    /// `block_len - 8 - 8 * count`, which must not fall below `entries_start`.
    pub fn data_end(&self, block_len: usize, entries_start: usize) -> Result<usize, ParseError> {
        let leaf_bytes = usize::try_from(self.count)
            .ok()
            .and_then(|count| count.checked_mul(LeafEntry::SIZE))
            .ok_or(ParseError::IntegerConversion {
                field: "block_tail_count",
            })?;
        block_len
            .checked_sub(Self::SIZE)
            .and_then(|end| end.checked_sub(leaf_bytes))
            .filter(|end| *end >= entries_start)
            .ok_or(ParseError::InvalidField {
                field: "block_tail_count",
                reason: "leaf entries overlap the block header",
            })
    }

    /// Hash entries stored between the data region and the tail.
    pub fn leaf_entries(&self, block: &[u8], entries_start: usize) -> Result<Vec<LeafEntry>, ParseError> {
        let start = self.data_end(block.len(), entries_start)?;
        let count = usize::try_from(self.count).map_err(|_| ParseError::IntegerConversion {
            field: "block_tail_count",
        })?;
        parse_leaf_entries(block, start, count)
    }
}

// ── Leaf blocks ─────────────────────────────────────────────────────────────

/// One hash-index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub hash: u32,
    /// Directory-space address in 8-byte units; zero marks a stale slot.
    pub address: u32,
}

impl LeafEntry {
    pub const SIZE: usize = 8;

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.address == 0
    }

    /// Logical byte offset of the target entry in directory space.
    #[must_use]
    pub fn data_byte_offset(&self) -> u64 {
        u64::from(self.address) * XFS_DIR2_DATA_ALIGN as u64
    }
}

fn parse_leaf_entries(bytes: &[u8], at: usize, count: usize) -> Result<Vec<LeafEntry>, ParseError> {
    let needed = count.checked_mul(LeafEntry::SIZE).ok_or(ParseError::IntegerConversion {
        field: "leaf_count",
    })?;
    ensure_slice(bytes, at, needed)?;
    (0..count)
        .map(|idx| {
            let off = at + idx * LeafEntry::SIZE;
            Ok(LeafEntry {
                hash: read_be_u32(bytes, off)?,
                address: read_be_u32(bytes, off + 4)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafHeader {
    pub info: DirectoryBlockHeader,
    pub count: u16,
    pub stale: u16,
}

impl LeafHeader {
    /// 16 bytes for v4; v5 pads to 64.
    #[must_use]
    pub fn size(&self) -> usize {
        match self.info.version {
            FormatVersion::V4 => self.info.size() + 4,
            FormatVersion::V5 => self.info.size() + 8,
        }
    }
}

/// A hash-indexed leaf block of a leaf- or node-format directory.
///
/// Every one of the `count` slots is decoded; stale slots stay in place with
/// a zero address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafBlock {
    pub header: LeafHeader,
    pub entries: Vec<LeafEntry>,
}

impl LeafBlock {
    pub fn parse(bytes: &[u8], version: FormatVersion) -> Result<Self, ParseError> {
        let info = DirectoryBlockHeader::parse(bytes, version)?;
        match info.kind() {
            Some(DaBlockKind::DirLeaf1 | DaBlockKind::DirLeafN) => {}
            _ => {
                let expected = match version {
                    FormatVersion::V4 => {
                        MagicSet::of_u16(&[XFS_DIR2_LEAF1_MAGIC, XFS_DIR2_LEAFN_MAGIC])
                    }
                    FormatVersion::V5 => {
                        MagicSet::of_u16(&[XFS_DIR3_LEAF1_MAGIC, XFS_DIR3_LEAFN_MAGIC])
                    }
                };
                return Err(ParseError::SignatureMismatch {
                    structure: "dir leaf",
                    expected,
                    actual: Magic::u16(info.magic),
                });
            }
        }

        let count = read_be_u16(bytes, info.size())?;
        let stale = read_be_u16(bytes, info.size() + 2)?;
        let header = LeafHeader { info, count, stale };
        ensure_slice(bytes, 0, header.size())?;
        let entries = parse_leaf_entries(bytes, header.size(), usize::from(count))?;

        Ok(Self { header, entries })
    }

    /// Slots with a live address.
    pub fn live_entries(&self) -> impl Iterator<Item = &LeafEntry> {
        self.entries.iter().filter(|e| !e.is_stale())
    }

    #[must_use]
    pub fn stale_slots(&self) -> usize {
        self.entries.iter().filter(|e| e.is_stale()).count()
    }
}

// ── Shortform directories ───────────────────────────────────────────────────

/// A directory stored inline in the inode's data fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortformDir {
    pub parent: InodeNumber,
    pub entries: Vec<DirectoryEntry>,
}

impl ShortformDir {
    /// Decode the inline form: count, i8count, parent, then packed entries.
    ///
    /// `count` is the number of entries. Inode numbers are 8 bytes wide when
    /// `i8count` is non-zero, 4 otherwise.
    pub fn parse(bytes: &[u8], has_ftype: bool) -> Result<Self, ParseError> {
        let count = read_u8(bytes, 0)?;
        let i8count = read_u8(bytes, 1)?;
        let ino_size = if i8count > 0 { 8 } else { 4 };
        let read_ino = |at: usize| -> Result<u64, ParseError> {
            if ino_size == 8 {
                read_be_u64(bytes, at)
            } else {
                read_be_u32(bytes, at).map(u64::from)
            }
        };

        let parent = InodeNumber(read_ino(2)?);
        let mut cursor = 2 + ino_size;
        let mut entries = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            let start = cursor;
            let namelen = usize::from(read_u8(bytes, cursor)?);
            let tag = read_be_u16(bytes, cursor + 1)?;
            let name = ensure_slice(bytes, cursor + 3, namelen)?.to_vec();
            cursor += 3 + namelen;
            let file_type = if has_ftype {
                let raw = read_u8(bytes, cursor)?;
                cursor += 1;
                Some(DirFileType::from_raw(raw))
            } else {
                None
            };
            let inode = InodeNumber(read_ino(cursor)?);
            cursor += ino_size;

            entries.push(DirectoryEntry {
                name,
                inode,
                tag,
                length: cursor - start,
                file_type,
            });
        }

        Ok(Self { parent, entries })
    }
}

// ── Name hash ───────────────────────────────────────────────────────────────

/// Directory name hash: per byte, `h = rotl(h, 7) ^ c`.
#[must_use]
pub fn dir_name_hash(name: &[u8]) -> u32 {
    name.iter()
        .fold(0_u32, |hash, byte| hash.rotate_left(7) ^ u32::from(*byte))
}
