#![forbid(unsafe_code)]
//! Directory listing and name lookup.
//!
//! Directory space is split into segments by logical byte offset: data
//! blocks below 32 GiB, leaf and dabtree node blocks up to 64 GiB, and the
//! free index above that. Listing reads every data block in extent order and
//! validates every leaf-segment block on the way; lookup hashes the name and
//! follows matching leaf addresses back into the data segment.

use crate::fork::{ForkInfo, ForkKind, ForkLayout};
use crate::{XfsVolume, parse_error_at};
use tracing::{debug, trace, warn};
use xfr_error::{Result, XfrError};
use xfr_ondisk::{
    BtreeKind, DA_CRC_OFFSET, DATA_CRC_OFFSET, DaBlockKind, DaNode, DataBlockHeader, DirFileType,
    DirectoryBlockHeader, DirectoryEntry, Extent, ExtentOffsetIndex, LeafBlock, ShortformDir,
    decode_entry_at, dir_name_hash,
};
use xfr_types::{
    BlockSize, ByteOffset, InodeNumber, XFS_DIR2_DATA_FREE_TAG, XFS_DIR2_FREE_OFFSET,
    XFS_DIR2_LEAF_OFFSET, read_be_u16,
};

/// Extents of a directory fork grouped by segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSegments {
    pub data: Vec<Extent>,
    pub leaf: Vec<Extent>,
    pub free: Vec<Extent>,
}

impl DirSegments {
    /// Classify each extent by the logical byte offset it starts at.
    #[must_use]
    pub fn split(extents: &[Extent], block_size: BlockSize) -> Self {
        let mut segments = Self::default();
        for extent in extents {
            let start = u128::from(extent.start_offset) * u128::from(block_size.get());
            if start < u128::from(XFS_DIR2_LEAF_OFFSET) {
                segments.data.push(*extent);
            } else if start < u128::from(XFS_DIR2_FREE_OFFSET) {
                segments.leaf.push(*extent);
            } else {
                segments.free.push(*extent);
            }
        }
        segments
    }
}

impl XfsVolume {
    /// List every entry of a directory, in on-disk order.
    ///
    /// Shortform directories report synthetic `.` and `..` entries first,
    /// so every layout lists the same names.
    pub fn list_directory(&self, inode: InodeNumber) -> Result<Vec<DirectoryEntry>> {
        let fork = self.forks.fork(inode, ForkKind::Data)?;
        debug!(inode = inode.0, layout = ?fork.layout, version = %fork.version, "list directory");

        let entries = match fork.layout {
            ForkLayout::Local => self.shortform_entries(inode, &fork)?,
            ForkLayout::Extents { .. } | ForkLayout::Btree => {
                let map = self.walker(BtreeKind::Directory).walk(inode, &fork)?;
                let segments = DirSegments::split(&map.extents, self.block_size());
                self.leaf_blocks(inode, &fork, &segments.leaf)?;
                self.data_entries(inode, &fork, &segments.data)?
            }
        };

        debug!(inode = inode.0, entries = entries.len(), "directory listed");
        Ok(entries)
    }

    /// Find one entry by exact name.
    pub fn lookup(&self, inode: InodeNumber, name: &[u8]) -> Result<Option<DirectoryEntry>> {
        let fork = self.forks.fork(inode, ForkKind::Data)?;
        let map = match fork.layout {
            ForkLayout::Local => {
                return Ok(self
                    .shortform_entries(inode, &fork)?
                    .into_iter()
                    .find(|entry| entry.name == name));
            }
            ForkLayout::Extents { .. } | ForkLayout::Btree => {
                self.walker(BtreeKind::Directory).walk(inode, &fork)?
            }
        };

        let segments = DirSegments::split(&map.extents, self.block_size());
        let leaves = self.leaf_blocks(inode, &fork, &segments.leaf)?;
        if leaves.is_empty() {
            trace!(inode = inode.0, "no leaf blocks, linear lookup");
            return Ok(self
                .data_entries(inode, &fork, &segments.data)?
                .into_iter()
                .find(|entry| entry.name == name));
        }

        let hash = dir_name_hash(name);
        let bs = self.block_size();
        let has_ftype = self.has_ftype(fork.version);
        for leaf_entry in leaves
            .iter()
            .flat_map(LeafBlock::live_entries)
            .filter(|entry| entry.hash == hash)
        {
            let logical = leaf_entry.data_byte_offset();
            let dir_block = bs.byte_to_block(logical);
            let within = usize::try_from(logical - (dir_block << bs.shift()))
                .map_err(|_| XfrError::Format("entry offset does not fit usize".to_owned()))?;
            trace!(hash, address = leaf_entry.address, dir_block, within, "leaf candidate");

            let Some(offset) = self.logical_block_offset(&segments.data, dir_block)? else {
                return Err(XfrError::Corruption {
                    offset: fork.offset.0,
                    detail: format!(
                        "leaf address {} points at unmapped directory block {dir_block}",
                        leaf_entry.address
                    ),
                });
            };
            let block = self.read_block(offset)?;
            let header = DataBlockHeader::parse(&block, fork.version)
                .map_err(|e| parse_error_at(offset, &e))?;
            self.check_crc(fork.version, "dir data block", &block, DATA_CRC_OFFSET, offset)?;
            self.check_owner(inode, header.owner(), offset)?;
            if within < header.entries_offset() {
                return Err(XfrError::Corruption {
                    offset: offset.0,
                    detail: format!("leaf address {} points into the block header", leaf_entry.address),
                });
            }
            let tag = read_be_u16(&block, within).map_err(|e| parse_error_at(offset, &e))?;
            if tag == XFS_DIR2_DATA_FREE_TAG {
                return Err(XfrError::Corruption {
                    offset: offset.0,
                    detail: format!("leaf address {} points at unused space", leaf_entry.address),
                });
            }

            let found = decode_entry_at(&block, within, has_ftype)
                .map_err(|e| parse_error_at(offset, &e))?;
            if let Some(entry) = found.filter(|entry| entry.name == name) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Entries of an inline directory, led by `.` and `..`.
    fn shortform_entries(&self, inode: InodeNumber, fork: &ForkInfo) -> Result<Vec<DirectoryEntry>> {
        let literal = self.read_fork(fork)?;
        let has_ftype = self.has_ftype(fork.version);
        let sf = ShortformDir::parse(&literal, has_ftype)
            .map_err(|e| parse_error_at(fork.offset, &e))?;

        let dot = |name: &[u8], target: InodeNumber| DirectoryEntry {
            name: name.to_vec(),
            inode: target,
            tag: 0,
            length: 0,
            file_type: has_ftype.then_some(DirFileType::Dir),
        };
        let mut entries = Vec::with_capacity(sf.entries.len() + 2);
        entries.push(dot(b".", inode));
        entries.push(dot(b"..", sf.parent));
        entries.extend(sf.entries);
        Ok(entries)
    }

    /// Decode and validate every block of the leaf segment.
    ///
    /// Returns the hash-index leaves; dabtree nodes are checked and dropped.
    fn leaf_blocks(
        &self,
        inode: InodeNumber,
        fork: &ForkInfo,
        leaf_extents: &[Extent],
    ) -> Result<Vec<LeafBlock>> {
        let mut leaves = Vec::new();
        for extent in leaf_extents {
            for idx in 0..u64::from(extent.block_count) {
                let offset = self
                    .ag
                    .run_byte_offset(extent.start_block, idx)
                    .map_err(|e| parse_error_at(fork.offset, &e))?;
                let block = self.read_block(offset)?;
                let info = DirectoryBlockHeader::parse(&block, fork.version)
                    .map_err(|e| parse_error_at(offset, &e))?;
                self.check_crc(fork.version, "dir leaf block", &block, DA_CRC_OFFSET, offset)?;
                self.check_owner(inode, info.owner(), offset)?;
                trace!(offset = offset.0, magic = info.magic, kind = ?info.kind(), "leaf segment block");

                match info.kind() {
                    Some(DaBlockKind::DirLeaf1 | DaBlockKind::DirLeafN) => {
                        let leaf = LeafBlock::parse(&block, fork.version)
                            .map_err(|e| parse_error_at(offset, &e))?;
                        if leaf.stale_slots() != usize::from(leaf.header.stale) {
                            warn!(
                                offset = offset.0,
                                stale = leaf.header.stale,
                                zero_slots = leaf.stale_slots(),
                                "leaf stale count disagrees with its entries"
                            );
                        }
                        leaves.push(leaf);
                    }
                    Some(DaBlockKind::Node) => {
                        DaNode::parse(&block, fork.version).map_err(|e| parse_error_at(offset, &e))?;
                    }
                    Some(DaBlockKind::AttrLeaf) => {
                        return Err(XfrError::UnsupportedLayout(format!(
                            "attribute leaf block at offset {} in directory inode {inode}",
                            offset.0
                        )));
                    }
                    None => {
                        return Err(XfrError::Corruption {
                            offset: offset.0,
                            detail: format!("unclassified leaf block magic {:#06x}", info.magic),
                        });
                    }
                }
            }
        }
        Ok(leaves)
    }

    /// Scan every data block in extent order.
    fn data_entries(
        &self,
        inode: InodeNumber,
        fork: &ForkInfo,
        data_extents: &[Extent],
    ) -> Result<Vec<DirectoryEntry>> {
        let bs = self.block_size();
        let index = ExtentOffsetIndex::build(data_extents, bs)
            .map_err(|e| parse_error_at(fork.offset, &e))?;
        let has_ftype = self.has_ftype(fork.version);
        let step = u64::from(bs.get());

        let mut entries = Vec::new();
        let mut pos = 0_u64;
        while pos < index.mapped_len() {
            let window = index.lookup(pos).ok_or_else(|| XfrError::Corruption {
                offset: fork.offset.0,
                detail: format!("mapped directory byte {pos} has no extent"),
            })?;
            let offset = self
                .ag
                .run_byte_offset(window.extent.start_block, bs.byte_to_block(window.delta(pos)))
                .map_err(|e| parse_error_at(fork.offset, &e))?;
            let block = self.read_block(offset)?;
            let before = entries.len();
            self.scan_data_block(inode, fork, &block, offset, has_ftype, &mut entries)?;
            trace!(offset = offset.0, entries = entries.len() - before, "data block");
            pos += step;
        }
        Ok(entries)
    }

    fn scan_data_block(
        &self,
        inode: InodeNumber,
        fork: &ForkInfo,
        block: &[u8],
        offset: ByteOffset,
        has_ftype: bool,
        out: &mut Vec<DirectoryEntry>,
    ) -> Result<()> {
        let header =
            DataBlockHeader::parse(block, fork.version).map_err(|e| parse_error_at(offset, &e))?;
        self.check_crc(fork.version, "dir data block", block, DATA_CRC_OFFSET, offset)?;
        self.check_owner(inode, header.owner(), offset)?;
        let scanner = header
            .scan(block, has_ftype)
            .map_err(|e| parse_error_at(offset, &e))?;
        for entry in scanner {
            out.push(entry.map_err(|e| parse_error_at(offset, &e))?);
        }
        Ok(())
    }
}
