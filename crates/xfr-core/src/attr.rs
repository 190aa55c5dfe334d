#![forbid(unsafe_code)]
//! Extended attribute listing.

use crate::fork::{ForkKind, ForkLayout};
use crate::{XfsVolume, parse_error_at};
use std::collections::HashSet;
use tracing::{debug, trace};
use xfr_error::{Result, XfrError};
use xfr_ondisk::{
    AttrLeafBlock, BtreeKind, DA_CRC_OFFSET, DaBlockKind, DaNode, DirectoryBlockHeader,
    DirectoryEntry,
};
use xfr_types::{InodeNumber, Magic};

impl XfsVolume {
    /// List the attribute names of an inode, namespace-prefixed.
    ///
    /// Block 0 of the attribute fork is either a single attribute leaf or the
    /// root of a dabtree whose leaves are visited left to right. Entries
    /// still being written (`INCOMPLETE`) are skipped. The returned entries
    /// carry the owning inode and the name record's offset as `tag`.
    pub fn list_attributes(&self, inode: InodeNumber) -> Result<Vec<DirectoryEntry>> {
        let fork = self.forks.fork(inode, ForkKind::Attr)?;
        debug!(inode = inode.0, layout = ?fork.layout, "list attributes");
        if fork.layout == ForkLayout::Local {
            return Err(XfrError::UnsupportedLayout(format!(
                "shortform attribute fork of inode {inode}"
            )));
        }

        let map = self.walker(BtreeKind::Directory).walk(inode, &fork)?;
        if map.extents.is_empty() {
            return Ok(Vec::new());
        }

        // (logical block, level the block must have; None for the root)
        let mut stack: Vec<(u64, Option<u16>)> = vec![(0, None)];
        let mut visited = HashSet::new();
        let mut out = Vec::new();

        while let Some((lblk, expected_level)) = stack.pop() {
            if !visited.insert(lblk) {
                return Err(XfrError::Corruption {
                    offset: fork.offset.0,
                    detail: format!("attribute block {lblk} reached twice"),
                });
            }
            let offset = self
                .logical_block_offset(&map.extents, lblk)?
                .ok_or_else(|| XfrError::Corruption {
                    offset: fork.offset.0,
                    detail: format!("attribute block {lblk} is not mapped"),
                })?;
            let block = self.read_block(offset)?;
            let info = DirectoryBlockHeader::parse(&block, fork.version)
                .map_err(|e| parse_error_at(offset, &e))?;
            self.check_crc(fork.version, "attribute block", &block, DA_CRC_OFFSET, offset)?;
            self.check_owner(inode, info.owner(), offset)?;

            match info.kind() {
                Some(DaBlockKind::Node) => {
                    let node =
                        DaNode::parse(&block, fork.version).map_err(|e| parse_error_at(offset, &e))?;
                    if node.level == 0 || expected_level.is_some_and(|lvl| lvl != node.level) {
                        return Err(XfrError::Corruption {
                            offset: offset.0,
                            detail: format!("dabtree node at unexpected level {}", node.level),
                        });
                    }
                    if node.level > self.options.max_depth {
                        return Err(XfrError::UnsupportedLayout(format!(
                            "dabtree level {} exceeds supported depth {}",
                            node.level, self.options.max_depth
                        )));
                    }
                    debug!(block = lblk, level = node.level, count = node.count, "dabtree node");
                    let child_level = node.level - 1;
                    stack.extend(
                        node.entries
                            .iter()
                            .rev()
                            .map(|entry| (u64::from(entry.before), Some(child_level))),
                    );
                }
                Some(DaBlockKind::AttrLeaf) => {
                    if expected_level.is_some_and(|lvl| lvl != 0) {
                        return Err(XfrError::Corruption {
                            offset: offset.0,
                            detail: "attribute leaf where a dabtree node was expected".to_owned(),
                        });
                    }
                    let leaf = AttrLeafBlock::parse(&block, fork.version)
                        .map_err(|e| parse_error_at(offset, &e))?;
                    let names = leaf.names(&block).map_err(|e| parse_error_at(offset, &e))?;
                    trace!(block = lblk, count = leaf.header.count, names = names.len(), "attr leaf");
                    out.extend(names.into_iter().map(|name| DirectoryEntry {
                        length: name.record_len(),
                        tag: name.name_index,
                        name: name.full_name(),
                        inode,
                        file_type: None,
                    }));
                }
                _ => {
                    return Err(XfrError::SignatureMismatch {
                        offset: offset.0,
                        detail: format!(
                            "attribute fork block magic {} is neither a leaf nor a node",
                            Magic::u16(info.magic)
                        ),
                    });
                }
            }
        }

        debug!(inode = inode.0, attributes = out.len(), "attributes listed");
        Ok(out)
    }
}
