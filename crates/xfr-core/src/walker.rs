#![forbid(unsafe_code)]
//! Fork block-map walker.
//!
//! Turns an inode fork into its ordered extent list. Inline extent forks are
//! decoded in place. B+tree forks start at the root in the inode literal
//! area: a level-0 root holds the extent records itself, otherwise its child
//! pointers are followed with an explicit work-list until every leaf has been
//! visited, left to right.

use crate::fork::{ForkInfo, ForkLayout};
use crate::geometry::WalkOptions;
use crate::{check_crc, parse_error_at};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, trace};
use xfr_block::{ByteDevice, read_region};
use xfr_error::{Result, XfrError};
use xfr_ondisk::{
    AgGeometry, BTREE_CRC_OFFSET, BtreeNodeHeader, EXTENT_RECORD_SIZE, Extent, MagicPair,
    leaf_extents, node_child_pointers, node_keys, parse_extent_list,
};
use xfr_types::{BlockNumber, ByteOffset, FormatVersion, InodeNumber, Magic, u64_to_usize};

/// How the extent list of a fork was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalkMode {
    /// Extent records stored inline in the inode.
    Inline,
    /// B+tree root at level 0: records read straight from the root.
    Direct,
    /// B+tree with interior levels; `depth` is the root level.
    Tree { depth: u16 },
}

/// Result of walking one fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentMap {
    pub extents: Vec<Extent>,
    pub mode: WalkMode,
    /// B+tree blocks read from the device (the inode root is not counted).
    pub blocks_visited: usize,
}

pub(crate) struct ForkWalker<'a> {
    pub dev: &'a dyn ByteDevice,
    pub ag: AgGeometry,
    pub magics: MagicPair,
    pub options: WalkOptions,
}

impl ForkWalker<'_> {
    pub fn walk(&self, inode: InodeNumber, fork: &ForkInfo) -> Result<ExtentMap> {
        let size = u64_to_usize(u64::from(fork.size), "fork size")
            .map_err(|e| parse_error_at(fork.offset, &e))?;
        let literal = read_region(self.dev, fork.offset, size)?;

        let map = match fork.layout {
            ForkLayout::Local => {
                return Err(XfrError::UnsupportedLayout(format!(
                    "local fork of inode {inode} has no block map"
                )));
            }
            ForkLayout::Extents { count } => {
                let count = u64_to_usize(u64::from(count), "extent count")
                    .map_err(|e| parse_error_at(fork.offset, &e))?;
                if count.saturating_mul(EXTENT_RECORD_SIZE) > literal.len() {
                    return Err(XfrError::Corruption {
                        offset: fork.offset.0,
                        detail: format!("{count} extent records exceed fork size {size}"),
                    });
                }
                let extents = parse_extent_list(&literal, 0, count)
                    .map_err(|e| parse_error_at(fork.offset, &e))?;
                ExtentMap {
                    extents,
                    mode: WalkMode::Inline,
                    blocks_visited: 0,
                }
            }
            ForkLayout::Btree => self.walk_tree(inode, fork, &literal)?,
        };

        check_ordered(&map.extents, fork.offset)?;
        debug!(
            inode = inode.0,
            mode = ?map.mode,
            extents = map.extents.len(),
            blocks = map.blocks_visited,
            "fork walked"
        );
        Ok(map)
    }

    fn walk_tree(&self, inode: InodeNumber, fork: &ForkInfo, root_area: &[u8]) -> Result<ExtentMap> {
        let root = BtreeNodeHeader::parse(root_area, self.magics)
            .map_err(|e| parse_error_at(fork.offset, &e))?;
        check_version(&root, fork.version, fork.offset)?;
        // The root lives in the inode literal area and has no block CRC.
        debug!(
            inode = inode.0,
            level = root.level,
            numrecs = root.numrecs,
            "bmbt root"
        );

        if root.level > self.options.max_depth {
            return Err(XfrError::UnsupportedLayout(format!(
                "bmbt root level {} exceeds supported depth {}",
                root.level, self.options.max_depth
            )));
        }

        if root.is_leaf() {
            let extents =
                leaf_extents(root_area, &root).map_err(|e| parse_error_at(fork.offset, &e))?;
            return Ok(ExtentMap {
                extents,
                mode: WalkMode::Direct,
                blocks_visited: 0,
            });
        }

        let children =
            node_child_pointers(root_area, &root).map_err(|e| parse_error_at(fork.offset, &e))?;
        check_keys(root_area, &root, fork.offset)?;
        let mut stack: Vec<(BlockNumber, u16)> = children
            .into_iter()
            .rev()
            .map(|child| (child, root.level - 1))
            .collect();
        let mut visited = HashSet::new();
        let mut extents = Vec::new();
        let block_len = usize::try_from(self.ag.block_size.get())
            .map_err(|_| XfrError::Format("block size does not fit usize".to_owned()))?;

        while let Some((ptr, level)) = stack.pop() {
            if !visited.insert(ptr) {
                return Err(XfrError::Corruption {
                    offset: fork.offset.0,
                    detail: format!("bmbt block {ptr} reached twice"),
                });
            }

            let offset = self
                .ag
                .byte_offset(ptr)
                .map_err(|e| parse_error_at(fork.offset, &e))?;
            let block = read_region(self.dev, offset, block_len)?;
            let hdr = BtreeNodeHeader::parse(&block, self.magics)
                .map_err(|e| parse_error_at(offset, &e))?;
            check_version(&hdr, fork.version, offset)?;
            check_crc(self.options, hdr.version, "bmbt block", &block, BTREE_CRC_OFFSET, offset)?;
            let (ag_number, ag_block) = self.ag.split(ptr);
            trace!(
                block = ptr.0,
                ag = ag_number.0,
                ag_block,
                offset = offset.0,
                level = hdr.level,
                numrecs = hdr.numrecs,
                "bmbt block"
            );

            if hdr.level != level {
                return Err(XfrError::Corruption {
                    offset: offset.0,
                    detail: format!("bmbt block at level {} where {level} expected", hdr.level),
                });
            }
            if self.options.verify_owner {
                if let Some(owner) = hdr.owner() {
                    if owner != inode.0 {
                        return Err(XfrError::Corruption {
                            offset: offset.0,
                            detail: format!("bmbt block owned by inode {owner}, not {inode}"),
                        });
                    }
                }
            }

            if hdr.is_leaf() {
                extents.extend(leaf_extents(&block, &hdr).map_err(|e| parse_error_at(offset, &e))?);
            } else {
                debug!(block = ptr.0, level, numrecs = hdr.numrecs, "bmbt node");
                let children =
                    node_child_pointers(&block, &hdr).map_err(|e| parse_error_at(offset, &e))?;
                check_keys(&block, &hdr, offset)?;
                stack.extend(children.into_iter().rev().map(|child| (child, level - 1)));
            }
        }

        Ok(ExtentMap {
            extents,
            mode: WalkMode::Tree { depth: root.level },
            blocks_visited: visited.len(),
        })
    }
}

/// A block's magic must belong to the same generation as its fork.
fn check_version(hdr: &BtreeNodeHeader, expected: FormatVersion, offset: ByteOffset) -> Result<()> {
    if hdr.version == expected {
        return Ok(());
    }
    Err(XfrError::SignatureMismatch {
        offset: offset.0,
        detail: format!(
            "bmbt block magic {} is {} but the fork is {expected}",
            Magic::u32(hdr.magic),
            hdr.version
        ),
    })
}

/// Interior node keys must be strictly increasing logical offsets.
fn check_keys(block: &[u8], hdr: &BtreeNodeHeader, offset: ByteOffset) -> Result<()> {
    let keys = node_keys(block, hdr).map_err(|e| parse_error_at(offset, &e))?;
    if let Some(pair) = keys.windows(2).find(|pair| pair[1] <= pair[0]) {
        return Err(XfrError::Corruption {
            offset: offset.0,
            detail: format!("bmbt key {} follows key {}", pair[1], pair[0]),
        });
    }
    Ok(())
}

/// Extents must be sorted by logical offset and must not overlap.
fn check_ordered(extents: &[Extent], fork_offset: ByteOffset) -> Result<()> {
    for pair in extents.windows(2) {
        let end = u128::from(pair[0].start_offset) + u128::from(pair[0].block_count);
        if u128::from(pair[1].start_offset) < end {
            return Err(XfrError::Corruption {
                offset: fork_offset.0,
                detail: format!(
                    "extent at logical block {} overlaps or precedes the one before it",
                    pair[1].start_offset
                ),
            });
        }
    }
    Ok(())
}
