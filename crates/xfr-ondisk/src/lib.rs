#![forbid(unsafe_code)]
//! On-disk format parsing for XFS block-mapping and directory structures.
//!
//! Pure parsing crate: no I/O, no side effects. Decodes byte slices into
//! typed structures for packed extent records, allocation-group address
//! translation, long-form B+tree blocks, dabtree block headers, directory
//! data and leaf blocks, shortform directories, and attribute leaf blocks,
//! plus the CRC32C that seals each v5 block.
//!
//! Every header that exists in two generations is one type carrying a
//! `FormatVersion` tag plus an optional v5 tail; the shared prefix is read
//! first and the tail only when the version calls for it.

pub mod address;
pub mod attr;
pub mod btree;
pub mod checksum;
pub mod dablk;
pub mod dir;
pub mod extent;

pub use address::AgGeometry;
pub use attr::{AttrLeafBlock, AttrLeafEntry, AttrLeafHeader, AttrName, AttrNamespace, AttrValue};
pub use btree::{
    BtreeKind, BtreeMagics, BtreeNodeHeader, BtreeV5Tail, MagicPair, leaf_extents,
    node_child_pointers, node_keys,
};
pub use checksum::{
    BTREE_CRC_OFFSET, DA_CRC_OFFSET, DATA_CRC_OFFSET, block_crc, seal_block, verify_block_crc,
};
pub use dablk::{DaBlockKind, DaNode, DaNodeEntry, DirectoryBlockHeader, is_attr_leaf_block};
pub use dir::{
    BlockTail, DataBlockHeader, DirEntryScanner, DirFileType, DirectoryEntry,
    FreeSpaceDescriptor, LeafBlock, LeafEntry, LeafHeader, ShortformDir, decode_entry_at,
    dir_name_hash,
};
pub use extent::{
    EXTENT_RECORD_SIZE, Extent, ExtentOffsetIndex, ExtentState, IndexWindow,
    find_extent_for_block, parse_extent_list,
};
