#![forbid(unsafe_code)]
//! Inode fork metadata supplied by the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use xfr_error::{Result, XfrError};
use xfr_types::{ByteOffset, FormatVersion, InodeNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForkKind {
    Data,
    Attr,
}

/// How a fork's contents are stored in the inode literal area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkLayout {
    /// Contents inline (shortform directory or attribute list).
    Local,
    /// `count` packed extent records inline.
    Extents { count: u32 },
    /// Long-form B+tree root inline.
    Btree,
}

/// Location and layout of one inode fork on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkInfo {
    /// Device byte offset of the fork's literal area.
    pub offset: ByteOffset,
    /// Size of the literal area in bytes.
    pub size: u32,
    pub layout: ForkLayout,
    pub version: FormatVersion,
}

/// Source of fork metadata; typically backed by an inode table reader.
pub trait ForkProvider: Send + Sync {
    fn fork(&self, inode: InodeNumber, kind: ForkKind) -> Result<ForkInfo>;
}

/// In-memory fork table, for callers that already decoded their inodes.
#[derive(Debug, Clone, Default)]
pub struct StaticForkTable {
    forks: HashMap<(InodeNumber, ForkKind), ForkInfo>,
}

impl StaticForkTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, inode: InodeNumber, kind: ForkKind, info: ForkInfo) {
        self.forks.insert((inode, kind), info);
    }

    #[must_use]
    pub fn with(mut self, inode: InodeNumber, kind: ForkKind, info: ForkInfo) -> Self {
        self.insert(inode, kind, info);
        self
    }
}

impl ForkProvider for StaticForkTable {
    fn fork(&self, inode: InodeNumber, kind: ForkKind) -> Result<ForkInfo> {
        self.forks
            .get(&(inode, kind))
            .copied()
            .ok_or_else(|| XfrError::NotFound(format!("{kind:?} fork of inode {inode}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_returns_inserted_forks() {
        let info = ForkInfo {
            offset: ByteOffset(8192 + 176),
            size: 336,
            layout: ForkLayout::Extents { count: 2 },
            version: FormatVersion::V5,
        };
        let table = StaticForkTable::new().with(InodeNumber(131), ForkKind::Data, info);

        assert_eq!(table.fork(InodeNumber(131), ForkKind::Data).expect("fork"), info);
        let err = table.fork(InodeNumber(131), ForkKind::Attr).unwrap_err();
        assert_eq!(err.to_string(), "not found: Attr fork of inode 131");
    }
}
