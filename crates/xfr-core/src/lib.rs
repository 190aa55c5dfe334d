#![forbid(unsafe_code)]
//! XFS traversal engine.
//!
//! `XfsVolume` ties a byte device, the volume geometry, and a fork metadata
//! provider together and exposes the read operations callers need:
//! resolving file offsets through extent maps, listing directories, listing
//! extended attributes, and looking up a single directory entry by name.
//!
//! Every operation is synchronous and all-or-nothing: the first decode or
//! device failure aborts the call and no partial result is returned.
//!
//! ```ignore
//! let dev = FileByteDevice::open("/path/to/xfs.img")?;
//! let geometry = XfsGeometry::new(4096, 65536, 16);
//! let volume = XfsVolume::new(dev, geometry, forks)?;
//! for entry in volume.list_directory(InodeNumber(128))? {
//!     println!("{} -> {}", entry.name_str(), entry.inode);
//! }
//! ```

pub mod attr;
pub mod dir;
pub mod fork;
pub mod geometry;
pub mod walker;

pub use fork::{ForkInfo, ForkKind, ForkLayout, ForkProvider, StaticForkTable};
pub use geometry::{WalkOptions, XfsGeometry};
pub use walker::{ExtentMap, WalkMode};
pub use xfr_block::{ByteDevice, FileByteDevice, MemoryByteDevice};
pub use xfr_error::{Result, XfrError};
pub use xfr_ondisk::{BtreeKind, DirFileType, DirectoryEntry, Extent, ExtentState};
pub use xfr_types::{BlockNumber, BlockSize, ByteOffset, FormatVersion, InodeNumber};

use serde::{Deserialize, Serialize};
use tracing::trace;
use walker::ForkWalker;
use xfr_block::read_region;
use xfr_ondisk::{AgGeometry, ExtentOffsetIndex, find_extent_for_block, verify_block_crc};
use xfr_types::{ParseError, u64_to_usize};

// ── Error mapping ───────────────────────────────────────────────────────────

/// Convert a decoder error into the runtime taxonomy, attaching the device
/// offset of the structure that failed to decode.
#[must_use]
pub fn parse_error_at(offset: ByteOffset, e: &ParseError) -> XfrError {
    match e {
        ParseError::SignatureMismatch { .. } => XfrError::SignatureMismatch {
            offset: offset.0,
            detail: e.to_string(),
        },
        ParseError::ChecksumMismatch { .. } => XfrError::ChecksumMismatch {
            offset: offset.0,
            detail: e.to_string(),
        },
        ParseError::Unsupported { .. } => XfrError::UnsupportedLayout(e.to_string()),
        ParseError::InsufficientData { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => XfrError::Corruption {
            offset: offset.0,
            detail: e.to_string(),
        },
    }
}

/// Check the CRC of a v5 block when `options` ask for it. v4 blocks pass.
pub(crate) fn check_crc(
    options: WalkOptions,
    version: FormatVersion,
    structure: &'static str,
    block: &[u8],
    crc_offset: usize,
    offset: ByteOffset,
) -> Result<()> {
    if !options.verify_checksums || !version.is_v5() {
        return Ok(());
    }
    verify_block_crc(structure, block, crc_offset).map_err(|e| parse_error_at(offset, &e))
}

// ── Offset resolution ───────────────────────────────────────────────────────

/// Find the extent whose window in the fork's mapped byte stream contains
/// `mapped_offset`.
///
/// Windows are laid end to end in extent order, so offsets here count only
/// mapped bytes. Returns `Ok(None)` past the last window.
pub fn resolve_offset(
    extents: &[Extent],
    mapped_offset: u64,
    block_size: BlockSize,
) -> Result<Option<Extent>> {
    let index = ExtentOffsetIndex::build(extents, block_size)
        .map_err(|e| parse_error_at(ByteOffset::ZERO, &e))?;
    Ok(index.lookup(mapped_offset).map(|window| window.extent))
}

/// A logical file offset resolved to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedOffset {
    pub extent: Extent,
    pub device_offset: ByteOffset,
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// An XFS volume opened for read-only traversal.
pub struct XfsVolume {
    pub(crate) dev: Box<dyn ByteDevice>,
    pub(crate) geometry: XfsGeometry,
    pub(crate) ag: AgGeometry,
    pub(crate) forks: Box<dyn ForkProvider>,
    pub(crate) options: WalkOptions,
}

impl std::fmt::Debug for XfsVolume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XfsVolume")
            .field("geometry", &self.geometry)
            .field("options", &self.options)
            .field("dev_len", &self.dev.len_bytes())
            .finish_non_exhaustive()
    }
}

impl XfsVolume {
    /// Validate `geometry` and bind it to `dev` and `forks`.
    pub fn new(
        dev: impl ByteDevice + 'static,
        geometry: XfsGeometry,
        forks: impl ForkProvider + 'static,
    ) -> Result<Self> {
        let ag = geometry.validate()?;
        Ok(Self {
            dev: Box::new(dev),
            geometry,
            ag,
            forks: Box::new(forks),
            options: WalkOptions::default(),
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: WalkOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn geometry(&self) -> &XfsGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn options(&self) -> WalkOptions {
        self.options
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.ag.block_size
    }

    /// Walk the block map of one fork using the magics of `tree`.
    pub fn walk_fork(&self, inode: InodeNumber, kind: ForkKind, tree: BtreeKind) -> Result<ExtentMap> {
        let fork = self.forks.fork(inode, kind)?;
        self.walker(tree).walk(inode, &fork)
    }

    /// Extent list of a regular file's data fork.
    pub fn file_extents(&self, inode: InodeNumber) -> Result<Vec<Extent>> {
        Ok(self
            .walk_fork(inode, ForkKind::Data, BtreeKind::DataExtents)?
            .extents)
    }

    /// Map a logical byte offset of a regular file to the device.
    ///
    /// Returns `Ok(None)` for offsets inside a hole or past the last extent.
    pub fn resolve_file_offset(
        &self,
        inode: InodeNumber,
        file_offset: u64,
    ) -> Result<Option<MappedOffset>> {
        let extents = self.file_extents(inode)?;
        let bs = self.block_size();
        let Some(extent) = extents.iter().find(|ext| ext.covers(file_offset, bs)) else {
            return Ok(None);
        };
        let logical_block = bs.byte_to_block(file_offset);
        let within = file_offset - (logical_block << bs.shift());
        let block_offset = self
            .ag
            .run_byte_offset(extent.start_block, logical_block - extent.start_offset)
            .map_err(|e| parse_error_at(ByteOffset::ZERO, &e))?;
        let device_offset = block_offset
            .checked_add(within)
            .ok_or_else(|| XfrError::Format("device offset overflows u64".to_owned()))?;
        Ok(Some(MappedOffset {
            extent: *extent,
            device_offset,
        }))
    }

    // ── Internal helpers ────────────────────────────────────────────────────

    pub(crate) fn walker(&self, tree: BtreeKind) -> ForkWalker<'_> {
        ForkWalker {
            dev: self.dev.as_ref(),
            ag: self.ag,
            magics: self.geometry.btree_magics.pair(tree),
            options: self.options,
        }
    }

    pub(crate) fn block_len(&self) -> usize {
        // BlockSize is at most 64 KiB.
        usize::try_from(self.ag.block_size.get()).unwrap_or(usize::MAX)
    }

    pub(crate) fn read_block(&self, offset: ByteOffset) -> Result<Vec<u8>> {
        read_region(self.dev.as_ref(), offset, self.block_len())
    }

    pub(crate) fn read_fork(&self, fork: &ForkInfo) -> Result<Vec<u8>> {
        let size = u64_to_usize(u64::from(fork.size), "fork size")
            .map_err(|e| parse_error_at(fork.offset, &e))?;
        read_region(self.dev.as_ref(), fork.offset, size)
    }

    /// Device offset of logical fork block `block`, or `None` in a hole.
    pub(crate) fn logical_block_offset(
        &self,
        extents: &[Extent],
        block: u64,
    ) -> Result<Option<ByteOffset>> {
        let Some(extent) = find_extent_for_block(extents, block) else {
            return Ok(None);
        };
        let offset = self
            .ag
            .run_byte_offset(extent.start_block, block - extent.start_offset)
            .map_err(|e| parse_error_at(ByteOffset::ZERO, &e))?;
        trace!(block, start_block = extent.start_block.0, offset = offset.0, "logical block");
        Ok(Some(offset))
    }

    pub(crate) fn check_crc(
        &self,
        version: FormatVersion,
        structure: &'static str,
        block: &[u8],
        crc_offset: usize,
        offset: ByteOffset,
    ) -> Result<()> {
        check_crc(self.options, version, structure, block, crc_offset, offset)
    }

    /// v5 blocks must name the inode they belong to.
    pub(crate) fn check_owner(
        &self,
        inode: InodeNumber,
        owner: Option<u64>,
        offset: ByteOffset,
    ) -> Result<()> {
        match owner {
            Some(owner) if self.options.verify_owner && owner != inode.0 => {
                Err(XfrError::Corruption {
                    offset: offset.0,
                    detail: format!("block owned by inode {owner}, not {inode}"),
                })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn has_ftype(&self, version: FormatVersion) -> bool {
        version.is_v5() || self.geometry.dir_ftype
    }
}
