#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── XFS signatures ──────────────────────────────────────────────────────────

/// Long-form block-map B+tree block, v4 ("BMAP").
pub const XFS_BMAP_MAGIC: u32 = 0x424D_4150;
/// Long-form block-map B+tree block, v5 ("BMA3").
pub const XFS_BMAP_CRC_MAGIC: u32 = 0x424D_4133;

/// Single-block directory, v4 ("XD2B").
pub const XFS_DIR2_BLOCK_MAGIC: u32 = 0x5844_3242;
/// Single-block directory, v5 ("XDB3").
pub const XFS_DIR3_BLOCK_MAGIC: u32 = 0x5844_4233;
/// Multi-block directory data block, v4 ("XD2D").
pub const XFS_DIR2_DATA_MAGIC: u32 = 0x5844_3244;
/// Multi-block directory data block, v5 ("XDD3").
pub const XFS_DIR3_DATA_MAGIC: u32 = 0x5844_4433;

/// Leaf-format directory leaf block, v4.
pub const XFS_DIR2_LEAF1_MAGIC: u16 = 0xD2F1;
/// Leaf-format directory leaf block, v5.
pub const XFS_DIR3_LEAF1_MAGIC: u16 = 0x3DF1;
/// Node-format directory leaf block, v4.
pub const XFS_DIR2_LEAFN_MAGIC: u16 = 0xD2FF;
/// Node-format directory leaf block, v5.
pub const XFS_DIR3_LEAFN_MAGIC: u16 = 0x3DFF;
/// Dabtree interior node, v4.
pub const XFS_DA_NODE_MAGIC: u16 = 0xFEBE;
/// Dabtree interior node, v5.
pub const XFS_DA3_NODE_MAGIC: u16 = 0x3EBE;
/// Attribute leaf block, v4.
pub const XFS_ATTR_LEAF_MAGIC: u16 = 0xFBEE;
/// Attribute leaf block, v5.
pub const XFS_ATTR3_LEAF_MAGIC: u16 = 0x3BEE;

/// Free-space tag marking an unused region inside a directory data block.
pub const XFS_DIR2_DATA_FREE_TAG: u16 = 0xFFFF;

/// Start of the leaf segment in directory address space (32 GiB).
pub const XFS_DIR2_LEAF_OFFSET: u64 = 1 << 35;
/// Start of the free-index segment in directory address space (64 GiB).
pub const XFS_DIR2_FREE_OFFSET: u64 = 2 << 35;

/// Directory entries are aligned to this many bytes.
pub const XFS_DIR2_DATA_ALIGN: usize = 8;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Filesystem block number as stored on disk (AG number in the high bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgNumber(pub u32);

/// Validated block size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> u64 {
        byte_offset >> u64::from(self.shift())
    }

    /// Convert a block count to bytes, returning `None` on overflow.
    #[must_use]
    pub fn blocks_to_bytes(self, blocks: u64) -> Option<u64> {
        blocks.checked_mul(u64::from(self.0))
    }
}

/// Byte offset on a `ByteDevice` (pread semantics).
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

/// On-disk format generation.
///
/// V5 filesystems carry self-describing metadata (CRC, block number, LSN,
/// UUID, owner) in every header; V4 headers stop after the shared prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatVersion {
    V4,
    V5,
}

impl FormatVersion {
    #[must_use]
    pub fn is_v5(self) -> bool {
        matches!(self, Self::V5)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("v4"),
            Self::V5 => f.write_str("v5"),
        }
    }
}

// ── Signatures ──────────────────────────────────────────────────────────────

/// A magic value together with its on-disk width (2 or 4 bytes).
///
/// Renders as ASCII when every byte is printable (`BMA3`), as hex otherwise
/// (`0x3df1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Magic {
    pub value: u32,
    pub width: u8,
}

impl Magic {
    #[must_use]
    pub fn u16(value: u16) -> Self {
        Self {
            value: u32::from(value),
            width: 2,
        }
    }

    #[must_use]
    pub fn u32(value: u32) -> Self {
        Self { value, width: 4 }
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.value.to_be_bytes();
        let shown = &bytes[4 - usize::from(self.width.min(4))..];
        if shown.iter().all(|b| b.is_ascii_graphic()) {
            for b in shown {
                write!(f, "{}", char::from(*b))?;
            }
            Ok(())
        } else if self.width == 2 {
            write!(f, "{:#06x}", self.value)
        } else {
            write!(f, "{:#010x}", self.value)
        }
    }
}

/// The accepted set of magics for one structure and version (at most four).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicSet {
    values: [u32; 4],
    len: u8,
    width: u8,
}

impl MagicSet {
    /// Build a set of 4-byte magics. Values beyond the fourth are ignored.
    #[must_use]
    pub const fn of_u32(values: &[u32]) -> Self {
        let mut out = [0_u32; 4];
        let mut idx = 0;
        while idx < values.len() && idx < 4 {
            out[idx] = values[idx];
            idx += 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        Self {
            values: out,
            len: idx as u8,
            width: 4,
        }
    }

    /// Build a set of 2-byte magics. Values beyond the fourth are ignored.
    #[must_use]
    pub const fn of_u16(values: &[u16]) -> Self {
        let mut out = [0_u32; 4];
        let mut idx = 0;
        while idx < values.len() && idx < 4 {
            out[idx] = values[idx] as u32;
            idx += 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        Self {
            values: out,
            len: idx as u8,
            width: 2,
        }
    }

    #[must_use]
    pub fn values(&self) -> &[u32] {
        &self.values[..usize::from(self.len)]
    }

    #[must_use]
    pub fn contains(&self, value: u32) -> bool {
        self.values().contains(&value)
    }
}

impl fmt::Display for MagicSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, value) in self.values().iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(
                f,
                "{}",
                Magic {
                    value: *value,
                    width: self.width
                }
            )?;
        }
        f.write_str("}")
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("{structure} signature mismatch: expected one of {expected}, got {actual}")]
    SignatureMismatch {
        structure: &'static str,
        expected: MagicSet,
        actual: Magic,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unsupported {structure}: {reason}")]
    Unsupported {
        structure: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
    #[error("{structure} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },
}

impl ParseError {
    /// Check a 32-bit magic against its accepted set.
    pub fn check_magic_u32(
        structure: &'static str,
        expected: MagicSet,
        actual: u32,
    ) -> Result<(), Self> {
        if expected.contains(actual) {
            Ok(())
        } else {
            Err(Self::SignatureMismatch {
                structure,
                expected,
                actual: Magic::u32(actual),
            })
        }
    }

    /// Check a 16-bit magic against its accepted set.
    pub fn check_magic_u16(
        structure: &'static str,
        expected: MagicSet,
        actual: u16,
    ) -> Result<(), Self> {
        if expected.contains(u32::from(actual)) {
            Ok(())
        } else {
            Err(Self::SignatureMismatch {
                structure,
                expected,
                actual: Magic::u16(actual),
            })
        }
    }
}

// ── Byte readers ────────────────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// CRC fields of v5 headers are the one little-endian value in XFS metadata.
#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: usize, alignment: usize) -> Option<usize> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
///
/// On 64-bit platforms this is infallible; on 32-bit it can fail.
/// The `field` label is included in the error for diagnostics.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x12_u8, 0x34, 0x56, 0x78, 0x90, 0xAB, 0xCD, 0xEF];
        assert_eq!(read_be_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_be_u32(&bytes, 0).expect("u32"), 0x1234_5678);
        assert_eq!(read_be_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_be_u64(&bytes, 0).expect("u64"), 0x1234_5678_90AB_CDEF);
        assert_eq!(read_u8(&bytes, 7).expect("u8"), 0xEF);
        assert_eq!(read_le_u32(&bytes, 0).expect("le u32"), 0x7856_3412);
    }

    #[test]
    fn test_read_past_end_reports_shortfall() {
        let bytes = [0_u8; 6];
        let err = read_be_u64(&bytes, 2).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 8,
                offset: 2,
                actual: 4,
            }
        );
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().shift(), 12);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_block_size_conversions() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.byte_to_block(4095), 0);
        assert_eq!(bs.byte_to_block(8192), 2);
        assert_eq!(bs.blocks_to_bytes(100), Some(409_600));
        assert_eq!(bs.blocks_to_bytes(u64::MAX), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(60, 8), Some(64));
        assert_eq!(align_up(64, 8), Some(64));
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(5, 3), None);
        assert_eq!(align_up(usize::MAX, 8), None);
    }

    #[test]
    fn magic_renders_ascii_or_hex() {
        assert_eq!(Magic::u32(XFS_BMAP_CRC_MAGIC).to_string(), "BMA3");
        assert_eq!(Magic::u32(XFS_DIR2_DATA_MAGIC).to_string(), "XD2D");
        assert_eq!(Magic::u16(XFS_DIR3_LEAF1_MAGIC).to_string(), "0x3df1");
        assert_eq!(Magic::u32(0).to_string(), "0x00000000");
    }

    #[test]
    fn signature_mismatch_lists_expected_set() {
        let set = MagicSet::of_u32(&[XFS_BMAP_MAGIC, XFS_BMAP_CRC_MAGIC]);
        let err = ParseError::check_magic_u32("bmbt block", set, 0x5846_5342).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bmbt block signature mismatch: expected one of {BMAP, BMA3}, got XFSB"
        );
        assert!(ParseError::check_magic_u32("bmbt block", set, XFS_BMAP_MAGIC).is_ok());
    }

    #[test]
    fn magic_set_of_u16_renders_hex() {
        let set = MagicSet::of_u16(&[XFS_DIR3_LEAF1_MAGIC, XFS_DIR3_LEAFN_MAGIC]);
        assert_eq!(set.values(), &[0x3DF1, 0x3DFF]);
        assert_eq!(set.to_string(), "{0x3df1, 0x3dff}");
        assert!(set.contains(0x3DFF));
        assert!(!set.contains(0xD2FF));
    }

    #[test]
    fn test_format_version_display() {
        assert_eq!(FormatVersion::V4.to_string(), "v4");
        assert!(FormatVersion::V5.is_v5());
        assert!(!FormatVersion::V4.is_v5());
    }
}
