#![forbid(unsafe_code)]
//! CRC32C of v5 metadata blocks.
//!
//! Every v5 block stores the CRC32C of the whole block, computed with its
//! own checksum field zeroed, as a little-endian word. v4 blocks carry no
//! checksum.

use xfr_types::{ParseError, ensure_slice, read_le_u32};

/// `bb_crc` of a long-form B+tree block.
pub const BTREE_CRC_OFFSET: usize = 64;
/// `crc` of the dabtree block info (directory leaf, da node, attribute leaf).
pub const DA_CRC_OFFSET: usize = 12;
/// `crc` of a directory data block header.
pub const DATA_CRC_OFFSET: usize = 4;

const CRC_SIZE: usize = 4;

/// CRC32C of `block` with the four bytes at `crc_offset` taken as zero.
pub fn block_crc(block: &[u8], crc_offset: usize) -> Result<u32, ParseError> {
    ensure_slice(block, crc_offset, CRC_SIZE)?;
    let crc = crc32c::crc32c(&block[..crc_offset]);
    let crc = crc32c::crc32c_append(crc, &[0; CRC_SIZE]);
    Ok(crc32c::crc32c_append(crc, &block[crc_offset + CRC_SIZE..]))
}

/// Compare the stored checksum against the block contents.
pub fn verify_block_crc(
    structure: &'static str,
    block: &[u8],
    crc_offset: usize,
) -> Result<(), ParseError> {
    let stored = read_le_u32(block, crc_offset)?;
    let computed = block_crc(block, crc_offset)?;
    if stored == computed {
        Ok(())
    } else {
        Err(ParseError::ChecksumMismatch {
            structure,
            stored,
            computed,
        })
    }
}

/// Store the block's checksum in place.
pub fn seal_block(block: &mut [u8], crc_offset: usize) -> Result<(), ParseError> {
    let crc = block_crc(block, crc_offset)?;
    block[crc_offset..crc_offset + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}
