#![forbid(unsafe_code)]
//! Allocation-group block address translation.

use serde::{Deserialize, Serialize};
use xfr_types::{AgNumber, BlockNumber, BlockSize, ByteOffset, ParseError};

/// Geometry needed to turn an AG-encoded block number into a device offset.
///
/// On-disk block numbers carry the AG index above bit `ag_block_log` and the
/// AG-relative block below it. The translator applies the formula to the
/// geometry it is given and does not require `ag_blocks <= 1 << ag_block_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgGeometry {
    pub block_size: BlockSize,
    /// Blocks per allocation group.
    pub ag_blocks: u32,
    /// Number of low bits holding the AG-relative block.
    pub ag_block_log: u8,
}

impl AgGeometry {
    fn parts(&self, block: BlockNumber) -> (u64, u64) {
        let log = u32::from(self.ag_block_log);
        let ag = block.0.checked_shr(log).unwrap_or(0);
        let mask = 1_u64.checked_shl(log).map_or(u64::MAX, |v| v - 1);
        (ag, block.0 & mask)
    }

    /// Split an encoded block number into `(ag, relative_block)`.
    ///
    /// AG indices wider than 32 bits saturate; use `absolute_block` for math.
    #[must_use]
    pub fn split(&self, block: BlockNumber) -> (AgNumber, u64) {
        let (ag, relative) = self.parts(block);
        (AgNumber(u32::try_from(ag).unwrap_or(u32::MAX)), relative)
    }

    /// `ag * ag_blocks + relative`, in filesystem blocks.
    pub fn absolute_block(&self, block: BlockNumber) -> Result<u64, ParseError> {
        let (ag, relative) = self.parts(block);
        ag.checked_mul(u64::from(self.ag_blocks))
            .and_then(|base| base.checked_add(relative))
            .ok_or(ParseError::IntegerConversion {
                field: "absolute_block",
            })
    }

    /// Device byte offset of `block`.
    ///
    /// Extent start blocks and B+tree child pointers both go through here.
    pub fn byte_offset(&self, block: BlockNumber) -> Result<ByteOffset, ParseError> {
        let abs = self.absolute_block(block)?;
        self.block_size
            .blocks_to_bytes(abs)
            .map(ByteOffset)
            .ok_or(ParseError::IntegerConversion {
                field: "block_byte_offset",
            })
    }

    /// Device byte offset of the `index`-th block of a physical run.
    pub fn run_byte_offset(&self, start: BlockNumber, index: u64) -> Result<ByteOffset, ParseError> {
        let base = self.byte_offset(start)?;
        let delta = self
            .block_size
            .blocks_to_bytes(index)
            .ok_or(ParseError::IntegerConversion {
                field: "run_byte_offset",
            })?;
        base.checked_add(delta).ok_or(ParseError::IntegerConversion {
            field: "run_byte_offset",
        })
    }
}
