#![forbid(unsafe_code)]
//! Volume geometry and traversal options.

use serde::{Deserialize, Serialize};
use xfr_error::{Result, XfrError};
use xfr_ondisk::{AgGeometry, BtreeMagics};
use xfr_types::BlockSize;

/// Values the geometry provider reports for a mounted volume.
///
/// These are normally lifted from the superblock by the caller; this crate
/// does not parse superblocks itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XfsGeometry {
    /// Filesystem block size in bytes; also the directory block size.
    pub block_size: u32,
    /// Blocks per allocation group.
    pub ag_blocks: u32,
    /// Bits of an encoded block number holding the AG-relative part.
    pub ag_block_log: u8,
    /// Directory entries carry a file-type byte (always true on v5).
    #[serde(default)]
    pub dir_ftype: bool,
    #[serde(default)]
    pub btree_magics: BtreeMagics,
}

impl XfsGeometry {
    #[must_use]
    pub fn new(block_size: u32, ag_blocks: u32, ag_block_log: u8) -> Self {
        Self {
            block_size,
            ag_blocks,
            ag_block_log,
            dir_ftype: false,
            btree_magics: BtreeMagics::default(),
        }
    }

    /// Check the geometry and derive the address translator.
    pub fn validate(&self) -> Result<AgGeometry> {
        let block_size = BlockSize::new(self.block_size).map_err(|_| {
            XfrError::Format(format!(
                "block_size {} is not a power of two in 512..=65536",
                self.block_size
            ))
        })?;
        if self.ag_blocks == 0 {
            return Err(XfrError::Format("ag_blocks must be non-zero".to_owned()));
        }
        if !(1..=31).contains(&self.ag_block_log) {
            return Err(XfrError::Format(format!(
                "ag_block_log {} outside 1..=31",
                self.ag_block_log
            )));
        }
        Ok(AgGeometry {
            block_size,
            ag_blocks: self.ag_blocks,
            ag_block_log: self.ag_block_log,
        })
    }
}

/// Limits applied while walking a fork's block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkOptions {
    /// Deepest root level accepted; anything above is reported as unsupported.
    pub max_depth: u16,
    /// On v5, reject blocks whose owner is not the inode being walked.
    pub verify_owner: bool,
    /// On v5, reject blocks whose CRC32C does not match their contents.
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_depth: 8,
            verify_owner: true,
            verify_checksums: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfr_ondisk::MagicPair;
    use xfr_types::{XFS_BMAP_CRC_MAGIC, XFS_BMAP_MAGIC};

    #[test]
    fn validate_derives_translator() {
        let geo = XfsGeometry::new(4096, 100, 3);
        let ag = geo.validate().expect("valid geometry");
        assert_eq!(ag.block_size.get(), 4096);
        assert_eq!(ag.ag_blocks, 100);
        assert_eq!(ag.ag_block_log, 3);
    }

    #[test]
    fn validate_rejects_bad_values() {
        for geo in [
            XfsGeometry::new(3000, 100, 3),
            XfsGeometry::new(4096, 0, 3),
            XfsGeometry::new(4096, 100, 0),
            XfsGeometry::new(4096, 100, 32),
        ] {
            assert!(matches!(geo.validate(), Err(XfrError::Format(_))), "{geo:?}");
        }
    }

    #[test]
    fn default_magics_are_bmap_pairs() {
        let geo = XfsGeometry::new(4096, 1024, 10);
        let pair = MagicPair {
            v4: XFS_BMAP_MAGIC,
            v5: XFS_BMAP_CRC_MAGIC,
        };
        assert_eq!(geo.btree_magics.data_extents, pair);
        assert_eq!(geo.btree_magics.directory, pair);
    }

    #[test]
    fn geometry_loads_from_json_with_defaults() {
        let geo: XfsGeometry = serde_json::from_str(
            r#"{"block_size": 4096, "ag_blocks": 65536, "ag_block_log": 16}"#,
        )
        .expect("parse geometry");
        assert_eq!(geo, XfsGeometry::new(4096, 65536, 16));

        let text = serde_json::to_string(&geo).expect("serialize");
        let back: XfsGeometry = serde_json::from_str(&text).expect("reparse");
        assert_eq!(back, geo);
    }

    #[test]
    fn walk_options_defaults() {
        let opts = WalkOptions::default();
        assert_eq!(opts.max_depth, 8);
        assert!(opts.verify_owner);
        assert!(opts.verify_checksums);
    }

    #[test]
    fn walk_options_json_without_checksum_flag_keeps_verification_on() {
        let opts: WalkOptions =
            serde_json::from_str(r#"{"max_depth": 4, "verify_owner": false}"#).expect("parse options");
        assert_eq!(opts.max_depth, 4);
        assert!(!opts.verify_owner);
        assert!(opts.verify_checksums);
    }
}
