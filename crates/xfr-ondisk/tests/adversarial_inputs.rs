#![forbid(unsafe_code)]
//! Decoders must fail cleanly, never panic, on arbitrary or truncated input.

use proptest::prelude::*;
use xfr_ondisk::{
    AttrLeafBlock, BtreeMagics, BtreeNodeHeader, DaNode, DataBlockHeader, DirectoryBlockHeader,
    BTREE_CRC_OFFSET, DA_CRC_OFFSET, DATA_CRC_OFFSET, Extent, ExtentOffsetIndex, LeafBlock,
    ShortformDir, decode_entry_at, leaf_extents, node_child_pointers, node_keys, verify_block_crc,
};
use xfr_types::{
    BlockSize, FormatVersion, ParseError, XFS_ATTR3_LEAF_MAGIC, XFS_BMAP_CRC_MAGIC,
    XFS_DA3_NODE_MAGIC, XFS_DIR3_BLOCK_MAGIC, XFS_DIR3_LEAFN_MAGIC,
};

#[derive(Debug, Default)]
struct ErrorCoverage {
    insufficient_data: u32,
    signature_mismatch: u32,
    invalid_field: u32,
    other: u32,
}

impl ErrorCoverage {
    fn observe<T>(&mut self, result: Result<T, ParseError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(ParseError::InsufficientData { .. }) => {
                self.insufficient_data += 1;
                None
            }
            Err(ParseError::SignatureMismatch { .. }) => {
                self.signature_mismatch += 1;
                None
            }
            Err(ParseError::InvalidField { .. }) => {
                self.invalid_field += 1;
                None
            }
            Err(_) => {
                self.other += 1;
                None
            }
        }
    }
}

/// Run every block-level decoder over `bytes` for one format generation.
fn decode_everything(bytes: &[u8], version: FormatVersion, coverage: &mut ErrorCoverage) {
    let magics = BtreeMagics::default().data_extents;
    if let Some(hdr) = coverage.observe(BtreeNodeHeader::parse(bytes, magics)) {
        if hdr.is_leaf() {
            coverage.observe(leaf_extents(bytes, &hdr));
        } else {
            coverage.observe(node_child_pointers(bytes, &hdr));
            coverage.observe(node_keys(bytes, &hdr));
        }
    }
    for crc_offset in [BTREE_CRC_OFFSET, DA_CRC_OFFSET, DATA_CRC_OFFSET] {
        coverage.observe(verify_block_crc("block", bytes, crc_offset));
    }

    coverage.observe(DirectoryBlockHeader::parse(bytes, version));
    coverage.observe(DaNode::parse(bytes, version));
    coverage.observe(LeafBlock::parse(bytes, version));
    if let Some(leaf) = coverage.observe(AttrLeafBlock::parse(bytes, version)) {
        coverage.observe(leaf.names(bytes));
    }
    if let Some(hdr) = coverage.observe(DataBlockHeader::parse(bytes, version)) {
        if let Some(scanner) = coverage.observe(hdr.scan(bytes, version.is_v5())) {
            for entry in scanner {
                coverage.observe(entry);
            }
        }
    }
    for has_ftype in [false, true] {
        coverage.observe(ShortformDir::parse(bytes, has_ftype));
        coverage.observe(decode_entry_at(bytes, 0, has_ftype));
    }
}

fn stamp(mut bytes: Vec<u8>, at: usize, magic: &[u8]) -> Vec<u8> {
    if bytes.len() >= at + magic.len() {
        bytes[at..at + magic.len()].copy_from_slice(magic);
    }
    bytes
}

fn version_strategy() -> impl Strategy<Value = FormatVersion> {
    prop_oneof![Just(FormatVersion::V4), Just(FormatVersion::V5)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn arbitrary_bytes_never_panic(
        bytes in proptest::collection::vec(any::<u8>(), 0..1024),
        version in version_strategy(),
    ) {
        let mut coverage = ErrorCoverage::default();
        decode_everything(&bytes, version, &mut coverage);
    }

    /// Valid magics push the decoders past the signature check into the
    /// field-level validation paths.
    #[test]
    fn stamped_magics_never_panic(
        bytes in proptest::collection::vec(any::<u8>(), 0..1024),
    ) {
        let mut coverage = ErrorCoverage::default();
        let stamped = [
            stamp(bytes.clone(), 0, &XFS_BMAP_CRC_MAGIC.to_be_bytes()),
            stamp(bytes.clone(), 0, &XFS_DIR3_BLOCK_MAGIC.to_be_bytes()),
            stamp(bytes.clone(), 8, &XFS_DIR3_LEAFN_MAGIC.to_be_bytes()),
            stamp(bytes.clone(), 8, &XFS_DA3_NODE_MAGIC.to_be_bytes()),
            stamp(bytes, 8, &XFS_ATTR3_LEAF_MAGIC.to_be_bytes()),
        ];
        for sample in &stamped {
            decode_everything(sample, FormatVersion::V5, &mut coverage);
        }
    }

    #[test]
    fn offset_index_tolerates_any_extent_list(
        records in proptest::collection::vec(any::<[u8; 16]>(), 0..32),
    ) {
        let extents: Vec<Extent> = records.iter().map(Extent::decode).collect();
        let bs = BlockSize::new(4096).expect("block size");
        if let Ok(index) = ExtentOffsetIndex::build(&extents, bs) {
            let total = index.mapped_len();
            prop_assert_eq!(index.lookup(total), None);
            if total > 0 {
                prop_assert!(index.lookup(total - 1).is_some());
            }
        }
    }
}

#[test]
fn truncated_leaf_fails_until_entries_fit() {
    let count = 6_usize;
    let mut block = vec![0_u8; 512];
    block[8..10].copy_from_slice(&XFS_DIR3_LEAFN_MAGIC.to_be_bytes());
    block[56..58].copy_from_slice(&u16::try_from(count).expect("fits").to_be_bytes());
    for idx in 0..count {
        let at = 64 + idx * 8;
        block[at..at + 4].copy_from_slice(&(0x100_u32 * u32::try_from(idx).expect("fits")).to_be_bytes());
        block[at + 4..at + 8].copy_from_slice(&(8_u32 + u32::try_from(idx).expect("fits")).to_be_bytes());
    }

    let needed = 64 + count * 8;
    let mut coverage = ErrorCoverage::default();
    for len in 0..=block.len() {
        let parsed = coverage.observe(LeafBlock::parse(&block[..len], FormatVersion::V5));
        assert_eq!(parsed.is_some(), len >= needed, "prefix of {len} bytes");
    }
    assert_eq!(coverage.insufficient_data, u32::try_from(needed).expect("fits"));
    assert_eq!(coverage.signature_mismatch + coverage.invalid_field + coverage.other, 0);
}
