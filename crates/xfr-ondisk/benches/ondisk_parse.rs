#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use xfr_ondisk::{
    BTREE_CRC_OFFSET, BtreeNodeHeader, DataBlockHeader, Extent, ExtentOffsetIndex, ExtentState,
    LeafBlock, MagicPair, leaf_extents, seal_block, verify_block_crc,
};
use xfr_types::{
    BlockNumber, BlockSize, FormatVersion, XFS_BMAP_MAGIC, XFS_DIR2_DATA_MAGIC,
    XFS_DIR3_LEAFN_MAGIC,
};

fn synthetic_extents(count: u32) -> Vec<Extent> {
    (0..count)
        .map(|idx| Extent {
            start_offset: u64::from(idx) * 8,
            start_block: BlockNumber(1000 + u64::from(idx) * 16),
            block_count: 8,
            state: ExtentState::Normal,
        })
        .collect()
}

fn bmbt_leaf_block(extents: &[Extent]) -> Vec<u8> {
    let mut block = vec![0_u8; 4096];
    block[0..4].copy_from_slice(&XFS_BMAP_MAGIC.to_be_bytes());
    let numrecs = u16::try_from(extents.len()).expect("numrecs");
    block[6..8].copy_from_slice(&numrecs.to_be_bytes());
    for (idx, ext) in extents.iter().enumerate() {
        let at = 24 + idx * 16;
        block[at..at + 16].copy_from_slice(&ext.to_bytes());
    }
    block
}

/// 4 KiB v4 data block packed with 16-byte entries.
fn packed_data_block() -> Vec<u8> {
    let mut block = vec![0_u8; 4096];
    block[0..4].copy_from_slice(&XFS_DIR2_DATA_MAGIC.to_be_bytes());
    let mut at = 16;
    let mut ino = 128_u64;
    while at + 16 <= block.len() {
        block[at..at + 8].copy_from_slice(&ino.to_be_bytes());
        block[at + 8] = 4;
        block[at + 9..at + 13].copy_from_slice(b"name");
        let tag = u16::try_from(at).expect("tag");
        block[at + 14..at + 16].copy_from_slice(&tag.to_be_bytes());
        at += 16;
        ino += 1;
    }
    block
}

fn bench_extent_decode(c: &mut Criterion) {
    let raw = synthetic_extents(1)[0].to_bytes();
    c.bench_function("xfs_extent_decode", |b| {
        b.iter(|| Extent::decode(black_box(&raw)));
    });
}

fn bench_bmbt_leaf_parse(c: &mut Criterion) {
    let block = bmbt_leaf_block(&synthetic_extents(200));
    c.bench_function("xfs_bmbt_leaf_parse", |b| {
        b.iter(|| {
            let hdr = BtreeNodeHeader::parse(black_box(&block), MagicPair::default())
                .expect("header");
            black_box(leaf_extents(&block, &hdr).expect("records"));
        });
    });
}

fn bench_offset_index_lookup(c: &mut Criterion) {
    let bs = BlockSize::new(4096).expect("block size");
    let index = ExtentOffsetIndex::build(&synthetic_extents(4096), bs).expect("index");
    let target = index.mapped_len() / 3;
    c.bench_function("xfs_offset_index_lookup", |b| {
        b.iter(|| black_box(index.lookup(black_box(target))));
    });
}

fn bench_data_block_scan(c: &mut Criterion) {
    let block = packed_data_block();
    c.bench_function("xfs_data_block_scan", |b| {
        b.iter(|| {
            let hdr = DataBlockHeader::parse(black_box(&block), FormatVersion::V4)
                .expect("header");
            let count = hdr
                .scan(&block, false)
                .expect("scanner")
                .filter(Result::is_ok)
                .count();
            black_box(count);
        });
    });
}

fn bench_leaf_block_parse(c: &mut Criterion) {
    let mut block = vec![0_u8; 4096];
    block[8..10].copy_from_slice(&XFS_DIR3_LEAFN_MAGIC.to_be_bytes());
    block[56..58].copy_from_slice(&500_u16.to_be_bytes());
    c.bench_function("xfs_leaf_block_parse", |b| {
        b.iter(|| black_box(LeafBlock::parse(black_box(&block), FormatVersion::V5)));
    });
}

fn bench_block_crc(c: &mut Criterion) {
    let mut block = bmbt_leaf_block(&synthetic_extents(200));
    seal_block(&mut block, BTREE_CRC_OFFSET).expect("seal");
    c.bench_function("xfs_block_crc_verify_4k", |b| {
        b.iter(|| black_box(verify_block_crc("bmbt block", black_box(&block), BTREE_CRC_OFFSET)));
    });
}

criterion_group!(
    benches,
    bench_extent_decode,
    bench_bmbt_leaf_parse,
    bench_offset_index_lookup,
    bench_data_block_scan,
    bench_leaf_block_parse,
    bench_block_crc,
);
criterion_main!(benches);
