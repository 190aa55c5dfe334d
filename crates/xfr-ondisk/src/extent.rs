#![forbid(unsafe_code)]
//! Packed extent records and the byte-offset index built over them.

use serde::{Deserialize, Serialize};
use xfr_types::{BlockNumber, BlockSize, ParseError, ensure_slice, read_be_u64};

/// Size of one packed extent record on disk.
pub const EXTENT_RECORD_SIZE: usize = 16;

const BLOCK_COUNT_MASK: u64 = 0x1F_FFFF;
const START_OFFSET_MASK: u64 = 0x003F_FFFF_FFFF_FFFF;
const UPPER_BLOCK_MASK: u64 = 0x1FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtentState {
    Normal,
    /// Preallocated but never written; reads as zeroes.
    Unwritten,
}

/// One contiguous logical-to-physical block run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    /// First logical block of the run, in filesystem blocks.
    pub start_offset: u64,
    /// First physical block, AG-encoded.
    pub start_block: BlockNumber,
    pub block_count: u32,
    pub state: ExtentState,
}

impl Extent {
    /// Decode a record from its two big-endian words.
    ///
    /// ```text
    /// upper: [63] state | [62..9] start_offset | [8..0] start_block bits
    /// lower: [63..21] start_block bits         | [20..0] block_count
    /// ```
    ///
    /// The nine low bits of `upper` are OR-ed into `start_block` unshifted.
    /// Every 16-byte input decodes to some extent; validity is the caller's
    /// concern.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to 21 bits
    pub fn from_words(upper: u64, lower: u64) -> Self {
        let block_count = (lower & BLOCK_COUNT_MASK) as u32;
        let start_block = (lower >> 21) | (upper & UPPER_BLOCK_MASK);
        let start_offset = (upper >> 9) & START_OFFSET_MASK;
        let state = if upper >> 63 == 1 {
            ExtentState::Unwritten
        } else {
            ExtentState::Normal
        };

        Self {
            start_offset,
            start_block: BlockNumber(start_block),
            block_count,
            state,
        }
    }

    #[must_use]
    pub fn decode(raw: &[u8; EXTENT_RECORD_SIZE]) -> Self {
        let mut upper = [0_u8; 8];
        let mut lower = [0_u8; 8];
        upper.copy_from_slice(&raw[..8]);
        lower.copy_from_slice(&raw[8..]);
        Self::from_words(u64::from_be_bytes(upper), u64::from_be_bytes(lower))
    }

    /// Decode the record at `offset` in `bytes`.
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(bytes, offset, EXTENT_RECORD_SIZE)?;
        Ok(Self::from_words(
            read_be_u64(bytes, offset)?,
            read_be_u64(bytes, offset + 8)?,
        ))
    }

    /// Encode back to the packed form.
    ///
    /// `start_block` is written entirely into the shifted lower word, so the
    /// round trip is exact for any `start_block` below `2^43`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EXTENT_RECORD_SIZE] {
        let state_bit = match self.state {
            ExtentState::Normal => 0,
            ExtentState::Unwritten => 1_u64 << 63,
        };
        let upper = state_bit | ((self.start_offset & START_OFFSET_MASK) << 9);
        let lower = (self.start_block.0 << 21) | (u64::from(self.block_count) & BLOCK_COUNT_MASK);

        let mut out = [0_u8; EXTENT_RECORD_SIZE];
        out[..8].copy_from_slice(&upper.to_be_bytes());
        out[8..].copy_from_slice(&lower.to_be_bytes());
        out
    }

    #[must_use]
    pub fn is_unwritten(&self) -> bool {
        self.state == ExtentState::Unwritten
    }

    /// Length of the run in bytes.
    #[must_use]
    pub fn byte_len(&self, block_size: BlockSize) -> u64 {
        u64::from(self.block_count) * u64::from(block_size.get())
    }

    /// `true` iff `start_offset*bs <= file_offset < (start_offset+block_count)*bs`.
    #[must_use]
    pub fn covers(&self, file_offset: u64, block_size: BlockSize) -> bool {
        let bs = u128::from(block_size.get());
        let start = u128::from(self.start_offset) * bs;
        let end = (u128::from(self.start_offset) + u128::from(self.block_count)) * bs;
        let off = u128::from(file_offset);
        start <= off && off < end
    }

    /// `true` if the logical block `block` lies inside this run.
    #[must_use]
    pub fn contains_block(&self, block: u64) -> bool {
        block >= self.start_offset
            && u128::from(block) < u128::from(self.start_offset) + u128::from(self.block_count)
    }
}

/// Decode `count` consecutive records starting at `offset`.
pub fn parse_extent_list(
    bytes: &[u8],
    offset: usize,
    count: usize,
) -> Result<Vec<Extent>, ParseError> {
    let needed = count
        .checked_mul(EXTENT_RECORD_SIZE)
        .ok_or(ParseError::InvalidField {
            field: "extent_count",
            reason: "overflow",
        })?;
    ensure_slice(bytes, offset, needed)?;

    (0..count)
        .map(|idx| Extent::parse(bytes, offset + idx * EXTENT_RECORD_SIZE))
        .collect()
}

/// Find the run containing logical block `block`, honouring holes.
#[must_use]
pub fn find_extent_for_block(extents: &[Extent], block: u64) -> Option<&Extent> {
    extents.iter().find(|ext| ext.contains_block(block))
}

// ── Offset index ────────────────────────────────────────────────────────────

/// One half-open byte window `[start, end)` owned by an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexWindow {
    pub start: u64,
    pub end: u64,
    pub extent: Extent,
}

impl IndexWindow {
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Distance of `offset` from the start of the window.
    #[must_use]
    pub fn delta(&self, offset: u64) -> u64 {
        offset.saturating_sub(self.start)
    }
}

/// Prefix-sum table over an ordered extent list.
///
/// Window `i` covers `[sum(len_0..len_i), sum(len_0..=len_i))`, so the windows
/// tile the mapped byte stream of the fork with no gaps and no overlaps.
/// Offsets past the last window are not mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentOffsetIndex {
    windows: Vec<IndexWindow>,
}

impl ExtentOffsetIndex {
    pub fn build(extents: &[Extent], block_size: BlockSize) -> Result<Self, ParseError> {
        let mut windows = Vec::with_capacity(extents.len());
        let mut acc = 0_u64;
        for extent in extents {
            let end = acc
                .checked_add(extent.byte_len(block_size))
                .ok_or(ParseError::IntegerConversion {
                    field: "extent_index_offset",
                })?;
            windows.push(IndexWindow {
                start: acc,
                end,
                extent: *extent,
            });
            acc = end;
        }
        Ok(Self { windows })
    }

    /// First window containing `offset`, or `None` for an unmapped offset.
    #[must_use]
    pub fn lookup(&self, offset: u64) -> Option<&IndexWindow> {
        let idx = self.windows.partition_point(|w| w.end <= offset);
        self.windows.get(idx).filter(|w| w.contains(offset))
    }

    #[must_use]
    pub fn windows(&self) -> &[IndexWindow] {
        &self.windows
    }

    /// Total number of mapped bytes.
    #[must_use]
    pub fn mapped_len(&self) -> u64 {
        self.windows.last().map_or(0, |w| w.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bs4k() -> BlockSize {
        BlockSize::new(4096).expect("block size")
    }

    fn extent(start_offset: u64, start_block: u64, block_count: u32) -> Extent {
        Extent {
            start_offset,
            start_block: BlockNumber(start_block),
            block_count,
            state: ExtentState::Normal,
        }
    }

    #[test]
    fn regression_vector_upper_42_lower_200000() {
        let mut raw = [0_u8; 16];
        raw[..8].copy_from_slice(&0x0000_0000_0000_0042_u64.to_be_bytes());
        raw[8..].copy_from_slice(&0x0000_0000_0020_0000_u64.to_be_bytes());

        let ext = Extent::decode(&raw);
        assert_eq!(ext.block_count, 0);
        // lower >> 21 == 1, OR-ed with upper & 0x1FF == 0x42.
        assert_eq!(ext.start_block, BlockNumber(0x43));
        assert_eq!(ext.start_offset, 0);
        assert_eq!(ext.state, ExtentState::Normal);
    }

    #[test]
    fn decode_splits_all_fields() {
        let upper = (1_u64 << 63) | (100_u64 << 9);
        let lower = (200_u64 << 21) | 50;
        let ext = Extent::from_words(upper, lower);
        assert_eq!(ext.start_offset, 100);
        assert_eq!(ext.start_block, BlockNumber(200));
        assert_eq!(ext.block_count, 50);
        assert!(ext.is_unwritten());
    }

    #[test]
    fn start_offset_excludes_state_bit() {
        let ext = Extent::from_words(u64::MAX, 0);
        assert_eq!(ext.start_offset, START_OFFSET_MASK);
        assert_eq!(ext.state, ExtentState::Unwritten);
    }

    #[test]
    fn parse_rejects_short_buffer() {
        let err = Extent::parse(&[0_u8; 20], 8).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { needed: 16, .. }));
    }

    #[test]
    fn covers_is_half_open() {
        let ext = extent(10, 500, 2);
        let bs = bs4k();
        assert!(!ext.covers(10 * 4096 - 1, bs));
        assert!(ext.covers(10 * 4096, bs));
        assert!(ext.covers(12 * 4096 - 1, bs));
        assert!(!ext.covers(12 * 4096, bs));
    }

    #[test]
    fn covers_does_not_overflow_at_max_offset() {
        let ext = extent(START_OFFSET_MASK, 1, 0x1F_FFFF);
        assert!(!ext.covers(0, BlockSize::new(65536).unwrap()));
    }

    #[test]
    fn parse_extent_list_reads_consecutive_records() {
        let mut buf = vec![0_u8; 8];
        buf.extend_from_slice(&extent(0, 100, 4).to_bytes());
        buf.extend_from_slice(&extent(4, 300, 1).to_bytes());

        let list = parse_extent_list(&buf, 8, 2).expect("list");
        assert_eq!(list, vec![extent(0, 100, 4), extent(4, 300, 1)]);
        assert!(parse_extent_list(&buf, 8, 3).is_err());
    }

    #[test]
    fn find_extent_for_block_respects_holes() {
        let list = [extent(0, 100, 2), extent(10, 400, 2)];
        assert_eq!(find_extent_for_block(&list, 1), Some(&list[0]));
        assert_eq!(find_extent_for_block(&list, 5), None);
        assert_eq!(find_extent_for_block(&list, 11), Some(&list[1]));
    }

    #[test]
    fn index_windows_accumulate_lengths() {
        let list = [extent(0, 100, 2), extent(10, 400, 1), extent(11, 900, 3)];
        let index = ExtentOffsetIndex::build(&list, bs4k()).expect("index");
        let spans: Vec<_> = index.windows().iter().map(|w| (w.start, w.end)).collect();
        assert_eq!(spans, vec![(0, 8192), (8192, 12288), (12288, 24576)]);
        assert_eq!(index.mapped_len(), 24576);

        let hit = index.lookup(8192).expect("mapped");
        assert_eq!(hit.extent.start_block, BlockNumber(400));
        assert_eq!(hit.delta(8200), 8);
        assert!(index.lookup(24576).is_none());
    }

    #[test]
    fn empty_index_maps_nothing() {
        let index = ExtentOffsetIndex::build(&[], bs4k()).expect("index");
        assert!(index.lookup(0).is_none());
        assert_eq!(index.mapped_len(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn decode_is_pure(raw in proptest::array::uniform16(any::<u8>())) {
            prop_assert_eq!(Extent::decode(&raw), Extent::decode(&raw));
        }

        #[test]
        fn encode_then_decode_is_identity(
            start_offset in 0_u64..=START_OFFSET_MASK,
            start_block in 0_u64..(1_u64 << 43),
            block_count in 0_u32..=0x1F_FFFF,
            unwritten in any::<bool>(),
        ) {
            let ext = Extent {
                start_offset,
                start_block: BlockNumber(start_block),
                block_count,
                state: if unwritten { ExtentState::Unwritten } else { ExtentState::Normal },
            };
            prop_assert_eq!(Extent::decode(&ext.to_bytes()), ext);
        }

        #[test]
        fn index_windows_partition_mapped_range(
            counts in proptest::collection::vec(0_u32..64, 1..24),
            target in any::<u64>(),
        ) {
            let bs = BlockSize::new(512).unwrap();
            let list: Vec<_> = counts
                .iter()
                .enumerate()
                .map(|(i, c)| extent(i as u64 * 100, 1000 + i as u64, *c))
                .collect();
            let index = ExtentOffsetIndex::build(&list, bs).unwrap();

            let mut expected_start = 0;
            for w in index.windows() {
                prop_assert_eq!(w.start, expected_start);
                prop_assert!(w.end >= w.start);
                expected_start = w.end;
            }

            let total = index.mapped_len();
            if total > 0 {
                let offset = target % total;
                let hits = index.windows().iter().filter(|w| w.contains(offset)).count();
                prop_assert_eq!(hits, 1);
                prop_assert!(index.lookup(offset).is_some_and(|w| w.contains(offset)));
            }
            prop_assert!(index.lookup(total).is_none());
        }
    }
}
