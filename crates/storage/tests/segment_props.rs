//! Segment and Free-Space Property Tests
//!
//! Property checks on the pieces every edit is built from: splitting and
//! trimming segments, relogicalizing chains, and recycling released ranges.

use bento_core::{ContainerId, PropertyId, TypeId};
use bento_storage::{ByteStore, FreeSpace, ObjectGraph, Segment, SegmentData};
use proptest::prelude::*;

const UPDATING: ContainerId = ContainerId(1);

fn segment_strategy() -> impl Strategy<Value = Segment> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..=4)
            .prop_map(|bytes| Segment::immediate(&bytes).expect("fits inline")),
        (0u16..3, 0u32..10_000, 1u32..500)
            .prop_map(|(layer, offset, len)| Segment::stored(ContainerId(layer), offset, len)),
    ]
}

fn stored_offset(segment: &Segment) -> Option<u32> {
    match segment.data {
        SegmentData::Stored { offset, .. } => Some(offset),
        _ => None,
    }
}

// ============================================================================
// Segments
// ============================================================================

proptest! {
    #[test]
    fn test_split_preserves_bytes(
        offset in 0u32..10_000,
        len in 2u32..500,
        logical in 0u32..10_000,
        at in any::<u32>(),
    ) {
        let at = 1 + at % (len - 1);
        let mut left = Segment::stored(ContainerId::TARGET, offset, len).with_logical_offset(logical);
        let right = left.split_off(at).expect("interior split");
        prop_assert_eq!(left.len() + right.len(), len);
        prop_assert_eq!(stored_offset(&right), Some(offset + at));
        prop_assert_eq!(right.logical_offset, Some(logical + at));
        prop_assert_eq!(left.logical_offset, Some(logical));
    }

    #[test]
    fn test_advance_keeps_logical_alignment(
        len in 1u32..500,
        logical in 0u32..10_000,
        amount in any::<u32>(),
    ) {
        let amount = amount % (len + 1);
        let mut segment = Segment::stored(ContainerId::TARGET, 0, len).with_logical_offset(logical);
        segment.advance(amount);
        prop_assert_eq!(segment.len(), len - amount);
        prop_assert_eq!(stored_offset(&segment), Some(amount));
        prop_assert_eq!(segment.logical_offset, Some(logical + amount));
    }

    #[test]
    fn test_relogicalize_restores_contiguity(
        segments in prop::collection::vec(segment_strategy(), 1..12),
    ) {
        let mut graph = ObjectGraph::new();
        let object = graph.create_object(false);
        let value = graph
            .add_value(object, PropertyId(0x50), TypeId(0x60), 1, segments, ContainerId::TARGET)
            .unwrap();
        let header = graph.value_mut(value).unwrap();
        header.relogicalize();
        prop_assert!(header.old_segments_contiguous());
        prop_assert_eq!(header.size, header.computed_size());
        prop_assert_eq!(header.size, header.logical_size);
    }
}

// ============================================================================
// Free space
// ============================================================================

proptest! {
    #[test]
    fn test_released_chunks_coalesce(
        chunks in prop::collection::vec(1u32..64, 1..16),
        seed in any::<u64>(),
    ) {
        let total: u32 = chunks.iter().sum();
        let mut store = ByteStore::new();
        let mut free = FreeSpace::new(UPDATING);
        let base = free.reserve(&mut store, total).unwrap();

        let mut ranges = Vec::new();
        let mut offset = base;
        for len in &chunks {
            ranges.push((offset, *len));
            offset += len;
        }
        let n = ranges.len();
        let mut order: Vec<usize> = (0..n).collect();
        for i in (1..n).rev() {
            order.swap(i, (seed as usize).wrapping_mul(i + 7) % (i + 1));
        }
        for i in order {
            let (offset, len) = ranges[i];
            free.release(UPDATING, offset, len);
        }
        prop_assert_eq!(free.hole_count(), 1);
        prop_assert_eq!(free.free_bytes(), total as u64);

        let again = free.reserve(&mut store, total).unwrap();
        prop_assert_eq!(again, base);
        prop_assert_eq!(free.hole_count(), 0);
    }

    #[test]
    fn test_reserved_ranges_never_overlap(sizes in prop::collection::vec(1u32..128, 1..24)) {
        let mut store = ByteStore::new();
        let mut free = FreeSpace::new(UPDATING);
        let mut live: Vec<(u32, u32)> = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            if i % 3 == 2 {
                let (offset, len) = live.remove(0);
                free.release(UPDATING, offset, len);
            }
            let offset = free.reserve(&mut store, *size).unwrap();
            for (o, l) in &live {
                prop_assert!(offset + size <= *o || o + l <= offset);
            }
            prop_assert!(offset + size <= store.eof());
            live.push((offset, *size));
        }
    }
}

#[test]
fn test_release_ignored_without_tracking() {
    let mut store = ByteStore::new();
    let mut free = FreeSpace::new(UPDATING);
    let offset = free.reserve(&mut store, 32).unwrap();
    free.set_tracking(false);
    free.release(UPDATING, offset, 32);
    free.release(ContainerId::TARGET, 0, 16);
    assert_eq!(free.free_bytes(), 0);
    free.set_tracking(true);
    free.release(ContainerId::TARGET, 0, 16);
    assert_eq!(free.free_bytes(), 0);
}
