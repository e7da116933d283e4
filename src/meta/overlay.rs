//! Read-side slice resolution.
//!
//! A chunk's log is a sequence of writes in commit order; later writes
//! occlude earlier ones. Resolution replays the log into an ordered interval
//! map keyed by in-chunk position: each insert cuts away whatever portion of
//! previously visible slices it covers, splitting survivors as needed. The
//! final in-order traversal emits the visible slices, with uncovered gaps
//! reported as zero-filled holes (`id` 0).
//!
//! This is the hot path for every read, so it must be deterministic and stay
//! O(n log n) in the number of log records.

use std::collections::BTreeMap;

use crate::meta::codec::SliceRec;
use crate::meta::types::Slice;

#[derive(Clone, Copy, Debug)]
struct Seg {
    id: u64,
    size: u32,
    off: u32,
    len: u32,
}

fn insert(map: &mut BTreeMap<u64, Seg>, rec: &SliceRec) {
    if rec.len == 0 {
        return;
    }
    let start = rec.pos as u64;
    let end = start + rec.len as u64;

    // A neighbor starting before us may reach into (or past) our range.
    if let Some((&left_start, &left)) = map.range(..start).next_back() {
        let left_end = left_start + left.len as u64;
        if left_end > start {
            if let Some(seg) = map.get_mut(&left_start) {
                seg.len = (start - left_start) as u32;
            }
            if left_end > end {
                map.insert(
                    end,
                    Seg {
                        id: left.id,
                        size: left.size,
                        off: left.off + (end - left_start) as u32,
                        len: (left_end - end) as u32,
                    },
                );
            }
        }
    }

    // Segments starting inside our range are cut; at most the last one can
    // survive past our end (visible segments never overlap).
    let covered: Vec<u64> = map.range(start..end).map(|(&k, _)| k).collect();
    for key in covered {
        let Some(seg) = map.remove(&key) else {
            continue;
        };
        let seg_end = key + seg.len as u64;
        if seg_end > end {
            map.insert(
                end,
                Seg {
                    id: seg.id,
                    size: seg.size,
                    off: seg.off + (end - key) as u32,
                    len: (seg_end - end) as u32,
                },
            );
        }
    }

    map.insert(
        start,
        Seg {
            id: rec.id,
            size: rec.size,
            off: rec.off,
            len: rec.len,
        },
    );
}

/// Resolve a chunk log into the flat sequence of currently visible slices.
pub fn build_slices(recs: &[SliceRec]) -> Vec<Slice> {
    let mut map = BTreeMap::new();
    for rec in recs {
        insert(&mut map, rec);
    }

    let mut out = Vec::with_capacity(map.len());
    let mut pos: u64 = 0;
    for (&start, seg) in &map {
        if start > pos {
            let gap = (start - pos) as u32;
            out.push(Slice {
                id: 0,
                size: gap,
                off: 0,
                len: gap,
            });
            pos = start;
        }
        out.push(Slice {
            id: seg.id,
            size: seg.size,
            off: seg.off,
            len: seg.len,
        });
        pos += seg.len as u64;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pos: u32, id: u64, size: u32, off: u32, len: u32) -> SliceRec {
        SliceRec {
            pos,
            id,
            size,
            off,
            len,
        }
    }

    fn layout(slices: &[Slice]) -> Vec<(u64, u32, u32)> {
        slices.iter().map(|s| (s.id, s.off, s.len)).collect()
    }

    #[test]
    fn single_write() {
        let out = build_slices(&[rec(0, 100, 4096, 0, 4096)]);
        assert_eq!(layout(&out), vec![(100, 0, 4096)]);
    }

    #[test]
    fn later_write_occludes_earlier() {
        let out = build_slices(&[rec(0, 1, 100, 0, 100), rec(50, 2, 100, 0, 100)]);
        assert_eq!(layout(&out), vec![(1, 0, 50), (2, 0, 100)]);
    }

    #[test]
    fn interior_overwrite_splits_survivor() {
        let out = build_slices(&[rec(0, 1, 100, 0, 100), rec(25, 2, 25, 0, 25)]);
        assert_eq!(layout(&out), vec![(1, 0, 25), (2, 0, 25), (1, 50, 50)]);
    }

    #[test]
    fn gaps_become_holes() {
        let out = build_slices(&[rec(10, 1, 20, 0, 20), rec(50, 2, 30, 0, 30)]);
        assert_eq!(
            layout(&out),
            vec![(0, 0, 10), (1, 0, 20), (0, 0, 20), (2, 0, 30)]
        );
        // Synthesized holes carry their length as the declared size.
        assert_eq!(out[0].size, 10);
        assert_eq!(out[2].size, 20);
    }

    #[test]
    fn overwrite_spanning_multiple_slices() {
        let out = build_slices(&[
            rec(0, 1, 40, 0, 40),
            rec(40, 2, 40, 0, 40),
            rec(80, 3, 40, 0, 40),
            rec(20, 4, 80, 0, 80),
        ]);
        assert_eq!(layout(&out), vec![(1, 0, 20), (4, 0, 80), (3, 20, 20)]);
    }

    #[test]
    fn hole_records_participate_in_overlay() {
        // truncate-style zero record punching the middle of a write
        let out = build_slices(&[rec(0, 1, 100, 0, 100), rec(30, 0, 0, 0, 40)]);
        assert_eq!(layout(&out), vec![(1, 0, 30), (0, 0, 40), (1, 70, 30)]);
    }

    #[test]
    fn replay_is_order_sensitive() {
        let a = build_slices(&[rec(0, 1, 64, 0, 64), rec(0, 2, 64, 0, 64)]);
        let b = build_slices(&[rec(0, 2, 64, 0, 64), rec(0, 1, 64, 0, 64)]);
        assert_eq!(layout(&a), vec![(2, 0, 64)]);
        assert_eq!(layout(&b), vec![(1, 0, 64)]);
    }

    #[test]
    fn compacted_log_resolves_identically() {
        let log = [
            rec(0, 1, 64, 0, 64),
            rec(32, 2, 64, 0, 64),
            rec(128, 3, 16, 0, 16),
        ];
        let resolved = build_slices(&log);
        let total: u32 = resolved.iter().map(|s| s.len).sum();

        // Compaction replaces the log with one record of the coalesced size.
        let compacted = build_slices(&[rec(0, 9, total, 0, total)]);
        let compacted_total: u32 = compacted.iter().map(|s| s.len).sum();
        assert_eq!(total, compacted_total);
        assert_eq!(layout(&compacted), vec![(9, 0, total)]);
    }

    #[test]
    fn full_chunk_hole_base_exposes_written_ranges() {
        // copy_file_range seeds the overlay with a chunk-wide hole so every
        // byte of the source range is accounted for.
        let chunk = 1 << 20;
        let out = build_slices(&[rec(0, 0, 0, 0, chunk), rec(4096, 7, 8192, 0, 8192)]);
        assert_eq!(
            layout(&out),
            vec![(0, 0, 4096), (7, 0, 8192), (0, 12288, chunk - 12288)]
        );
    }
}
