//! Received-segment tracking for stream reassembly.
//!
//! Incoming bytes are copied straight into the reassembly buffer at their
//! stream offset; this list records which byte ranges of that buffer are
//! valid, merging ranges as they become contiguous, so the stream can answer
//! "given the next expected byte, how much is deliverable right now?".

use std::collections::VecDeque;

/// A range of bytes in the stream: start offset plus length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRange {
    pub start: i64,
    pub length: i64,
}

impl SegmentRange {
    pub fn new(start: i64, length: i64) -> Self {
        Self { start, length }
    }

    /// One past the last valid byte, in the container sense.
    pub fn end(&self) -> i64 {
        self.start + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Ordered list of disjoint, non-adjacent received ranges.
///
/// A deque is plenty here: the list ideally holds at most one entry at a
/// time, and even under loss it stays small as segments merge.
#[derive(Debug, Default)]
pub struct ReceivedSegmentList {
    segments: VecDeque<SegmentRange>,
}

impl ReceivedSegmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly valid range of bytes, merging with any neighbor it
    /// touches. Ranges fully covered by an existing segment are dropped.
    ///
    /// Partial overlaps would mean the sender re-segmented data, which never
    /// happens with the current sender; the debug assertion below guards
    /// that assumption rather than handling the case.
    pub fn insert(&mut self, offset: i64, length: i64) {
        if self.segments.is_empty() {
            self.segments.push_back(SegmentRange::new(offset, length));
            return;
        }

        // The loop below only looks at insertion points after some segment,
        // so a range landing before the first one needs special handling.
        let front = *self.segments.front().expect("non-empty");
        if offset + length <= front.end() {
            if offset + length >= front.start {
                // Touches or overlaps the front segment; only extend if it
                // actually starts earlier.
                if offset < front.start {
                    let f = self.segments.front_mut().expect("non-empty");
                    f.start = offset;
                    f.length += length;
                }
            } else {
                self.segments.push_front(SegmentRange::new(offset, length));
            }
            return;
        }

        let mut i = 0;
        loop {
            debug_assert!(i < self.segments.len());
            let cur = self.segments[i];

            if offset >= cur.start && offset < cur.end() {
                // Overlap with an existing segment must be complete overlap
                // (no re-segmentation), so there is nothing to record.
                debug_assert!(offset + length <= cur.end());
                return;
            }

            let next_start = self.segments.get(i + 1).map(|s| s.start);
            let fits_after = offset >= cur.end()
                && next_start.map_or(true, |ns| offset + length <= ns);
            if fits_after {
                let merge_prev = offset == cur.end();
                let merge_next = next_start == Some(offset + length);
                match (merge_prev, merge_next) {
                    (true, true) => {
                        // Bridges both neighbors: fold everything into the
                        // earlier one and drop the later.
                        let next_len = self.segments[i + 1].length;
                        self.segments[i].length += length + next_len;
                        self.segments.remove(i + 1);
                    }
                    (true, false) => {
                        self.segments[i].length += length;
                    }
                    (false, true) => {
                        let next = &mut self.segments[i + 1];
                        next.start = offset;
                        next.length += length;
                    }
                    (false, false) => {
                        self.segments.insert(i + 1, SegmentRange::new(offset, length));
                    }
                }
                return;
            }

            i += 1;
        }
    }

    /// Pop the range deliverable from `next_start`, given that `skip_len`
    /// bytes starting there were just received and are known valid without
    /// being consulted here.
    ///
    /// Returns `(next_start, skip_len + extent)` where extent covers any
    /// previously buffered bytes the skip data made contiguous, or
    /// `(next_start, skip_len)` when nothing buffered connects. The returned
    /// data is removed from the list, so only call this when the bytes will
    /// actually be delivered.
    pub fn ready_range(&mut self, next_start: i64, skip_len: i64) -> SegmentRange {
        let skip_start = next_start + skip_len;

        // Segments entirely covered by the skip data are already accounted
        // for.
        while self
            .segments
            .front()
            .map_or(false, |s| s.end() <= skip_start)
        {
            self.segments.pop_front();
        }

        let contiguous = self
            .segments
            .front()
            .map_or(false, |s| s.start <= skip_start);
        if !contiguous {
            return SegmentRange::new(next_start, skip_len);
        }

        let ready = self.segments.pop_front().expect("non-empty");
        // Adjacent segments would have been merged on insert.
        debug_assert!(self
            .segments
            .front()
            .map_or(true, |s| s.start > ready.end()));
        SegmentRange::new(next_start, ready.end() - next_start)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(list: &ReceivedSegmentList) -> Vec<(i64, i64)> {
        list.segments.iter().map(|s| (s.start, s.length)).collect()
    }

    #[test]
    fn disjoint_inserts_stay_separate() {
        let mut list = ReceivedSegmentList::new();
        list.insert(0, 10);
        list.insert(20, 10);
        list.insert(40, 5);
        assert_eq!(ranges(&list), vec![(0, 10), (20, 10), (40, 5)]);
    }

    #[test]
    fn merge_with_previous() {
        let mut list = ReceivedSegmentList::new();
        list.insert(0, 10);
        list.insert(10, 5);
        assert_eq!(ranges(&list), vec![(0, 15)]);
    }

    #[test]
    fn merge_with_next() {
        let mut list = ReceivedSegmentList::new();
        list.insert(0, 10);
        list.insert(30, 10);
        list.insert(20, 10);
        assert_eq!(ranges(&list), vec![(0, 10), (20, 20)]);
    }

    #[test]
    fn merge_bridges_both_neighbors() {
        let mut list = ReceivedSegmentList::new();
        list.insert(0, 10);
        list.insert(20, 10);
        list.insert(10, 10);
        assert_eq!(ranges(&list), vec![(0, 30)]);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let mut list = ReceivedSegmentList::new();
        list.insert(10, 20);
        list.insert(10, 20);
        list.insert(15, 5);
        assert_eq!(ranges(&list), vec![(10, 20)]);
    }

    #[test]
    fn insert_before_front() {
        let mut list = ReceivedSegmentList::new();
        list.insert(20, 10);
        list.insert(0, 5);
        assert_eq!(ranges(&list), vec![(0, 5), (20, 10)]);
        list.insert(5, 15);
        assert_eq!(ranges(&list), vec![(0, 20), (20, 10)]);
    }

    #[test]
    fn ready_range_without_buffered_data() {
        let mut list = ReceivedSegmentList::new();
        let r = list.ready_range(0, 10);
        assert_eq!((r.start, r.length), (0, 10));
    }

    #[test]
    fn ready_range_extends_over_contiguous_segment() {
        let mut list = ReceivedSegmentList::new();
        list.insert(10, 10);
        // Just received [0, 10): the buffered [10, 20) is now contiguous.
        let r = list.ready_range(0, 10);
        assert_eq!((r.start, r.length), (0, 20));
        assert!(list.is_empty());
    }

    #[test]
    fn ready_range_ignores_gap() {
        let mut list = ReceivedSegmentList::new();
        list.insert(30, 10);
        let r = list.ready_range(0, 10);
        assert_eq!((r.start, r.length), (0, 10));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn gap_fill_merges_everything() {
        // [0,10) [20,10) [30,10) then [10,10) bridges everything.
        let mut list = ReceivedSegmentList::new();
        list.insert(0, 10);
        list.insert(20, 10);
        list.insert(30, 10);
        list.insert(10, 10);
        let r = list.ready_range(0, 0);
        assert_eq!((r.start, r.length), (0, 40));
    }

    #[test]
    fn repeated_ready_range_yields_maximal_prefix() {
        let mut list = ReceivedSegmentList::new();
        list.insert(0, 4);
        list.insert(4, 4);
        list.insert(12, 4);
        let mut delivered = 0i64;
        loop {
            let r = list.ready_range(delivered, 0);
            if r.is_empty() {
                break;
            }
            delivered = r.end();
        }
        // [12, 16) is unreachable until [8, 12) arrives.
        assert_eq!(delivered, 8);
    }
}
