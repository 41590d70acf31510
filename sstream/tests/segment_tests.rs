//! Received-segment list behavior over longer insert sequences.

use sstream::ReceivedSegmentList;

/// Drain the maximal contiguous prefix starting at 0.
fn drain_prefix(list: &mut ReceivedSegmentList) -> i64 {
    let mut delivered = 0i64;
    loop {
        let range = list.ready_range(delivered, 0);
        if range.is_empty() {
            break;
        }
        assert_eq!(range.start, delivered);
        delivered = range.end();
    }
    delivered
}

#[test]
fn out_of_order_inserts_merge_to_one_range() {
    let mut list = ReceivedSegmentList::new();
    list.insert(0, 10);
    list.insert(20, 10);
    list.insert(30, 10);
    list.insert(10, 10);
    let range = list.ready_range(0, 0);
    assert_eq!((range.start, range.length), (0, 40));
    assert!(list.is_empty());
}

#[test]
fn prefix_stops_at_first_hole() {
    let mut list = ReceivedSegmentList::new();
    for offset in [0i64, 4, 8, 16, 20, 28] {
        list.insert(offset, 4);
    }
    // [0,12) is contiguous; 12..16 is missing.
    assert_eq!(drain_prefix(&mut list), 12);

    list.insert(12, 4);
    // Delivery resumes at 12 and runs to the next hole at 24.
    let range = list.ready_range(12, 0);
    assert_eq!(range.end(), 24);
}

#[test]
fn reversed_arrival_order() {
    let mut list = ReceivedSegmentList::new();
    for i in (0..50).rev() {
        list.insert(i * 100, 100);
    }
    assert_eq!(drain_prefix(&mut list), 5000);
}

#[test]
fn interleaved_arrival_order() {
    let mut list = ReceivedSegmentList::new();
    // Evens first, then odds.
    for i in (0..40).step_by(2) {
        list.insert(i * 10, 10);
    }
    for i in (1..40).step_by(2) {
        list.insert(i * 10, 10);
    }
    assert_eq!(drain_prefix(&mut list), 400);
}

#[test]
fn duplicates_during_retransmission_change_nothing() {
    let mut list = ReceivedSegmentList::new();
    list.insert(0, 8);
    list.insert(16, 8);
    // Retransmissions re-announce the same ranges.
    list.insert(16, 8);
    list.insert(0, 8);
    assert_eq!(drain_prefix(&mut list), 8);

    list.insert(8, 8);
    let range = list.ready_range(8, 0);
    assert_eq!(range.end(), 24);
}

#[test]
fn skip_length_accounts_for_bytes_just_received() {
    let mut list = ReceivedSegmentList::new();
    list.insert(100, 50);
    // 100 bytes just landed at the delivery point; with the buffered
    // [100, 150) that makes 150 deliverable.
    list.insert(0, 100);
    let range = list.ready_range(0, 100);
    assert_eq!((range.start, range.length), (0, 150));
}
