//! Property: free-running indices survive the u16 wrap
//!
//! The `avail.idx`/`used.idx` counters are free-running and wrap modulo
//! 2^16 while ring slots wrap modulo the queue size. Driving both sides of
//! one queue through well past 65536 completions must keep every decision
//! correct on both sides of the boundary: cookies come back exactly once
//! and in used-ring order, the kick and interrupt decisions stay live, and
//! occupancy accounting never drifts.

use graphite::{Buffer, DeviceQueue, Doorbell, Features, QueueMemory, Virtqueue};

struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&self, _queue_index: u16) {}
}

const QUEUE_SIZE: u16 = 256;
const RING_BASE: u64 = 0;
const DATA_BASE: u64 = 0x10000;

fn setup(features: Features) -> (QueueMemory, Virtqueue<u32>, DeviceQueue) {
    let mem = QueueMemory::new(1024 * 1024).unwrap();
    let vq = Virtqueue::new(
        &mem,
        RING_BASE,
        QUEUE_SIZE,
        0,
        features,
        Box::new(NullDoorbell),
    )
    .unwrap();
    let dq = DeviceQueue::new(RING_BASE, QUEUE_SIZE, 0, features).unwrap();
    (mem, vq, dq)
}

/// Lock-step submit/complete/retrieve across the wrap with event-index
/// suppression live on both sides.
#[test]
fn lock_step_across_wrap() {
    let (mem, mut vq, mut dq) = setup(Features::EVENT_IDX);
    let buf = Buffer::new(DATA_BASE, 4);

    // 70000 round trips push both free-running counters across 65536.
    for cookie in 0..70_000u32 {
        vq.add(&mem, &[buf], &[], cookie).unwrap();
        // One entry outstanding and the device's watermark is always at
        // the previous index, so every publication needs a kick.
        assert!(vq.should_notify(&mem).unwrap(), "at cookie {cookie}");

        let chain = dq.pop(&mem).unwrap().expect("chain must be pending");
        dq.push(&mem, &chain, 0).unwrap();
        // The driver rearms its watermark on every retrieval, so every
        // completion needs an interrupt.
        assert!(dq.should_interrupt(&mem).unwrap(), "at cookie {cookie}");

        assert_eq!(vq.get(&mem).unwrap(), Some((cookie, 0)), "at cookie {cookie}");
        assert!(vq.is_empty(&mem).unwrap());
    }
    assert_eq!(vq.in_flight(), 0);
    assert_eq!(vq.free_descriptors(), QUEUE_SIZE);
}

/// The same crossing at high occupancy: the ring stays nearly full while
/// the counters wrap, and every cookie still comes back exactly once.
#[test]
fn high_occupancy_across_wrap() {
    let (mem, mut vq, mut dq) = setup(Features::empty());
    let buf = Buffer::new(DATA_BASE, 4);
    let depth = (QUEUE_SIZE - 1) as u32;

    let mut next_cookie = 0u32;
    let mut expected = 0u32;
    for _ in 0..depth {
        vq.add(&mem, &[buf], &[], next_cookie).unwrap();
        next_cookie += 1;
    }

    // Steady state: complete one, retrieve one, submit one. 66000 steps
    // walk both indices across the wrap while 255 chains stay in flight.
    for _ in 0..66_000u32 {
        let chain = dq.pop(&mem).unwrap().expect("ring is kept full");
        dq.push(&mem, &chain, 8).unwrap();

        assert_eq!(vq.get(&mem).unwrap(), Some((expected, 8)));
        expected += 1;

        vq.add(&mem, &[buf], &[], next_cookie).unwrap();
        next_cookie += 1;
    }
    assert_eq!(vq.in_flight(), depth);

    // Drain the tail; order and uniqueness hold to the end.
    while let Some(chain) = dq.pop(&mem).unwrap() {
        dq.push(&mem, &chain, 8).unwrap();
    }
    while let Some((cookie, len)) = vq.get(&mem).unwrap() {
        assert_eq!((cookie, len), (expected, 8));
        expected += 1;
    }
    assert_eq!(expected, next_cookie);
    assert_eq!(vq.in_flight(), 0);
    assert_eq!(vq.free_descriptors(), QUEUE_SIZE);
}
