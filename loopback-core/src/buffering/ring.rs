//! Ring storage and cursor discipline.
//!
//! Cursors are free-running `u32` counters. They are only masked when used
//! as an index, so `write - read` (wrapping) is always the number of queued
//! frames, in `[0, capacity]`, no matter how many times either counter has
//! wrapped.
//!
//! Ordering:
//! - the producer writes sample cells, then publishes `write` with `Release`;
//!   the consumer loads `write` with `Acquire` before reading those cells.
//! - the consumer reads sample cells, then publishes `read` with `Release`;
//!   the producer loads `read` with `Acquire` before overwriting those cells.
//!
//! Sample cells are `AtomicU32` holding `f32` bit patterns and are accessed
//! `Relaxed`; the cursor pair provides all cross-thread ordering.

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use super::MAX_CAPACITY_FRAMES;
use crate::error::{LoopbackError, Result};

/// Keeps each cursor on its own cache line so the two callback threads do
/// not false-share.
#[repr(align(64))]
struct CacheLine<T>(T);

struct Shared {
    storage: Box<[AtomicU32]>,
    capacity: u32,
    mask: u32,
    write: CacheLine<AtomicU32>,
    read: CacheLine<AtomicU32>,
    producer_claimed: AtomicBool,
    consumer_claimed: AtomicBool,
}

impl Shared {
    /// `read` is loaded first so a concurrent observer can only overestimate,
    /// never underflow; the clamp bounds the overestimate.
    fn available_to_read(&self) -> u32 {
        let read = self.read.0.load(Ordering::Acquire);
        let write = self.write.0.load(Ordering::Acquire);
        write.wrapping_sub(read).min(self.capacity)
    }

    #[inline]
    fn slot(&self, cursor: u32) -> &AtomicU32 {
        &self.storage[(cursor & self.mask) as usize]
    }
}

/// Owning handle to a fixed-capacity ring of mono f32 frames.
///
/// Hands out at most one [`FrameProducer`] and one [`FrameConsumer`] at a
/// time. Dropping a handle releases its claim so a restarted stream can
/// take it again.
pub struct FrameRing {
    shared: Arc<Shared>,
}

impl FrameRing {
    /// Allocate a ring holding at least `requested_frames` frames.
    ///
    /// The capacity is rounded up to the next power of two.
    ///
    /// # Errors
    /// `LoopbackError::InvalidConfig` when `requested_frames` is zero or the
    /// rounded capacity exceeds [`MAX_CAPACITY_FRAMES`].
    pub fn with_capacity(requested_frames: usize) -> Result<Self> {
        Self::with_cursor_origin(requested_frames, 0)
    }

    fn with_cursor_origin(requested_frames: usize, origin: u32) -> Result<Self> {
        if requested_frames == 0 {
            return Err(LoopbackError::InvalidConfig(
                "ring capacity must be at least one frame".into(),
            ));
        }
        let capacity = requested_frames
            .checked_next_power_of_two()
            .filter(|c| *c <= MAX_CAPACITY_FRAMES)
            .ok_or_else(|| {
                LoopbackError::InvalidConfig(format!(
                    "ring capacity {requested_frames} exceeds maximum {MAX_CAPACITY_FRAMES}"
                ))
            })?;

        let storage = (0..capacity)
            .map(|_| AtomicU32::new(0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            shared: Arc::new(Shared {
                storage,
                capacity: capacity as u32,
                mask: capacity as u32 - 1,
                write: CacheLine(AtomicU32::new(origin)),
                read: CacheLine(AtomicU32::new(origin)),
                producer_claimed: AtomicBool::new(false),
                consumer_claimed: AtomicBool::new(false),
            }),
        })
    }

    /// Claim the producer half. `None` while another producer is alive.
    pub fn producer(&self) -> Option<FrameProducer> {
        self.shared
            .producer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FrameProducer {
                shared: Arc::clone(&self.shared),
            })
    }

    /// Claim the consumer half. `None` while another consumer is alive.
    pub fn consumer(&self) -> Option<FrameConsumer> {
        self.shared
            .consumer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FrameConsumer {
                shared: Arc::clone(&self.shared),
            })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    /// Frames queued and not yet consumed (a snapshot; either side may move).
    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read() as usize
    }

    pub fn available_to_write(&self) -> usize {
        (self.shared.capacity - self.shared.available_to_read()) as usize
    }
}

impl fmt::Debug for FrameRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRing")
            .field("capacity", &self.capacity())
            .field("available_to_read", &self.available_to_read())
            .finish()
    }
}

/// Write half. Held by the capture callback.
pub struct FrameProducer {
    shared: Arc<Shared>,
}

impl FrameProducer {
    /// Enqueue as many of `samples` as fit; returns the number accepted.
    ///
    /// On overrun the *incoming* tail is dropped: the first
    /// `available_to_write()` samples are kept and nothing already queued is
    /// overwritten.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let shared = &*self.shared;
        let write = shared.write.0.load(Ordering::Relaxed);
        let read = shared.read.0.load(Ordering::Acquire);
        let free = shared.capacity - write.wrapping_sub(read);
        let accepted = samples.len().min(free as usize);

        for (i, sample) in samples[..accepted].iter().enumerate() {
            shared
                .slot(write.wrapping_add(i as u32))
                .store(sample.to_bits(), Ordering::Relaxed);
        }
        shared
            .write
            .0
            .store(write.wrapping_add(accepted as u32), Ordering::Release);
        accepted
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    pub fn available_to_write(&self) -> usize {
        (self.shared.capacity - self.shared.available_to_read()) as usize
    }

    pub fn is_full(&self) -> bool {
        self.available_to_write() == 0
    }
}

impl Drop for FrameProducer {
    fn drop(&mut self) {
        self.shared.producer_claimed.store(false, Ordering::Release);
    }
}

/// Read half. Held by the playback callback.
pub struct FrameConsumer {
    shared: Arc<Shared>,
}

impl FrameConsumer {
    /// Dequeue into `destination`; returns the number of frames delivered.
    ///
    /// Slots past the delivered count are zero-filled (silence), never left
    /// holding stale samples.
    pub fn pop(&mut self, destination: &mut [f32]) -> usize {
        let shared = &*self.shared;
        let read = shared.read.0.load(Ordering::Relaxed);
        let write = shared.write.0.load(Ordering::Acquire);
        let available = write.wrapping_sub(read) as usize;
        let delivered = destination.len().min(available);

        let (filled, silent) = destination.split_at_mut(delivered);
        for (i, out) in filled.iter_mut().enumerate() {
            *out = f32::from_bits(
                shared
                    .slot(read.wrapping_add(i as u32))
                    .load(Ordering::Relaxed),
            );
        }
        shared
            .read
            .0
            .store(read.wrapping_add(delivered as u32), Ordering::Release);
        silent.fill(0.0);
        delivered
    }

    /// Drop all but the newest `keep` queued frames; returns how many were
    /// dropped. Consumer-side only, so it is as real-time safe as `pop`.
    pub fn discard_backlog(&mut self, keep: usize) -> usize {
        let shared = &*self.shared;
        let read = shared.read.0.load(Ordering::Relaxed);
        let write = shared.write.0.load(Ordering::Acquire);
        let available = write.wrapping_sub(read) as usize;
        if available <= keep {
            return 0;
        }
        let dropped = available - keep;
        shared
            .read
            .0
            .store(read.wrapping_add(dropped as u32), Ordering::Release);
        dropped
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity as usize
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.shared.consumer_claimed.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, start: f32) -> Vec<f32> {
        (0..len).map(|i| start + i as f32).collect()
    }

    /// Small xorshift so the invariant test is deterministic without extra deps.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(FrameRing::with_capacity(1).unwrap().capacity(), 1);
        assert_eq!(FrameRing::with_capacity(100).unwrap().capacity(), 128);
        assert_eq!(FrameRing::with_capacity(65_536).unwrap().capacity(), 65_536);
    }

    #[test]
    fn rejects_zero_and_oversized_capacity() {
        assert!(matches!(
            FrameRing::with_capacity(0),
            Err(LoopbackError::InvalidConfig(_))
        ));
        assert!(matches!(
            FrameRing::with_capacity(MAX_CAPACITY_FRAMES + 1),
            Err(LoopbackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn push_then_pop_returns_same_samples() {
        let ring = FrameRing::with_capacity(8).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut consumer = ring.consumer().unwrap();

        let a = [0.25, -0.5, 1.0, f32::MIN_POSITIVE];
        assert_eq!(producer.push(&a), 4);
        let mut dst = [9.0; 4];
        assert_eq!(consumer.pop(&mut dst), 4);
        assert_eq!(
            dst.map(f32::to_bits),
            a.map(f32::to_bits),
            "samples must round-trip bit for bit"
        );
    }

    #[test]
    fn overrun_keeps_offered_prefix_and_drops_tail() {
        let ring = FrameRing::with_capacity(16).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut consumer = ring.consumer().unwrap();

        let x = ramp(16 + 10, 1.0);
        assert_eq!(producer.push(&x), 16);
        assert!(producer.is_full());
        assert_eq!(producer.push(&[42.0]), 0);

        let mut dst = vec![0.0; 16];
        assert_eq!(consumer.pop(&mut dst), 16);
        assert_eq!(dst, &x[..16]);
    }

    #[test]
    fn underrun_zero_fills_destination() {
        let ring = FrameRing::with_capacity(32).unwrap();
        let mut consumer = ring.consumer().unwrap();
        let mut dst = [7.0f32; 16];
        assert_eq!(consumer.pop(&mut dst), 0);
        assert!(dst.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn partial_underrun_fills_only_the_shortfall() {
        let ring = FrameRing::with_capacity(32).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut consumer = ring.consumer().unwrap();
        producer.push(&[1.0, 2.0, 3.0]);

        let mut dst = [7.0f32; 6];
        assert_eq!(consumer.pop(&mut dst), 3);
        assert_eq!(dst, [1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn read_plus_write_availability_equals_capacity() {
        let ring = FrameRing::with_capacity(64).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut consumer = ring.consumer().unwrap();
        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let block = ramp(100, 0.0);
        let mut dst = vec![0.0; 100];

        for _ in 0..10_000 {
            let n = (rng.next() % 100) as usize;
            if rng.next() % 2 == 0 {
                producer.push(&block[..n]);
            } else {
                consumer.pop(&mut dst[..n]);
            }
            assert_eq!(
                ring.available_to_read() + ring.available_to_write(),
                ring.capacity()
            );
            assert!(ring.available_to_read() <= ring.capacity());
        }
    }

    #[test]
    fn cursors_survive_u32_wraparound() {
        // Start 5 frames short of the u32 boundary so every block below
        // straddles or follows the wrap.
        let ring = FrameRing::with_cursor_origin(8, u32::MAX - 4).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut consumer = ring.consumer().unwrap();
        let mut dst = [0.0f32; 6];
        let mut next = 1.0f32;

        for round in 0..2_000 {
            let block = ramp(6, next);
            assert_eq!(producer.push(&block), 6, "round {round}");
            assert_eq!(ring.available_to_read(), 6);
            assert_eq!(ring.available_to_write(), 2);

            assert_eq!(consumer.pop(&mut dst), 6, "round {round}");
            assert_eq!(dst.as_slice(), block.as_slice(), "round {round}");
            assert_eq!(ring.available_to_read(), 0);
            next += 6.0;
            if next > 1.0e6 {
                next = 1.0;
            }
        }
    }

    #[test]
    fn full_ring_stays_full_across_wrap() {
        let ring = FrameRing::with_cursor_origin(4, u32::MAX - 1).unwrap();
        let mut producer = ring.producer().unwrap();
        assert_eq!(producer.push(&[1.0, 2.0, 3.0, 4.0, 5.0]), 4);
        assert_eq!(ring.available_to_read(), 4);
        assert_eq!(ring.available_to_write(), 0);
    }

    #[test]
    fn only_one_handle_per_side_until_dropped() {
        let ring = FrameRing::with_capacity(4).unwrap();
        let producer = ring.producer().unwrap();
        assert!(ring.producer().is_none());
        drop(producer);
        assert!(ring.producer().is_some());

        let consumer = ring.consumer().unwrap();
        assert!(ring.consumer().is_none());
        drop(consumer);
        assert!(ring.consumer().is_some());
    }

    #[test]
    fn reclaimed_producer_continues_where_previous_stopped() {
        let ring = FrameRing::with_capacity(8).unwrap();
        let mut consumer = ring.consumer().unwrap();
        {
            let mut first = ring.producer().unwrap();
            first.push(&[1.0, 2.0]);
        }
        let mut second = ring.producer().unwrap();
        second.push(&[3.0]);

        let mut dst = [0.0; 3];
        assert_eq!(consumer.pop(&mut dst), 3);
        assert_eq!(dst, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn discard_backlog_keeps_newest_frames() {
        let ring = FrameRing::with_capacity(64).unwrap();
        let mut producer = ring.producer().unwrap();
        let mut consumer = ring.consumer().unwrap();
        producer.push(&ramp(40, 1.0));

        assert_eq!(consumer.discard_backlog(8), 32);
        assert_eq!(consumer.available_to_read(), 8);
        let mut out = [0.0f32; 8];
        assert_eq!(consumer.pop(&mut out), 8);
        assert_eq!(&out[..], &ramp(8, 33.0)[..]);

        producer.push(&ramp(4, 100.0));
        assert_eq!(consumer.discard_backlog(8), 0);
        assert_eq!(consumer.available_to_read(), 4);
    }
}
