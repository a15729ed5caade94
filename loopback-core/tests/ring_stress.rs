use std::thread;
use std::time::{Duration, Instant};

use loopback_core::buffering::FrameRing;

/// Tags stay exactly representable in f32 and are never zero, so a popped
/// zero can only be underrun fill.
fn tag(seq: u64) -> f32 {
    ((seq % (1 << 23)) + 1) as f32
}

fn run_stress(capacity: usize, push_block: usize, pop_block: usize, frames: u64) {
    let ring = FrameRing::with_capacity(capacity).unwrap();
    let mut producer = ring.producer().unwrap();
    let mut consumer = ring.consumer().unwrap();

    let writer = thread::spawn(move || {
        let mut block = vec![0.0f32; push_block];
        let mut next = 0u64;
        let mut spins = 0u32;
        while next < frames {
            let len = push_block.min((frames - next) as usize);
            for (i, s) in block[..len].iter_mut().enumerate() {
                *s = tag(next + i as u64);
            }
            // Truncated pushes are retried from the first rejected frame.
            let accepted = producer.push(&block[..len]);
            next += accepted as u64;
            if accepted < len {
                spins += 1;
                if spins % 64 == 0 {
                    thread::sleep(Duration::from_micros(50));
                } else {
                    thread::yield_now();
                }
            }
        }
    });

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut out = vec![0.0f32; pop_block];
    let mut expected = 0u64;
    while expected < frames {
        assert!(Instant::now() < deadline, "stress run stalled at {expected}");
        let delivered = consumer.pop(&mut out);
        for &s in &out[..delivered] {
            assert_eq!(s, tag(expected), "frame {expected} out of sequence");
            expected += 1;
        }
        assert!(
            out[delivered..].iter().all(|&s| s == 0.0),
            "underrun fill must be silence"
        );
        if delivered == 0 {
            thread::yield_now();
        }
    }

    writer.join().unwrap();
    assert!(consumer.is_empty());
}

#[test]
fn tagged_sequence_survives_mismatched_block_sizes() {
    run_stress(1024, 128, 96, 2_000_000);
}

#[test]
fn tagged_sequence_survives_tiny_ring() {
    run_stress(16, 7, 5, 300_000);
}

#[test]
fn tagged_sequence_survives_consumer_larger_than_ring() {
    run_stress(64, 48, 256, 500_000);
}
