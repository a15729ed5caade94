//! Lock-free SPSC ring buffer for mono f32 audio frames.
//!
//! [`FrameRing`] owns the storage; the capture side claims a [`FrameProducer`]
//! and the playback side claims a [`FrameConsumer`]. Both `push` and `pop` are
//! wait-free and allocation-free, so they are safe to call from a real-time
//! audio callback.

mod ring;

pub use ring::{FrameConsumer, FrameProducer, FrameRing};

/// Default capacity: 2^16 = 65 536 frames ≈ 1.37 s at 48 kHz.
/// Bounds worst-case latency under backpressure only; steady-state latency
/// stays near zero while both callbacks keep pace.
pub const DEFAULT_CAPACITY_FRAMES: usize = 1 << 16;

/// Largest accepted capacity: 2^24 frames ≈ 5.8 min at 48 kHz.
pub const MAX_CAPACITY_FRAMES: usize = 1 << 24;
