//! # loopback-core
//!
//! Low-latency duplex loopback: audio captured from the default input device
//! is played back on the default output device.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → capture callback → CapturePort → SPSC FrameRing
//!                                                     │
//!              speaker ← playback callback ← PlaybackPort
//!
//! control thread: DuplexEngine::{start, supervise, stop}
//!                      ▲
//!                      └── bounded fault channel ── ports
//! ```
//!
//! Both callbacks are lock-free and zero-alloc. Everything that can block or
//! allocate happens on the control thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod adapter;
pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod events;

// Convenience re-exports for downstream crates
pub use adapter::{AudioBackend, AudioStream, NegotiatedStream, StreamDirection, StreamParams};
pub use buffering::{FrameConsumer, FrameProducer, FrameRing};
pub use engine::{
    diagnostics::DiagnosticsSnapshot, DuplexConfig, DuplexEngine, EngineConfig,
};
pub use error::{LoopbackError, StreamInitError};
pub use events::{EngineState, EngineStatusEvent};
