//! Capture/playback capability interfaces.
//!
//! A platform backend implements [`AudioBackend`]: it opens one capture and
//! one playback [`AudioStream`] on the system default devices. The stream's
//! real-time callback talks to the engine only through the port it was
//! handed:
//!
//! ```text
//! hardware ─► CapturePort::on_captured_frames ─► FrameProducer::push
//!                                                     │ (SPSC ring)
//! hardware ◄─ PlaybackPort::on_playback_request ◄─ FrameConsumer::pop
//! ```
//!
//! # Callback contract
//!
//! Code running inside a stream's data callback **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O or log
//!
//! Transient per-callback failures are recovered in place by the backend
//! (reset/"prepare" and carry on) after telling the port via
//! `on_transient_fault`. Only a lost device, or a streak of transient faults
//! the port refuses to absorb, reaches the engine.

mod fault;
mod port;

pub use fault::{FaultAction, FaultCause, FaultHandle, StreamFaultReport};
pub use port::{CapturePort, PlaybackPort};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StreamInitError;

/// Which side of the duplex pair a stream serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamDirection {
    Capture,
    Playback,
}

impl StreamDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamDirection::Capture => "capture",
            StreamDirection::Playback => "playback",
        }
    }
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream parameters requested by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Preferred frames per callback. Backends may ignore it.
    pub block_size_hint: u32,
}

/// What the backend actually opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiatedStream {
    pub direction: StreamDirection,
    pub device_name: String,
    pub sample_rate: u32,
    /// Device channels. The loopback signal is mono; a multichannel capture
    /// device contributes its first channel and a multichannel playback
    /// device gets the signal on every channel.
    pub channels: u16,
    /// Fixed frames per callback, if the backend could pin one.
    pub block_size: Option<u32>,
}

/// An opened capture or playback stream.
///
/// `stop` must not return while the data callback can still run, and must
/// be safe to call on a stream that was never started or is already stopped.
pub trait AudioStream {
    /// Begin delivering callbacks.
    fn start(&mut self) -> Result<(), StreamInitError>;

    /// Stop delivering callbacks and wait for the callback to go quiet.
    fn stop(&mut self);

    /// Optional capability: raise the callback thread to real-time priority.
    /// Returns `true` only if the request was honoured.
    fn promote_realtime(&mut self) -> bool {
        false
    }

    fn negotiated(&self) -> &NegotiatedStream;
}

/// One implementation per platform backend.
pub trait AudioBackend {
    type Stream: AudioStream;

    /// Short backend name for logs (`"cpal/alsa"`, `"synthetic"`, …).
    fn name(&self) -> String;

    /// Open the default input device. The returned stream owns `port`;
    /// dropping the stream drops the port and releases its ring claim.
    fn open_capture(
        &mut self,
        params: &StreamParams,
        port: CapturePort,
    ) -> Result<Self::Stream, StreamInitError>;

    /// Open the default output device. Same ownership rules as capture.
    fn open_playback(
        &mut self,
        params: &StreamParams,
        port: PlaybackPort,
    ) -> Result<Self::Stream, StreamInitError>;
}
