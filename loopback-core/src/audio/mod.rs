//! Platform backends.
//!
//! - [`cpal_backend`]: the system default input/output devices through cpal
//!   (ALSA, WASAPI, CoreAudio, AAudio). Behind the `audio-cpal` feature;
//!   without it every open fails with `code::UNAVAILABLE`.
//! - [`synthetic`]: paced worker threads with fault injection, for tests and
//!   dry runs on machines without audio hardware.
//!
//! Both implement [`AudioBackend`](crate::adapter::AudioBackend); the engine
//! is generic over it, so the backend is picked at build time (feature) or
//! run time (the CLI's `--backend`).

pub mod cpal_backend;
pub mod device;
pub mod synthetic;

pub use cpal_backend::{CpalBackend, CpalStream};
pub use device::{list_devices, DeviceInfo, DeviceList};
pub use synthetic::{
    PlaybackTap, SignalSource, SineSource, SyntheticBackend, SyntheticControl, SyntheticStream,
};
