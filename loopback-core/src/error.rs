use thiserror::Error;

use crate::adapter::StreamDirection;

/// Platform diagnostic codes carried by [`StreamInitError`].
///
/// Hosts surface these as process exit codes, so they stay in `1..=255`.
pub mod code {
    /// No default device exists for the requested direction.
    pub const NO_DEVICE: i32 = 2;
    /// The device exists but cannot be used right now (busy, unplugged).
    pub const DEVICE_UNAVAILABLE: i32 = 3;
    /// The device does not offer f32 at the requested rate.
    pub const UNSUPPORTED_CONFIG: i32 = 4;
    /// The platform API reported an error it could not classify.
    pub const BACKEND: i32 = 5;
    /// The stream object could not be built.
    pub const STREAM_BUILD: i32 = 6;
    /// The stream was built but refused to start.
    pub const STREAM_PLAY: i32 = 7;
    /// The backend is not compiled into this binary.
    pub const UNAVAILABLE: i32 = 8;
}

/// A capture or playback stream could not be opened, configured or started.
#[derive(Debug, Clone, Error)]
#[error("{direction} stream failed to start (code {code}): {message}")]
pub struct StreamInitError {
    pub direction: StreamDirection,
    /// Platform diagnostic code, see [`code`].
    pub code: i32,
    pub message: String,
}

impl StreamInitError {
    pub fn new(direction: StreamDirection, code: i32, message: impl Into<String>) -> Self {
        Self {
            direction,
            code,
            message: message.into(),
        }
    }
}

/// All errors produced by loopback-core.
#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error(transparent)]
    StreamInit(#[from] StreamInitError),

    #[error("{direction} stream fault after {attempts} restart attempts: {message}")]
    StreamFault {
        direction: StreamDirection,
        attempts: u32,
        message: String,
    },

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopbackError {
    /// Platform diagnostic code when this is an init failure.
    pub fn init_code(&self) -> Option<i32> {
        match self {
            LoopbackError::StreamInit(e) => Some(e.code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LoopbackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_error_message_names_direction_and_code() {
        let err = LoopbackError::from(StreamInitError::new(
            StreamDirection::Playback,
            code::UNSUPPORTED_CONFIG,
            "no mono f32 at 48000 Hz",
        ));
        assert_eq!(err.init_code(), Some(code::UNSUPPORTED_CONFIG));
        assert_eq!(
            err.to_string(),
            "playback stream failed to start (code 4): no mono f32 at 48000 Hz"
        );
    }

    #[test]
    fn non_init_errors_have_no_code() {
        assert_eq!(LoopbackError::AlreadyRunning.init_code(), None);
    }
}
