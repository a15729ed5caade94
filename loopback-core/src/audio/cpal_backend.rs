//! Hardware backend via cpal (ALSA, WASAPI, CoreAudio, AAudio, …).
//!
//! # Design constraints
//!
//! cpal runs the data callbacks on OS audio threads, at elevated priority
//! where the platform supports it. Each callback only moves frames between
//! the device buffer and its port, through a scratch buffer allocated when
//! the stream is built. Nothing in a callback locks or allocates.
//!
//! Only `f32` streams are opened. Mono is preferred; otherwise the device's
//! smallest channel count at the requested rate is used. Capture keeps the
//! first channel and playback writes the signal to every channel. A device
//! with no `f32` configuration at the requested rate fails with
//! `code::UNSUPPORTED_CONFIG`; no sample format conversion is attempted.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so [`CpalStream`] must be created and dropped on the same thread.
//! The engine does both on its control thread.

#[cfg(feature = "audio-cpal")]
pub use imp::{CpalBackend, CpalStream};

#[cfg(not(feature = "audio-cpal"))]
pub use stub::{CpalBackend, CpalStream};

use crate::adapter::StreamParams;

/// One supported device configuration, as far as negotiation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(super) struct Candidate {
    channels: u16,
    min_sample_rate: u32,
    max_sample_rate: u32,
    is_f32: bool,
    /// Inclusive callback size range, when the device reports one.
    block_range: Option<(u32, u32)>,
}

/// Frames of mono scratch per chunk when a device is multichannel.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
const SCRATCH_FRAMES: usize = 1_024;

/// The device configuration negotiation settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(super) struct Choice {
    pub channels: u16,
    /// Pinned frames per callback, when the device allows the hint.
    pub block: Option<u32>,
}

/// Pick an f32 candidate at the requested rate, preferring the requested
/// channel count and then the fewest channels.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(super) fn choose(candidates: &[Candidate], params: &StreamParams) -> Option<Choice> {
    let rate = params.sample_rate;
    candidates
        .iter()
        .filter(|c| {
            c.is_f32 && c.channels >= 1 && c.min_sample_rate <= rate && rate <= c.max_sample_rate
        })
        .min_by_key(|c| (c.channels != params.channels, c.channels))
        .map(|c| Choice {
            channels: c.channels,
            block: match c.block_range {
                Some((min, max)) if (min..=max).contains(&params.block_size_hint) => {
                    Some(params.block_size_hint)
                }
                _ => None,
            },
        })
}

/// Feed the first channel of an interleaved capture buffer to `sink`, one
/// scratch-sized chunk at a time.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(super) fn capture_first_channel(
    interleaved: &[f32],
    channels: usize,
    scratch: &mut [f32],
    mut sink: impl FnMut(&[f32]),
) {
    if channels <= 1 {
        sink(interleaved);
        return;
    }
    for chunk in interleaved.chunks(channels * scratch.len()) {
        let mut frames = 0;
        for (out, frame) in scratch.iter_mut().zip(chunk.chunks_exact(channels)) {
            *out = frame[0];
            frames += 1;
        }
        sink(&scratch[..frames]);
    }
}

/// Fill an interleaved playback buffer from the mono `source`, copying each
/// frame to every channel.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
pub(super) fn play_on_all_channels(
    interleaved: &mut [f32],
    channels: usize,
    scratch: &mut [f32],
    mut source: impl FnMut(&mut [f32]),
) {
    if channels <= 1 {
        source(interleaved);
        return;
    }
    let chunk_len = channels * scratch.len();
    for chunk in interleaved.chunks_mut(chunk_len) {
        let frames = chunk.len() / channels;
        source(&mut scratch[..frames]);
        for (frame, &sample) in chunk.chunks_exact_mut(channels).zip(&scratch[..frames]) {
            frame.fill(sample);
        }
        // A trailing partial frame cannot be addressed; keep it silent.
        chunk[frames * channels..].fill(0.0);
    }
}

#[cfg(feature = "audio-cpal")]
mod imp {
    use cpal::{
        traits::{DeviceTrait, HostTrait, StreamTrait},
        BufferSize, BuildStreamError, PlayStreamError, SampleFormat, SampleRate, StreamConfig,
        StreamError, SupportedBufferSize, SupportedStreamConfigRange,
    };
    use tracing::{debug, info};

    use super::{capture_first_channel, choose, play_on_all_channels, Candidate, SCRATCH_FRAMES};
    use crate::{
        adapter::{
            AudioBackend, AudioStream, CapturePort, FaultCause, FaultHandle, NegotiatedStream,
            PlaybackPort, StreamDirection, StreamParams,
        },
        error::{code, StreamInitError},
    };

    impl From<&SupportedStreamConfigRange> for Candidate {
        fn from(range: &SupportedStreamConfigRange) -> Self {
            Candidate {
                channels: range.channels(),
                min_sample_rate: range.min_sample_rate().0,
                max_sample_rate: range.max_sample_rate().0,
                is_f32: range.sample_format() == SampleFormat::F32,
                block_range: match range.buffer_size() {
                    SupportedBufferSize::Range { min, max } => Some((*min, *max)),
                    SupportedBufferSize::Unknown => None,
                },
            }
        }
    }

    /// Opens the host's default input and output devices.
    pub struct CpalBackend {
        host: cpal::Host,
    }

    impl CpalBackend {
        pub fn new() -> Self {
            Self {
                host: cpal::default_host(),
            }
        }
    }

    impl Default for CpalBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Handle to a live cpal stream. Dropping the inner stream joins or
    /// disposes the platform callback thread, so `stop` drops it.
    pub struct CpalStream {
        stream: Option<cpal::Stream>,
        negotiated: NegotiatedStream,
    }

    impl AudioStream for CpalStream {
        fn start(&mut self) -> Result<(), StreamInitError> {
            let direction = self.negotiated.direction;
            let stream = self.stream.as_ref().ok_or_else(|| {
                StreamInitError::new(direction, code::STREAM_PLAY, "stream already stopped")
            })?;
            stream.play().map_err(|e| play_error(direction, e))
        }

        fn stop(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.pause();
                drop(stream);
                debug!(direction = %self.negotiated.direction, "cpal stream released");
            }
        }

        fn negotiated(&self) -> &NegotiatedStream {
            &self.negotiated
        }
    }

    impl Drop for CpalStream {
        fn drop(&mut self) {
            self.stop();
        }
    }

    impl AudioBackend for CpalBackend {
        type Stream = CpalStream;

        fn name(&self) -> String {
            format!("cpal/{}", self.host.id().name().to_ascii_lowercase())
        }

        fn open_capture(
            &mut self,
            params: &StreamParams,
            mut port: CapturePort,
        ) -> Result<CpalStream, StreamInitError> {
            let direction = StreamDirection::Capture;
            let device = self.host.default_input_device().ok_or_else(|| {
                StreamInitError::new(direction, code::NO_DEVICE, "no default input device")
            })?;
            let device_name = device.name().unwrap_or_else(|_| "Input Device".into());

            let candidates = device
                .supported_input_configs()
                .map_err(|e| StreamInitError::new(direction, code::BACKEND, e.to_string()))?
                .map(|range| Candidate::from(&range))
                .collect::<Vec<_>>();
            let config = stream_config(direction, &candidates, params)?;

            info!(
                device = device_name.as_str(),
                sample_rate = params.sample_rate,
                channels = config.channels,
                buffer = ?config.buffer_size,
                "opening input device"
            );

            let faults = port.fault_handle();
            let channels = usize::from(config.channels);
            let mut scratch = vec![0.0f32; SCRATCH_FRAMES];
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        capture_first_channel(data, channels, &mut scratch, |mono| {
                            port.on_captured_frames(mono);
                        });
                    },
                    move |err| report_stream_error(&faults, err),
                    None,
                )
                .map_err(|e| build_error(direction, e))?;

            Ok(CpalStream {
                stream: Some(stream),
                negotiated: negotiated(direction, device_name, &config),
            })
        }

        fn open_playback(
            &mut self,
            params: &StreamParams,
            mut port: PlaybackPort,
        ) -> Result<CpalStream, StreamInitError> {
            let direction = StreamDirection::Playback;
            let device = self.host.default_output_device().ok_or_else(|| {
                StreamInitError::new(direction, code::NO_DEVICE, "no default output device")
            })?;
            let device_name = device.name().unwrap_or_else(|_| "Output Device".into());

            let candidates = device
                .supported_output_configs()
                .map_err(|e| StreamInitError::new(direction, code::BACKEND, e.to_string()))?
                .map(|range| Candidate::from(&range))
                .collect::<Vec<_>>();
            let config = stream_config(direction, &candidates, params)?;

            info!(
                device = device_name.as_str(),
                sample_rate = params.sample_rate,
                channels = config.channels,
                buffer = ?config.buffer_size,
                "opening output device"
            );

            let faults = port.fault_handle();
            let channels = usize::from(config.channels);
            let mut scratch = vec![0.0f32; SCRATCH_FRAMES];
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        play_on_all_channels(data, channels, &mut scratch, |mono| {
                            port.on_playback_request(mono);
                        });
                    },
                    move |err| report_stream_error(&faults, err),
                    None,
                )
                .map_err(|e| build_error(direction, e))?;

            Ok(CpalStream {
                stream: Some(stream),
                negotiated: negotiated(direction, device_name, &config),
            })
        }
    }

    fn stream_config(
        direction: StreamDirection,
        candidates: &[Candidate],
        params: &StreamParams,
    ) -> Result<StreamConfig, StreamInitError> {
        let choice = choose(candidates, params).ok_or_else(|| {
            StreamInitError::new(
                direction,
                code::UNSUPPORTED_CONFIG,
                format!("device offers no f32 stream at {} Hz", params.sample_rate),
            )
        })?;
        Ok(StreamConfig {
            channels: choice.channels,
            sample_rate: SampleRate(params.sample_rate),
            buffer_size: choice.block.map_or(BufferSize::Default, BufferSize::Fixed),
        })
    }

    fn negotiated(
        direction: StreamDirection,
        device_name: String,
        config: &StreamConfig,
    ) -> NegotiatedStream {
        NegotiatedStream {
            direction,
            device_name,
            sample_rate: config.sample_rate.0,
            channels: config.channels,
            block_size: match config.buffer_size {
                BufferSize::Fixed(frames) => Some(frames),
                BufferSize::Default => None,
            },
        }
    }

    /// cpal error callback. Runs on the audio thread on some hosts, so it
    /// only counts and forwards.
    fn report_stream_error(faults: &FaultHandle, err: StreamError) {
        match err {
            StreamError::DeviceNotAvailable => faults.fatal(FaultCause::DeviceLost),
            _ => {
                // cpal has already recovered the stream in place; the port
                // only decides whether the streak is still tolerable.
                let _ = faults.transient();
            }
        }
    }

    fn build_error(direction: StreamDirection, err: BuildStreamError) -> StreamInitError {
        let code = match &err {
            BuildStreamError::DeviceNotAvailable => code::DEVICE_UNAVAILABLE,
            BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
                code::UNSUPPORTED_CONFIG
            }
            BuildStreamError::BackendSpecific { .. } => code::BACKEND,
            _ => code::STREAM_BUILD,
        };
        StreamInitError::new(direction, code, err.to_string())
    }

    fn play_error(direction: StreamDirection, err: PlayStreamError) -> StreamInitError {
        let code = match &err {
            PlayStreamError::DeviceNotAvailable => code::DEVICE_UNAVAILABLE,
            _ => code::STREAM_PLAY,
        };
        StreamInitError::new(direction, code, err.to_string())
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
mod stub {
    use crate::{
        adapter::{
            AudioBackend, AudioStream, CapturePort, NegotiatedStream, PlaybackPort,
            StreamDirection, StreamParams,
        },
        error::{code, StreamInitError},
    };

    #[derive(Default)]
    pub struct CpalBackend;

    impl CpalBackend {
        pub fn new() -> Self {
            Self
        }
    }

    /// Never constructed: every open fails.
    pub enum CpalStream {}

    impl AudioStream for CpalStream {
        fn start(&mut self) -> Result<(), StreamInitError> {
            match *self {}
        }

        fn stop(&mut self) {
            match *self {}
        }

        fn negotiated(&self) -> &NegotiatedStream {
            match *self {}
        }
    }

    fn unavailable(direction: StreamDirection) -> StreamInitError {
        StreamInitError::new(
            direction,
            code::UNAVAILABLE,
            "compiled without audio-cpal feature",
        )
    }

    impl AudioBackend for CpalBackend {
        type Stream = CpalStream;

        fn name(&self) -> String {
            "cpal (disabled)".into()
        }

        fn open_capture(
            &mut self,
            _params: &StreamParams,
            _port: CapturePort,
        ) -> Result<CpalStream, StreamInitError> {
            Err(unavailable(StreamDirection::Capture))
        }

        fn open_playback(
            &mut self,
            _params: &StreamParams,
            _port: PlaybackPort,
        ) -> Result<CpalStream, StreamInitError> {
            Err(unavailable(StreamDirection::Playback))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(rate: u32, hint: u32) -> StreamParams {
        StreamParams {
            sample_rate: rate,
            channels: 1,
            block_size_hint: hint,
        }
    }

    fn candidate(channels: u16, is_f32: bool, block_range: Option<(u32, u32)>) -> Candidate {
        Candidate {
            channels,
            min_sample_rate: 44_100,
            max_sample_rate: 96_000,
            is_f32,
            block_range,
        }
    }

    fn choice(channels: u16, block: Option<u32>) -> Option<Choice> {
        Some(Choice { channels, block })
    }

    #[test]
    fn picks_mono_f32_and_pins_block_inside_range() {
        let candidates = [
            candidate(2, true, Some((64, 4096))),
            candidate(1, false, Some((64, 4096))),
            candidate(1, true, Some((64, 4096))),
        ];
        assert_eq!(choose(&candidates, &params(48_000, 128)), choice(1, Some(128)));
    }

    #[test]
    fn falls_back_to_default_block_when_hint_out_of_range() {
        let candidates = [candidate(1, true, Some((256, 4096)))];
        assert_eq!(choose(&candidates, &params(48_000, 128)), choice(1, None));

        let unknown = [candidate(1, true, None)];
        assert_eq!(choose(&unknown, &params(48_000, 128)), choice(1, None));
    }

    #[test]
    fn stereo_only_device_is_opened_with_its_channel_count() {
        let stereo_only = [candidate(2, false, None), candidate(2, true, Some((64, 4096)))];
        assert_eq!(choose(&stereo_only, &params(48_000, 128)), choice(2, Some(128)));

        let surround_or_stereo = [candidate(6, true, None), candidate(2, true, None)];
        assert_eq!(choose(&surround_or_stereo, &params(48_000, 128)), choice(2, None));
    }

    #[test]
    fn rejects_unsupported_rate_or_format() {
        let candidates = [candidate(1, true, None), candidate(2, true, None)];
        assert_eq!(choose(&candidates, &params(22_050, 128)), None);
        assert_eq!(choose(&[candidate(2, false, None)], &params(48_000, 128)), None);
        assert_eq!(choose(&[candidate(0, true, None)], &params(48_000, 128)), None);
    }

    #[test]
    fn capture_keeps_first_channel_across_chunks() {
        // Five stereo frames through a two-frame scratch buffer.
        let interleaved = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0, 5.0, -5.0];
        let mut scratch = [0.0f32; 2];
        let mut captured = Vec::new();
        capture_first_channel(&interleaved, 2, &mut scratch, |mono| {
            captured.extend_from_slice(mono)
        });
        assert_eq!(captured, vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut mono = Vec::new();
        capture_first_channel(&[0.5, 0.25], 1, &mut scratch, |m| mono.extend_from_slice(m));
        assert_eq!(mono, vec![0.5, 0.25]);
    }

    #[test]
    fn playback_fans_mono_out_to_every_channel() {
        let mut next = 0.0f32;
        let mut source = |mono: &mut [f32]| {
            for sample in mono.iter_mut() {
                next += 1.0;
                *sample = next;
            }
        };
        let mut interleaved = [9.0f32; 9];
        let mut scratch = [0.0f32; 2];
        play_on_all_channels(&mut interleaved, 3, &mut scratch, &mut source);
        assert_eq!(interleaved, [1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0]);

        // A buffer that is not a whole number of frames gets silence at the end.
        let mut ragged = [9.0f32; 5];
        play_on_all_channels(&mut ragged, 2, &mut scratch, &mut source);
        assert_eq!(ragged, [4.0, 4.0, 5.0, 5.0, 0.0]);
    }
}
