//! Synthetic backend: paced worker threads stand in for the hardware.
//!
//! The capture worker fills fixed-size blocks from a [`SignalSource`] and
//! hands them to its [`CapturePort`]; the playback worker pulls blocks from
//! its [`PlaybackPort`] and records them into a [`PlaybackTap`]. Both pace
//! themselves against absolute deadlines, so their long-run rates match the
//! configured sample rate exactly, the way two clocked devices would.
//!
//! [`SyntheticControl`] injects open failures, transient faults and device
//! loss while the engine is running.

use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{
    adapter::{
        AudioBackend, AudioStream, CapturePort, FaultAction, FaultCause, NegotiatedStream,
        PlaybackPort, StreamDirection, StreamParams,
    },
    error::{code, StreamInitError},
};

/// Produces captured audio for the synthetic capture worker.
pub trait SignalSource: Send + 'static {
    fn fill(&mut self, block: &mut [f32]);
}

impl<F> SignalSource for F
where
    F: FnMut(&mut [f32]) + Send + 'static,
{
    fn fill(&mut self, block: &mut [f32]) {
        self(block)
    }
}

/// Sine generator whose output depends only on the absolute sample index,
/// so any block partitioning yields the same sequence.
#[derive(Debug, Clone)]
pub struct SineSource {
    frequency: f64,
    sample_rate: f64,
    amplitude: f32,
    index: u64,
}

impl SineSource {
    pub fn new(frequency_hz: f32, sample_rate: u32, amplitude: f32) -> Self {
        Self {
            frequency: frequency_hz as f64,
            sample_rate: sample_rate as f64,
            amplitude,
            index: 0,
        }
    }

    pub fn sample_at(&self, index: u64) -> f32 {
        let phase = (index as f64 * self.frequency / self.sample_rate).fract();
        (self.amplitude as f64 * (std::f64::consts::TAU * phase).sin()) as f32
    }
}

impl SignalSource for SineSource {
    fn fill(&mut self, block: &mut [f32]) {
        for out in block.iter_mut() {
            *out = self.sample_at(self.index);
            self.index += 1;
        }
    }
}

/// Everything the synthetic playback worker emitted, in order.
#[derive(Clone, Default)]
pub struct PlaybackTap {
    samples: Arc<Mutex<Vec<f32>>>,
}

impl PlaybackTap {
    pub fn snapshot(&self) -> Vec<f32> {
        self.samples.lock().clone()
    }

    pub fn take(&self) -> Vec<f32> {
        std::mem::take(&mut *self.samples.lock())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, block: &[f32]) {
        self.samples.lock().extend_from_slice(block);
    }
}

#[derive(Default)]
struct ControlState {
    fail_open: [AtomicI32; 2],
    transient: [AtomicU32; 2],
    kill: [AtomicBool; 2],
    opens: [AtomicU32; 2],
    live: AtomicU32,
}

fn index(direction: StreamDirection) -> usize {
    match direction {
        StreamDirection::Capture => 0,
        StreamDirection::Playback => 1,
    }
}

/// Fault injection and bookkeeping shared with a [`SyntheticBackend`].
#[derive(Clone, Default)]
pub struct SyntheticControl {
    inner: Arc<ControlState>,
}

impl SyntheticControl {
    /// Make every following open of `direction` fail with `code`.
    pub fn fail_opens(&self, direction: StreamDirection, code: i32) {
        self.inner.fail_open[index(direction)].store(code, Ordering::Release);
    }

    pub fn allow_opens(&self, direction: StreamDirection) {
        self.inner.fail_open[index(direction)].store(0, Ordering::Release);
    }

    /// The next `count` callbacks of `direction` fail instead of moving audio.
    pub fn inject_transient_faults(&self, direction: StreamDirection, count: u32) {
        self.inner.transient[index(direction)].fetch_add(count, Ordering::AcqRel);
    }

    /// The running `direction` stream reports its device as lost and dies.
    pub fn kill(&self, direction: StreamDirection) {
        self.inner.kill[index(direction)].store(true, Ordering::Release);
    }

    /// Open attempts for `direction`, failed ones included.
    pub fn open_attempts(&self, direction: StreamDirection) -> u32 {
        self.inner.opens[index(direction)].load(Ordering::Acquire)
    }

    /// Streams opened and not yet dropped.
    pub fn live_streams(&self) -> u32 {
        self.inner.live.load(Ordering::Acquire)
    }

    fn register_open(&self, direction: StreamDirection) -> Result<(), StreamInitError> {
        let i = index(direction);
        self.inner.opens[i].fetch_add(1, Ordering::AcqRel);
        match self.inner.fail_open[i].load(Ordering::Acquire) {
            0 => Ok(()),
            failure => Err(StreamInitError::new(
                direction,
                failure,
                "injected open failure",
            )),
        }
    }

    fn take_kill(&self, direction: StreamDirection) -> bool {
        self.inner.kill[index(direction)].swap(false, Ordering::AcqRel)
    }

    fn take_transient(&self, direction: StreamDirection) -> bool {
        self.inner.transient[index(direction)]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

type SourceSlot = Arc<Mutex<Option<Box<dyn SignalSource>>>>;

/// Borrowed signal source; returns itself to the backend on drop so a
/// restarted capture stream continues the same signal.
struct SourceLease {
    source: Option<Box<dyn SignalSource>>,
    slot: SourceSlot,
}

impl SourceLease {
    fn take(slot: &SourceSlot) -> Self {
        Self {
            source: slot.lock().take(),
            slot: Arc::clone(slot),
        }
    }

    fn fill(&mut self, block: &mut [f32]) {
        match self.source.as_mut() {
            Some(source) => source.fill(block),
            None => block.fill(0.0),
        }
    }
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            *self.slot.lock() = Some(source);
        }
    }
}

/// Backend whose "devices" are paced worker threads.
pub struct SyntheticBackend {
    source: SourceSlot,
    tap: PlaybackTap,
    record_playback: bool,
    control: SyntheticControl,
    capture_block: Option<u32>,
    playback_block: Option<u32>,
    playback_delay: Duration,
}

impl SyntheticBackend {
    pub fn new(source: impl SignalSource) -> Self {
        let source: Box<dyn SignalSource> = Box::new(source);
        Self {
            source: Arc::new(Mutex::new(Some(source))),
            tap: PlaybackTap::default(),
            record_playback: true,
            control: SyntheticControl::default(),
            capture_block: None,
            playback_block: None,
            playback_delay: Duration::ZERO,
        }
    }

    /// Capture block size; defaults to the engine's block size hint.
    pub fn with_capture_block(mut self, frames: u32) -> Self {
        self.capture_block = Some(frames.max(1));
        self
    }

    /// Playback block size; defaults to the engine's block size hint.
    pub fn with_playback_block(mut self, frames: u32) -> Self {
        self.playback_block = Some(frames.max(1));
        self
    }

    /// Delay between playback start and its first callback.
    pub fn with_playback_delay(mut self, delay: Duration) -> Self {
        self.playback_delay = delay;
        self
    }

    /// Do not keep played samples (long-running hosts).
    pub fn discard_playback(mut self) -> Self {
        self.record_playback = false;
        self
    }

    pub fn tap(&self) -> PlaybackTap {
        self.tap.clone()
    }

    pub fn control(&self) -> SyntheticControl {
        self.control.clone()
    }

    fn negotiated(direction: StreamDirection, params: &StreamParams, block: u32) -> NegotiatedStream {
        NegotiatedStream {
            direction,
            device_name: format!("synthetic {direction}"),
            sample_rate: params.sample_rate,
            channels: params.channels,
            block_size: Some(block),
        }
    }
}

impl AudioBackend for SyntheticBackend {
    type Stream = SyntheticStream;

    fn name(&self) -> String {
        "synthetic".into()
    }

    fn open_capture(
        &mut self,
        params: &StreamParams,
        port: CapturePort,
    ) -> Result<SyntheticStream, StreamInitError> {
        let direction = StreamDirection::Capture;
        self.control.register_open(direction)?;

        let block = self.capture_block.unwrap_or(params.block_size_hint).max(1);
        let period = block_period(block, params.sample_rate);
        let source = SourceLease::take(&self.source);
        let control = self.control.clone();
        let work: Work = Box::new(move |running| {
            capture_loop(port, source, block as usize, period, control, running)
        });

        Ok(SyntheticStream::new(
            Self::negotiated(direction, params, block),
            work,
            self.control.clone(),
        ))
    }

    fn open_playback(
        &mut self,
        params: &StreamParams,
        port: PlaybackPort,
    ) -> Result<SyntheticStream, StreamInitError> {
        let direction = StreamDirection::Playback;
        self.control.register_open(direction)?;

        let block = self.playback_block.unwrap_or(params.block_size_hint).max(1);
        let period = block_period(block, params.sample_rate);
        let tap = self.record_playback.then(|| self.tap.clone());
        let delay = self.playback_delay;
        let control = self.control.clone();
        let work: Work = Box::new(move |running| {
            playback_loop(port, tap, block as usize, period, delay, control, running)
        });

        Ok(SyntheticStream::new(
            Self::negotiated(direction, params, block),
            work,
            self.control.clone(),
        ))
    }
}

type Work = Box<dyn FnOnce(Arc<AtomicBool>) + Send + 'static>;

/// A synthetic capture or playback stream.
pub struct SyntheticStream {
    negotiated: NegotiatedStream,
    work: Option<Work>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    control: SyntheticControl,
}

impl SyntheticStream {
    fn new(negotiated: NegotiatedStream, work: Work, control: SyntheticControl) -> Self {
        control.inner.live.fetch_add(1, Ordering::AcqRel);
        Self {
            negotiated,
            work: Some(work),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            control,
        }
    }
}

impl AudioStream for SyntheticStream {
    fn start(&mut self) -> Result<(), StreamInitError> {
        let Some(work) = self.work.take() else {
            return Ok(());
        };
        let direction = self.negotiated.direction;
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let worker = thread::Builder::new()
            .name(format!("synthetic-{direction}"))
            .spawn(move || work(running))
            .map_err(|e| StreamInitError::new(direction, code::STREAM_PLAY, e.to_string()))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.work = None;
    }

    fn negotiated(&self) -> &NegotiatedStream {
        &self.negotiated
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.stop();
        self.control.inner.live.fetch_sub(1, Ordering::AcqRel);
    }
}

fn block_period(block: u32, sample_rate: u32) -> Duration {
    Duration::from_secs_f64(block as f64 / sample_rate.max(1) as f64)
}

fn pace(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        thread::sleep(deadline - now);
    }
}

fn capture_loop(
    mut port: CapturePort,
    mut source: SourceLease,
    block_len: usize,
    period: Duration,
    control: SyntheticControl,
    running: Arc<AtomicBool>,
) {
    let direction = StreamDirection::Capture;
    let mut block = vec![0.0f32; block_len];
    let mut deadline = Instant::now();

    while running.load(Ordering::Acquire) {
        if control.take_kill(direction) {
            port.on_fatal_fault(FaultCause::DeviceLost);
            return;
        }
        if control.take_transient(direction) {
            if port.on_transient_fault() == FaultAction::Escalate {
                return;
            }
        } else {
            source.fill(&mut block);
            port.on_captured_frames(&block);
        }
        deadline += period;
        pace(deadline);
    }
}

fn playback_loop(
    mut port: PlaybackPort,
    tap: Option<PlaybackTap>,
    block_len: usize,
    period: Duration,
    delay: Duration,
    control: SyntheticControl,
    running: Arc<AtomicBool>,
) {
    let direction = StreamDirection::Playback;
    let mut block = vec![0.0f32; block_len];
    let mut deadline = Instant::now() + delay;
    pace(deadline);

    while running.load(Ordering::Acquire) {
        if control.take_kill(direction) {
            port.on_fatal_fault(FaultCause::DeviceLost);
            return;
        }
        if control.take_transient(direction) {
            if port.on_transient_fault() == FaultAction::Escalate {
                return;
            }
        } else {
            port.on_playback_request(&mut block);
            if let Some(tap) = &tap {
                tap.record(&block);
            }
        }
        deadline += period;
        pace(deadline);
    }
}
