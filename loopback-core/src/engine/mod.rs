//! `DuplexEngine`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! DuplexEngine::new(backend, config)
//!     └─► start(&duplex)   → ring allocated, capture + playback opened and started
//!         ├─► supervise()  → fatal stream faults restarted in place (Running)
//!         │                    once each retry's backoff has elapsed
//!         └─► stop()       → both streams quiescent, ring released, back to Idle
//! ```
//!
//! `start()` is all-or-nothing: if either stream fails to open or start, the
//! one that succeeded is torn down before the error is returned. `stop()` is
//! idempotent.
//!
//! ## Threading
//!
//! The engine lives on one control thread. `cpal::Stream` is `!Send` on
//! Windows/macOS, so streams are opened, restarted and dropped wherever the
//! engine is; the callbacks themselves run on backend threads and reach the
//! engine only through the ring, the diagnostics counters and the bounded
//! fault channel.

pub mod diagnostics;

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    adapter::{
        AudioBackend, AudioStream, CapturePort, FaultHandle, NegotiatedStream, PlaybackPort,
        StreamDirection, StreamFaultReport, StreamParams,
    },
    buffering::{FrameRing, DEFAULT_CAPACITY_FRAMES},
    error::{code, LoopbackError, Result, StreamInitError},
    events::{EngineState, EngineStatusEvent},
};

use diagnostics::{DiagnosticsSnapshot, DuplexDiagnostics};

/// Broadcast channel capacity for status events buffered for slow consumers.
const BROADCAST_CAP: usize = 64;

/// Fatal fault reports queued between two `supervise()` calls.
const FAULT_QUEUE_CAP: usize = 16;

/// Stream parameters for one `start()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplexConfig {
    /// Sample rate for both streams (Hz). Default: 48000.
    pub sample_rate: u32,
    /// Must be 1; the loopback path is mono.
    pub channel_count: u16,
    /// Preferred callback size in frames. Backends may ignore it. Default: 128.
    pub block_size_hint: u32,
    /// Requested ring capacity, rounded up to a power of two.
    /// Default: 65536 (≈1.4 s at 48 kHz).
    pub buffer_capacity_frames: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channel_count: 1,
            block_size_hint: 128,
            buffer_capacity_frames: DEFAULT_CAPACITY_FRAMES,
        }
    }
}

impl DuplexConfig {
    /// Reject configurations no backend could honour.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(LoopbackError::InvalidConfig(
                "sample rate must be positive".into(),
            ));
        }
        if self.channel_count != 1 {
            return Err(LoopbackError::InvalidConfig(format!(
                "only mono is supported, got {} channels",
                self.channel_count
            )));
        }
        if self.block_size_hint == 0 {
            return Err(LoopbackError::InvalidConfig(
                "block size hint must be positive".into(),
            ));
        }
        if self.buffer_capacity_frames < self.block_size_hint as usize {
            return Err(LoopbackError::InvalidConfig(format!(
                "ring capacity {} is smaller than one block of {} frames",
                self.buffer_capacity_frames, self.block_size_hint
            )));
        }
        Ok(())
    }

    pub fn stream_params(&self) -> StreamParams {
        StreamParams {
            sample_rate: self.sample_rate,
            channels: self.channel_count,
            block_size_hint: self.block_size_hint,
        }
    }
}

/// Fault and scheduling policy for `DuplexEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Restart attempts per fatal stream fault before giving up. Default: 3.
    pub max_restart_attempts: u32,
    /// Delay before each restart attempt. `supervise()` never sleeps on it;
    /// the attempt runs on the first call after it has elapsed. Default: 50 ms.
    pub restart_backoff: Duration,
    /// Consecutive transient callback faults tolerated before a stream is
    /// treated as dead. Default: 8.
    pub max_consecutive_faults: u32,
    /// Ask each stream for real-time scheduling after it starts. Only
    /// backends that implement [`AudioStream::promote_realtime`] honour it;
    /// neither shipped backend does, so it is off by default.
    pub request_realtime_priority: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_restart_attempts: 3,
            restart_backoff: Duration::from_millis(50),
            max_consecutive_faults: 8,
            request_realtime_priority: false,
        }
    }
}

/// One stream and the fault generation it reports under.
struct Slot<S> {
    stream: Option<S>,
    generation: u64,
    /// Set while the stream is down and waiting to be reopened.
    retry: Option<Retry>,
}

impl<S> Slot<S> {
    fn running(stream: S, generation: u64) -> Self {
        Self {
            stream: Some(stream),
            generation,
            retry: None,
        }
    }
}

/// Restart bookkeeping for a faulted stream.
struct Retry {
    attempts: u32,
    due: Instant,
    last_error: String,
}

/// Everything that exists only between `start()` and `stop()`.
struct Session<S> {
    ring: FrameRing,
    params: StreamParams,
    capture: Slot<S>,
    playback: Slot<S>,
}

impl<S: AudioStream> Session<S> {
    fn slot_mut(&mut self, direction: StreamDirection) -> &mut Slot<S> {
        match direction {
            StreamDirection::Capture => &mut self.capture,
            StreamDirection::Playback => &mut self.playback,
        }
    }

    /// Stop capture first so nothing new enters the ring, then playback.
    /// Each `stop` returns only once its callback can no longer run.
    fn shut_down(&mut self) {
        if let Some(mut stream) = self.capture.stream.take() {
            stream.stop();
        }
        if let Some(mut stream) = self.playback.stream.take() {
            stream.stop();
        }
    }
}

/// The top-level engine handle.
///
/// Owned by its caller; several engines may coexist (tests run many at once).
pub struct DuplexEngine<B: AudioBackend> {
    backend: B,
    config: EngineConfig,
    state: EngineState,
    session: Option<Session<B::Stream>>,
    /// Shared with every port; survives restarts, reset on `start()`.
    diagnostics: Arc<DuplexDiagnostics>,
    fault_tx: Sender<StreamFaultReport>,
    fault_rx: Receiver<StreamFaultReport>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    /// Monotonically increasing event sequence counter.
    seq: u64,
    next_generation: u64,
}

impl<B: AudioBackend> DuplexEngine<B> {
    /// Create an idle engine. Nothing is opened until `start()`.
    pub fn new(backend: B, config: EngineConfig) -> Self {
        let (fault_tx, fault_rx) = crossbeam_channel::bounded(FAULT_QUEUE_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            backend,
            config,
            state: EngineState::Idle,
            session: None,
            diagnostics: Arc::new(DuplexDiagnostics::default()),
            fault_tx,
            fault_rx,
            status_tx,
            seq: 0,
            next_generation: 0,
        }
    }

    /// Allocate the ring, then open and start capture and playback.
    ///
    /// # Errors
    /// - `LoopbackError::AlreadyRunning` unless the engine is idle.
    /// - `LoopbackError::InvalidConfig` for a config no backend can honour.
    /// - `LoopbackError::StreamInit` when either stream fails; nothing is
    ///   left open and the engine is idle again.
    pub fn start(&mut self, config: &DuplexConfig) -> Result<()> {
        if self.state != EngineState::Idle {
            return Err(LoopbackError::AlreadyRunning);
        }
        config.validate()?;

        self.set_state(EngineState::Starting, None);
        self.diagnostics.reset();
        // Reports from a previous session are meaningless now.
        while self.fault_rx.try_recv().is_ok() {}

        match self.open_session(config) {
            Ok(session) => {
                for stream in [&session.capture, &session.playback]
                    .into_iter()
                    .filter_map(|slot| slot.stream.as_ref())
                {
                    let negotiated = stream.negotiated();
                    debug!(
                        direction = %negotiated.direction,
                        device = negotiated.device_name.as_str(),
                        sample_rate = negotiated.sample_rate,
                        block_size = ?negotiated.block_size,
                        "stream negotiated"
                    );
                }
                info!(
                    backend = self.backend.name().as_str(),
                    sample_rate = config.sample_rate,
                    capacity = session.ring.capacity(),
                    "duplex engine running"
                );
                self.session = Some(session);
                self.set_state(EngineState::Running, None);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "duplex engine failed to start");
                self.set_state(EngineState::Idle, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Stop both streams and release the ring. Does nothing when idle.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            self.teardown(session, None);
        }
    }

    /// Handle fatal stream faults reported since the last call.
    ///
    /// Call periodically from the control thread while running. A faulted
    /// stream is stopped at once and reopened in place after
    /// `restart_backoff`, up to `max_restart_attempts` times; the engine stays
    /// `Running` throughout. Never blocks: a retry that is not yet due is
    /// left for a later call.
    ///
    /// # Errors
    /// `LoopbackError::StreamFault` once a stream cannot be brought back.
    /// Both streams are stopped and the engine is idle.
    pub fn supervise(&mut self) -> Result<()> {
        while let Ok(report) = self.fault_rx.try_recv() {
            self.schedule_restart(report);
        }
        for direction in [StreamDirection::Capture, StreamDirection::Playback] {
            self.retry_stream(direction)?;
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running
    }

    /// Subscribe to live status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Snapshot of duplex counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Frames queued between capture and playback; `None` while idle.
    pub fn ring_fill(&self) -> Option<usize> {
        self.session
            .as_ref()
            .map(|session| session.ring.available_to_read())
    }

    /// Parameters the backend actually opened, capture first.
    pub fn negotiated(&self) -> Vec<NegotiatedStream> {
        self.session
            .iter()
            .flat_map(|session| [&session.capture, &session.playback])
            .filter_map(|slot| slot.stream.as_ref())
            .map(|stream| stream.negotiated().clone())
            .collect()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn open_session(&mut self, config: &DuplexConfig) -> Result<Session<B::Stream>> {
        let ring = FrameRing::with_capacity(config.buffer_capacity_frames)?;
        let params = config.stream_params();
        let realtime = self.config.request_realtime_priority;

        let capture_generation = self.bump_generation();
        let capture_faults = self.fault_handle(StreamDirection::Capture, capture_generation);
        let mut capture = open_stream(
            &mut self.backend,
            &ring,
            &params,
            capture_faults,
            &self.diagnostics,
            false,
        )?;

        let playback_generation = self.bump_generation();
        let playback_faults = self.fault_handle(StreamDirection::Playback, playback_generation);
        let mut playback = match open_stream(
            &mut self.backend,
            &ring,
            &params,
            playback_faults,
            &self.diagnostics,
            false,
        ) {
            Ok(stream) => stream,
            Err(e) => {
                capture.stop();
                return Err(e.into());
            }
        };

        if let Err(e) = launch(&mut capture, realtime) {
            playback.stop();
            return Err(e.into());
        }
        if let Err(e) = launch(&mut playback, realtime) {
            capture.stop();
            return Err(e.into());
        }

        Ok(Session {
            ring,
            params,
            capture: Slot::running(capture, capture_generation),
            playback: Slot::running(playback, playback_generation),
        })
    }

    /// Stop the faulted stream and queue its first restart attempt.
    fn schedule_restart(&mut self, report: StreamFaultReport) {
        let backoff = self.config.restart_backoff;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let slot = session.slot_mut(report.direction);
        if report.generation != slot.generation || slot.retry.is_some() {
            debug!(
                direction = %report.direction,
                generation = report.generation,
                "ignoring fault from replaced stream"
            );
            return;
        }
        error!(
            direction = %report.direction,
            cause = %report.cause,
            "stream fault"
        );
        // The old stream must release its ring half before a new one can
        // claim it.
        if let Some(mut old) = slot.stream.take() {
            old.stop();
        }
        slot.retry = Some(Retry {
            attempts: 0,
            due: Instant::now() + backoff,
            last_error: report.cause.to_string(),
        });
    }

    /// Run the pending restart for `direction` if it is due. Gives up and
    /// tears the session down once the attempts are spent.
    fn retry_stream(&mut self, direction: StreamDirection) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        match self.try_reopen(&mut session, direction) {
            Ok(()) => {
                self.session = Some(session);
                Ok(())
            }
            Err(fault) => {
                error!(error = %fault, "giving up on duplex stream");
                self.teardown(session, Some(fault.to_string()));
                Err(fault)
            }
        }
    }

    fn try_reopen(
        &mut self,
        session: &mut Session<B::Stream>,
        direction: StreamDirection,
    ) -> Result<()> {
        let max_attempts = self.config.max_restart_attempts;
        let Some(retry) = session.slot_mut(direction).retry.as_mut() else {
            return Ok(());
        };
        if retry.attempts >= max_attempts {
            return Err(LoopbackError::StreamFault {
                direction,
                attempts: retry.attempts,
                message: retry.last_error.clone(),
            });
        }
        if Instant::now() < retry.due {
            return Ok(());
        }
        retry.attempts += 1;
        let attempt = retry.attempts;
        self.diagnostics.restarts.fetch_add(1, Ordering::Relaxed);
        warn!(%direction, attempt, max_attempts, "restarting stream");

        let generation = self.bump_generation();
        let faults = self.fault_handle(direction, generation);
        let realtime = self.config.request_realtime_priority;
        let reopened = open_stream(
            &mut self.backend,
            &session.ring,
            &session.params,
            faults,
            &self.diagnostics,
            true,
        )
        .and_then(|mut stream| launch(&mut stream, realtime).map(|()| stream));

        match reopened {
            Ok(stream) => {
                *session.slot_mut(direction) = Slot::running(stream, generation);
                info!(%direction, attempt, "stream restarted");
                Ok(())
            }
            Err(e) => {
                warn!(%direction, attempt, error = %e, "stream restart failed");
                let backoff = self.config.restart_backoff;
                let Some(retry) = session.slot_mut(direction).retry.as_mut() else {
                    return Ok(());
                };
                retry.last_error = e.to_string();
                retry.due = Instant::now() + backoff;
                if retry.attempts >= max_attempts {
                    return Err(LoopbackError::StreamFault {
                        direction,
                        attempts: retry.attempts,
                        message: retry.last_error.clone(),
                    });
                }
                Ok(())
            }
        }
    }

    fn teardown(&mut self, mut session: Session<B::Stream>, detail: Option<String>) {
        self.set_state(EngineState::Stopping, None);
        session.shut_down();
        // Both callbacks are quiescent; the ring can go.
        drop(session);
        self.set_state(EngineState::Idle, detail);
        info!("duplex engine stopped");
    }

    fn fault_handle(&self, direction: StreamDirection, generation: u64) -> FaultHandle {
        FaultHandle::new(
            direction,
            generation,
            self.config.max_consecutive_faults,
            self.fault_tx.clone(),
            Arc::clone(&self.diagnostics),
        )
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn set_state(&mut self, state: EngineState, detail: Option<String>) {
        self.state = state;
        self.seq += 1;
        let _ = self.status_tx.send(EngineStatusEvent {
            seq: self.seq,
            state,
            detail,
        });
    }
}

impl<B: AudioBackend> Drop for DuplexEngine<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Claim the ring half for `faults.direction()` and open a stream on it.
///
/// With `resync`, a playback stream drops the frames queued while its
/// predecessor was down instead of playing them late.
fn open_stream<B: AudioBackend>(
    backend: &mut B,
    ring: &FrameRing,
    params: &StreamParams,
    faults: FaultHandle,
    diagnostics: &Arc<DuplexDiagnostics>,
    resync: bool,
) -> std::result::Result<B::Stream, StreamInitError> {
    let direction = faults.direction();
    let claimed = || {
        StreamInitError::new(
            direction,
            code::BACKEND,
            "ring half is still held by a previous stream",
        )
    };
    match direction {
        StreamDirection::Capture => {
            let producer = ring.producer().ok_or_else(claimed)?;
            let port = CapturePort::new(producer, faults, Arc::clone(diagnostics));
            backend.open_capture(params, port)
        }
        StreamDirection::Playback => {
            let consumer = ring.consumer().ok_or_else(claimed)?;
            let mut port = PlaybackPort::new(consumer, faults, Arc::clone(diagnostics));
            if resync {
                port = port.resync_backlog();
            }
            backend.open_playback(params, port)
        }
    }
}

/// Start an opened stream; on failure it is stopped before returning.
fn launch<S: AudioStream>(
    stream: &mut S,
    realtime: bool,
) -> std::result::Result<(), StreamInitError> {
    if let Err(e) = stream.start() {
        stream.stop();
        return Err(e);
    }
    if realtime {
        let promoted = stream.promote_realtime();
        debug!(
            direction = %stream.negotiated().direction,
            promoted,
            "real-time priority requested"
        );
    }
    Ok(())
}
