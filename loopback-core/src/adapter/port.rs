//! The two ends of the duplex pipe as seen from a stream callback.

use std::sync::{atomic::Ordering, Arc};

use super::{FaultAction, FaultCause, FaultHandle};
use crate::{
    buffering::{FrameConsumer, FrameProducer},
    engine::diagnostics::DuplexDiagnostics,
};

/// Capture side: owns the ring's producer half.
pub struct CapturePort {
    producer: FrameProducer,
    faults: FaultHandle,
    diagnostics: Arc<DuplexDiagnostics>,
}

impl CapturePort {
    pub(crate) fn new(
        producer: FrameProducer,
        faults: FaultHandle,
        diagnostics: Arc<DuplexDiagnostics>,
    ) -> Self {
        Self {
            producer,
            faults,
            diagnostics,
        }
    }

    /// Hand freshly captured mono frames to the ring.
    ///
    /// Returns the number of frames accepted; the rest were dropped as an
    /// overrun and counted.
    #[inline]
    pub fn on_captured_frames(&mut self, samples: &[f32]) -> usize {
        let accepted = self.producer.push(samples);
        self.diagnostics
            .frames_captured
            .fetch_add(accepted as u64, Ordering::Relaxed);
        if accepted < samples.len() {
            self.diagnostics
                .overrun_events
                .fetch_add(1, Ordering::Relaxed);
            self.diagnostics
                .overrun_frames
                .fetch_add((samples.len() - accepted) as u64, Ordering::Relaxed);
        }
        self.faults.clear_streak();
        accepted
    }

    /// The platform read for this callback failed. See [`FaultHandle::transient`].
    pub fn on_transient_fault(&mut self) -> FaultAction {
        self.faults.transient()
    }

    /// The capture device is gone; the engine will restart this stream.
    pub fn on_fatal_fault(&self, cause: FaultCause) {
        self.faults.fatal(cause);
    }

    /// Reporter for backends whose error callback runs apart from the data callback.
    pub fn fault_handle(&self) -> FaultHandle {
        self.faults.clone()
    }
}

/// Playback side: owns the ring's consumer half.
pub struct PlaybackPort {
    consumer: FrameConsumer,
    faults: FaultHandle,
    diagnostics: Arc<DuplexDiagnostics>,
    resync: bool,
}

impl PlaybackPort {
    pub(crate) fn new(
        consumer: FrameConsumer,
        faults: FaultHandle,
        diagnostics: Arc<DuplexDiagnostics>,
    ) -> Self {
        Self {
            consumer,
            faults,
            diagnostics,
            resync: false,
        }
    }

    /// Drop the frames queued while the previous playback stream was down,
    /// keeping only one request's worth, on the first playback request.
    pub(crate) fn resync_backlog(mut self) -> Self {
        self.resync = true;
        self
    }

    /// Fill `destination` with the next queued frames.
    ///
    /// Any shortfall is silence and is counted as an underrun. Returns the
    /// number of real frames delivered.
    #[inline]
    pub fn on_playback_request(&mut self, destination: &mut [f32]) -> usize {
        if self.resync {
            self.resync = false;
            let dropped = self.consumer.discard_backlog(destination.len());
            self.diagnostics
                .discarded_frames
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        let delivered = self.consumer.pop(destination);
        self.diagnostics
            .frames_played
            .fetch_add(delivered as u64, Ordering::Relaxed);
        if delivered < destination.len() {
            self.diagnostics
                .underrun_events
                .fetch_add(1, Ordering::Relaxed);
            self.diagnostics
                .underrun_frames
                .fetch_add((destination.len() - delivered) as u64, Ordering::Relaxed);
        }
        self.faults.clear_streak();
        delivered
    }

    /// The platform write for this callback failed. See [`FaultHandle::transient`].
    pub fn on_transient_fault(&mut self) -> FaultAction {
        self.faults.transient()
    }

    pub fn on_fatal_fault(&self, cause: FaultCause) {
        self.faults.fatal(cause);
    }

    pub fn fault_handle(&self) -> FaultHandle {
        self.faults.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapter::StreamDirection, buffering::FrameRing};

    fn ports(
        capacity: usize,
        max_faults: u32,
    ) -> (
        FrameRing,
        CapturePort,
        PlaybackPort,
        Arc<DuplexDiagnostics>,
        crossbeam_channel::Receiver<crate::adapter::StreamFaultReport>,
    ) {
        let ring = FrameRing::with_capacity(capacity).unwrap();
        let diagnostics = Arc::new(DuplexDiagnostics::default());
        let (tx, rx) = crossbeam_channel::bounded(4);
        let capture = CapturePort::new(
            ring.producer().unwrap(),
            FaultHandle::new(
                StreamDirection::Capture,
                0,
                max_faults,
                tx.clone(),
                Arc::clone(&diagnostics),
            ),
            Arc::clone(&diagnostics),
        );
        let playback = PlaybackPort::new(
            ring.consumer().unwrap(),
            FaultHandle::new(
                StreamDirection::Playback,
                0,
                max_faults,
                tx,
                Arc::clone(&diagnostics),
            ),
            Arc::clone(&diagnostics),
        );
        (ring, capture, playback, diagnostics, rx)
    }

    #[test]
    fn capture_counts_overrun_frames() {
        let (_ring, mut capture, _playback, diagnostics, _rx) = ports(8, 4);
        assert_eq!(capture.on_captured_frames(&[0.1; 6]), 6);
        assert_eq!(capture.on_captured_frames(&[0.2; 6]), 2);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_captured, 8);
        assert_eq!(snap.overrun_events, 1);
        assert_eq!(snap.overrun_frames, 4);
    }

    #[test]
    fn playback_counts_underrun_and_zero_fills() {
        let (_ring, mut capture, mut playback, diagnostics, _rx) = ports(16, 4);
        capture.on_captured_frames(&[0.5; 3]);

        let mut out = [1.0f32; 8];
        assert_eq!(playback.on_playback_request(&mut out), 3);
        assert_eq!(out, [0.5, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0]);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_played, 3);
        assert_eq!(snap.underrun_events, 1);
        assert_eq!(snap.underrun_frames, 5);
    }

    #[test]
    fn successful_callbacks_absorb_transient_faults() {
        let (_ring, mut capture, mut playback, diagnostics, rx) = ports(16, 2);
        let mut out = [0.0f32; 4];
        for _ in 0..5 {
            assert_eq!(capture.on_transient_fault(), FaultAction::Recover);
            capture.on_captured_frames(&[0.0; 4]);
            assert_eq!(playback.on_transient_fault(), FaultAction::Recover);
            playback.on_playback_request(&mut out);
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(diagnostics.snapshot().transient_faults, 10);
    }

    #[test]
    fn fault_streak_escalates_to_engine() {
        let (_ring, _capture, mut playback, _diagnostics, rx) = ports(16, 2);
        assert_eq!(playback.on_transient_fault(), FaultAction::Recover);
        assert_eq!(playback.on_transient_fault(), FaultAction::Escalate);
        let report = rx.try_recv().unwrap();
        assert_eq!(report.direction, StreamDirection::Playback);
    }

    #[test]
    fn fatal_fault_is_reported_once() {
        let (_ring, capture, _playback, diagnostics, rx) = ports(16, 4);
        capture.on_fatal_fault(FaultCause::DeviceLost);
        capture.on_fatal_fault(FaultCause::DeviceLost);

        let report = rx.try_recv().unwrap();
        assert_eq!(report.direction, StreamDirection::Capture);
        assert_eq!(report.cause, FaultCause::DeviceLost);
        assert!(rx.try_recv().is_err());
        assert_eq!(diagnostics.snapshot().fatal_faults, 1);
    }

    #[test]
    fn resynced_playback_skips_stale_backlog() {
        let (ring, mut capture, playback, diagnostics, _rx) = ports(64, 4);
        let stale: Vec<f32> = (0..40).map(|i| i as f32).collect();
        capture.on_captured_frames(&stale);

        // A replacement consumer after the first one is released.
        drop(playback);
        let mut replacement = PlaybackPort::new(
            ring.consumer().unwrap(),
            capture.fault_handle(),
            Arc::clone(&diagnostics),
        )
        .resync_backlog();

        let mut out = [0.0f32; 8];
        assert_eq!(replacement.on_playback_request(&mut out), 8);
        assert_eq!(out, [32.0, 33.0, 34.0, 35.0, 36.0, 37.0, 38.0, 39.0]);
        assert_eq!(diagnostics.snapshot().discarded_frames, 32);

        capture.on_captured_frames(&[0.5; 4]);
        assert_eq!(replacement.on_playback_request(&mut out[..4]), 4);
        assert_eq!(diagnostics.snapshot().discarded_frames, 32);
    }
}
