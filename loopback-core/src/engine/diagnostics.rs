//! Lock-free duplex counters.
//!
//! Incremented from the real-time callbacks with `Relaxed` `fetch_add`, read
//! from the control thread as a snapshot. Overrun and underrun are expected
//! operating conditions under backpressure, so they live here rather than
//! in the error path.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct DuplexDiagnostics {
    pub frames_captured: AtomicU64,
    pub frames_played: AtomicU64,
    pub overrun_events: AtomicU64,
    pub overrun_frames: AtomicU64,
    pub underrun_events: AtomicU64,
    pub underrun_frames: AtomicU64,
    /// Stale frames dropped when a replacement playback stream resyncs.
    pub discarded_frames: AtomicU64,
    pub transient_faults: AtomicU64,
    pub fatal_faults: AtomicU64,
    pub restarts: AtomicU64,
}

impl DuplexDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_played.store(0, Ordering::Relaxed);
        self.overrun_events.store(0, Ordering::Relaxed);
        self.overrun_frames.store(0, Ordering::Relaxed);
        self.underrun_events.store(0, Ordering::Relaxed);
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.discarded_frames.store(0, Ordering::Relaxed);
        self.transient_faults.store(0, Ordering::Relaxed);
        self.fatal_faults.store(0, Ordering::Relaxed);
        self.restarts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_played: self.frames_played.load(Ordering::Relaxed),
            overrun_events: self.overrun_events.load(Ordering::Relaxed),
            overrun_frames: self.overrun_frames.load(Ordering::Relaxed),
            underrun_events: self.underrun_events.load(Ordering::Relaxed),
            underrun_frames: self.underrun_frames.load(Ordering::Relaxed),
            discarded_frames: self.discarded_frames.load(Ordering::Relaxed),
            transient_faults: self.transient_faults.load(Ordering::Relaxed),
            fatal_faults: self.fatal_faults.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: u64,
    pub frames_played: u64,
    pub overrun_events: u64,
    pub overrun_frames: u64,
    pub underrun_events: u64,
    pub underrun_frames: u64,
    pub discarded_frames: u64,
    pub transient_faults: u64,
    pub fatal_faults: u64,
    pub restarts: u64,
}

impl DiagnosticsSnapshot {
    /// Counter deltas accumulated since `earlier`.
    pub fn since(&self, earlier: &DiagnosticsSnapshot) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.saturating_sub(earlier.frames_captured),
            frames_played: self.frames_played.saturating_sub(earlier.frames_played),
            overrun_events: self.overrun_events.saturating_sub(earlier.overrun_events),
            overrun_frames: self.overrun_frames.saturating_sub(earlier.overrun_frames),
            underrun_events: self.underrun_events.saturating_sub(earlier.underrun_events),
            underrun_frames: self.underrun_frames.saturating_sub(earlier.underrun_frames),
            discarded_frames: self
                .discarded_frames
                .saturating_sub(earlier.discarded_frames),
            transient_faults: self
                .transient_faults
                .saturating_sub(earlier.transient_faults),
            fatal_faults: self.fatal_faults.saturating_sub(earlier.fatal_faults),
            restarts: self.restarts.saturating_sub(earlier.restarts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_delta_and_reset() {
        let diagnostics = DuplexDiagnostics::default();
        diagnostics.frames_captured.fetch_add(100, Ordering::Relaxed);
        let early = diagnostics.snapshot();
        diagnostics.frames_captured.fetch_add(28, Ordering::Relaxed);
        diagnostics.underrun_events.fetch_add(1, Ordering::Relaxed);

        let delta = diagnostics.snapshot().since(&early);
        assert_eq!(delta.frames_captured, 28);
        assert_eq!(delta.underrun_events, 1);
        assert_eq!(delta.overrun_events, 0);

        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = DiagnosticsSnapshot {
            underrun_frames: 5,
            ..Default::default()
        };
        let json = serde_json::to_value(snap).expect("serialize snapshot");
        assert_eq!(json["underrunFrames"], 5);
        assert_eq!(json["framesCaptured"], 0);
    }
}
