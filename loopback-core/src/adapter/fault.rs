//! Runtime fault reporting from stream callbacks to the engine.
//!
//! Reports travel over a bounded `crossbeam_channel`; `try_send` never
//! blocks and never allocates, so a handle can be used from the data
//! callback or from a backend's error callback.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use crossbeam_channel::Sender;

use super::StreamDirection;
use crate::engine::diagnostics::DuplexDiagnostics;

/// Why a stream gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultCause {
    /// The device disappeared or the stream died.
    DeviceLost,
    /// Too many consecutive transient faults with no good callback between.
    Escalated { consecutive: u32 },
}

impl std::fmt::Display for FaultCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultCause::DeviceLost => f.write_str("device lost"),
            FaultCause::Escalated { consecutive } => {
                write!(f, "{consecutive} consecutive transient faults")
            }
        }
    }
}

/// A fatal fault, as seen by the engine's supervisor.
#[derive(Debug, Clone)]
pub struct StreamFaultReport {
    pub direction: StreamDirection,
    /// Stream generation that raised the fault; stale reports from a
    /// stream that has since been replaced are ignored.
    pub generation: u64,
    pub cause: FaultCause,
}

/// What the backend should do after reporting a transient fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Reset the stream in place and keep going.
    Recover,
    /// The engine has been told; stop issuing callbacks.
    Escalate,
}

struct FaultState {
    streak: AtomicU32,
    reported: AtomicBool,
}

/// Cloneable fault reporter bound to one stream generation.
#[derive(Clone)]
pub struct FaultHandle {
    direction: StreamDirection,
    generation: u64,
    max_consecutive: u32,
    state: Arc<FaultState>,
    tx: Sender<StreamFaultReport>,
    diagnostics: Arc<DuplexDiagnostics>,
}

impl FaultHandle {
    pub(crate) fn new(
        direction: StreamDirection,
        generation: u64,
        max_consecutive: u32,
        tx: Sender<StreamFaultReport>,
        diagnostics: Arc<DuplexDiagnostics>,
    ) -> Self {
        Self {
            direction,
            generation,
            max_consecutive: max_consecutive.max(1),
            state: Arc::new(FaultState {
                streak: AtomicU32::new(0),
                reported: AtomicBool::new(false),
            }),
            tx,
            diagnostics,
        }
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// Count one transient fault. Escalates to a fatal report once the
    /// streak reaches the configured limit.
    pub fn transient(&self) -> FaultAction {
        self.diagnostics
            .transient_faults
            .fetch_add(1, Ordering::Relaxed);
        let streak = self.state.streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= self.max_consecutive {
            self.fatal(FaultCause::Escalated {
                consecutive: streak,
            });
            FaultAction::Escalate
        } else {
            FaultAction::Recover
        }
    }

    /// Report a fatal fault. Only the first report per handle is sent.
    pub fn fatal(&self, cause: FaultCause) {
        if self.state.reported.swap(true, Ordering::AcqRel) {
            return;
        }
        self.diagnostics.fatal_faults.fetch_add(1, Ordering::Relaxed);
        // A full queue means the supervisor already has work queued for
        // this engine; dropping the duplicate is fine.
        let _ = self.tx.try_send(StreamFaultReport {
            direction: self.direction,
            generation: self.generation,
            cause,
        });
    }

    /// A callback completed normally; the transient streak starts over.
    #[inline]
    pub fn clear_streak(&self) {
        if self.state.streak.load(Ordering::Relaxed) != 0 {
            self.state.streak.store(0, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for FaultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHandle")
            .field("direction", &self.direction)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(max: u32) -> (
        FaultHandle,
        crossbeam_channel::Receiver<StreamFaultReport>,
        Arc<DuplexDiagnostics>,
    ) {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let diagnostics = Arc::new(DuplexDiagnostics::default());
        let h = FaultHandle::new(
            StreamDirection::Capture,
            3,
            max,
            tx,
            Arc::clone(&diagnostics),
        );
        (h, rx, diagnostics)
    }

    #[test]
    fn transient_faults_recover_until_streak_limit() {
        let (h, rx, diagnostics) = handle(3);
        assert_eq!(h.transient(), FaultAction::Recover);
        assert_eq!(h.transient(), FaultAction::Recover);
        assert!(rx.try_recv().is_err());

        assert_eq!(h.transient(), FaultAction::Escalate);
        let report = rx.try_recv().expect("escalation report");
        assert_eq!(report.direction, StreamDirection::Capture);
        assert_eq!(report.generation, 3);
        assert_eq!(report.cause, FaultCause::Escalated { consecutive: 3 });

        let snap = diagnostics.snapshot();
        assert_eq!(snap.transient_faults, 3);
        assert_eq!(snap.fatal_faults, 1);
    }

    #[test]
    fn good_callback_resets_streak() {
        let (h, rx, _) = handle(2);
        assert_eq!(h.transient(), FaultAction::Recover);
        h.clear_streak();
        assert_eq!(h.transient(), FaultAction::Recover);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fatal_is_reported_once_per_handle() {
        let (h, rx, diagnostics) = handle(8);
        let clone = h.clone();
        h.fatal(FaultCause::DeviceLost);
        clone.fatal(FaultCause::Escalated { consecutive: 8 });

        assert_eq!(rx.try_recv().unwrap().cause, FaultCause::DeviceLost);
        assert!(rx.try_recv().is_err());
        assert_eq!(diagnostics.snapshot().fatal_faults, 1);
    }
}
