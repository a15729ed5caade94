//! Status events broadcast by [`DuplexEngine`](crate::engine::DuplexEngine).
//!
//! Subscribers receive one [`EngineStatusEvent`] per state transition, via
//! `DuplexEngine::subscribe_status`. The types serialise to camelCase JSON
//! so a host can forward them as-is.

use serde::{Deserialize, Serialize};

/// Engine lifecycle state.
///
/// ```text
/// Idle ─► Starting ─► Running ─► Stopping ─► Idle
///             │                     ▲
///             └── init error ─► Idle│
///                    Running ── restarts exhausted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// No streams, no ring buffer.
    Idle,
    /// Ring allocated, streams being opened.
    Starting,
    /// Both streams delivering callbacks.
    Running,
    /// Streams being torn down.
    Stopping,
}

/// Emitted on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub state: EngineState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}
