//! Events broadcast by a running session.
//!
//! | Event | Sent when |
//! |-------|-----------|
//! | `SessionStatusEvent` | every lifecycle transition, including failure |
//! | `FrameTimingEvent` | after every executed frame |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of an emulation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    /// No driver thread. Initial state, and the state after `stop` or a failure.
    Stopped = 0,
    /// Driver thread executing one frame per period.
    Running = 1,
    /// Driver thread alive but not stepping the core.
    Paused = 2,
}

impl SessionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Running,
            2 => SessionState::Paused,
            _ => SessionState::Stopped,
        }
    }
}

/// Emitted on every state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    /// Optional human-readable detail (e.g. the emulation error).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Frame timing
// ---------------------------------------------------------------------------

/// Per-frame pacing report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTimingEvent {
    /// Frames executed since `start`, starting at 1.
    pub frame: u64,
    /// How far past its deadline the frame's wait ended, in microseconds.
    pub lateness_us: u64,
    /// The step overran its deadline and the wait was skipped.
    pub overrun: bool,
    pub rendered: bool,
    /// Audio bytes produced by the core this frame.
    pub audio_produced: usize,
    /// Audio bytes accepted by the ring this frame.
    pub audio_written: usize,
}
