//! # framepace-core
//!
//! Frame pacing and lock-free audio hand-off for emulation cores.
//!
//! ## Architecture
//!
//! ```text
//! EmulationSession::start()
//!     └─► FrameDriver thread (real-time priority, best effort)
//!             │
//!             ├─ EmulationStep::run_frame ──► VideoSink (weak, in place)
//!             │
//!             ├─ RingProducer::write ──► SPSC RingBuffer ──► RingConsumer ──► AudioPlayback
//!             │                                                            (cpal callback)
//!             └─ RealTimeScheduler::wait_until(origin + period * n)
//!
//! broadcast::Sender<SessionStatusEvent> / broadcast::Sender<FrameTimingEvent>
//! ```
//!
//! The driver thread never blocks on the consumer and the consumer never
//! blocks on the driver. All heap work happens before the loop starts.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod emulation;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod realtime;
pub mod video;

// Convenience re-exports for downstream crates
pub use audio::{AudioPlayback, PlaybackStats, SampleDrain};
pub use buffering::{format::AudioFormat, RingBuffer, RingConsumer, RingProducer, WriteRegion};
pub use emulation::{BuiltinCore, CoreHandle, CoreKind, EmulationStep};
pub use engine::driver::{DiagnosticsSnapshot, DriverPhase, FrameSchedule, OverflowPolicy};
pub use engine::{EmulationSession, SessionConfig};
pub use error::{FrameError, Result};
pub use ipc::events::{FrameTimingEvent, SessionState, SessionStatusEvent};
pub use realtime::{AbsoluteTime, PriorityResult, RealTimeScheduler};
pub use video::{PixelFormat, VideoFormat, VideoSink};
