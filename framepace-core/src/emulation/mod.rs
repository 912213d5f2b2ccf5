//! Emulation-step capability.
//!
//! The frame driver treats the emulated machine as an opaque producer: once
//! per frame it calls [`EmulationStep::run_frame`], gets back that frame's
//! audio bytes, and (on rendering frames) lets the core draw into the video
//! sink. `&mut self` reflects that cores are stateful; all access goes through
//! the `parking_lot::Mutex` in [`CoreHandle`].

pub mod stub;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::buffering::format::AudioFormat;
use crate::error::Result;
use crate::video::VideoFormat;

pub use stub::{SilentCore, TestPatternCore};

/// Contract for emulation-step providers.
pub trait EmulationStep: Send + 'static {
    /// Native frame period of the emulated machine (e.g. 1 / 59.97 s).
    fn frame_duration(&self) -> Duration;

    /// Layout of the bytes returned by `run_frame`.
    fn audio_format(&self) -> AudioFormat;

    /// Layout of the frame written into the video sink.
    fn video_format(&self) -> VideoFormat;

    /// Called by the session on `start`, before the driver thread spawns.
    ///
    /// # Errors
    /// A failure aborts the start and leaves the session stopped.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called by the session after the driver thread has been joined.
    fn stop(&mut self) {}

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Advance the machine by one frame.
    ///
    /// `video` is `Some` on frames that should be rendered; the core writes a
    /// full frame into it in place. Returns the audio produced for the frame.
    ///
    /// # Errors
    /// Any error is fatal to the session (e.g. corrupted machine state).
    fn run_frame(&mut self, video: Option<&mut [u8]>) -> Result<&[u8]>;
}

/// Shared handle to any `EmulationStep` implementor.
#[derive(Clone)]
pub struct CoreHandle(pub Arc<Mutex<dyn EmulationStep>>);

impl CoreHandle {
    pub fn new<S: EmulationStep>(step: S) -> Self {
        Self(Arc::new(Mutex::new(step)))
    }
}

impl std::fmt::Debug for CoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreHandle").finish_non_exhaustive()
    }
}

/// Selector for the providers that ship with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoreKind {
    Silent,
    #[default]
    TestPattern,
}

/// Fixed set of built-in providers, chosen at construction.
pub enum BuiltinCore {
    Silent(SilentCore),
    TestPattern(TestPatternCore),
}

impl BuiltinCore {
    pub fn new(kind: CoreKind) -> Self {
        match kind {
            CoreKind::Silent => BuiltinCore::Silent(SilentCore::default()),
            CoreKind::TestPattern => BuiltinCore::TestPattern(TestPatternCore::default()),
        }
    }

    pub fn kind(&self) -> CoreKind {
        match self {
            BuiltinCore::Silent(_) => CoreKind::Silent,
            BuiltinCore::TestPattern(_) => CoreKind::TestPattern,
        }
    }

    fn inner(&self) -> &dyn EmulationStep {
        match self {
            BuiltinCore::Silent(core) => core,
            BuiltinCore::TestPattern(core) => core,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn EmulationStep {
        match self {
            BuiltinCore::Silent(core) => core,
            BuiltinCore::TestPattern(core) => core,
        }
    }
}

impl EmulationStep for BuiltinCore {
    fn frame_duration(&self) -> Duration {
        self.inner().frame_duration()
    }

    fn audio_format(&self) -> AudioFormat {
        self.inner().audio_format()
    }

    fn video_format(&self) -> VideoFormat {
        self.inner().video_format()
    }

    fn start(&mut self) -> Result<()> {
        self.inner_mut().start()
    }

    fn stop(&mut self) {
        self.inner_mut().stop()
    }

    fn pause(&mut self) {
        self.inner_mut().pause()
    }

    fn resume(&mut self) {
        self.inner_mut().resume()
    }

    fn run_frame(&mut self, video: Option<&mut [u8]>) -> Result<&[u8]> {
        self.inner_mut().run_frame(video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_core_dispatches_to_selected_variant() {
        let silent = BuiltinCore::new(CoreKind::Silent);
        assert_eq!(silent.kind(), CoreKind::Silent);

        let mut pattern = BuiltinCore::new(CoreKind::TestPattern);
        assert_eq!(pattern.kind(), CoreKind::TestPattern);
        let audio = pattern.run_frame(None).expect("frame").to_vec();
        assert!(!audio.is_empty());
        assert_eq!(audio.len() % pattern.audio_format().frame_size(), 0);
    }

    #[test]
    fn core_kind_serializes_camel_case() {
        let json = serde_json::to_value(CoreKind::TestPattern).expect("serialize");
        assert_eq!(json, "testPattern");
        let kind: CoreKind = serde_json::from_value(serde_json::json!("silent")).expect("parse");
        assert_eq!(kind, CoreKind::Silent);
    }
}
