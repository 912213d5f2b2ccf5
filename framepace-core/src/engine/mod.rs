//! `EmulationSession`: the lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! EmulationSession::new()            → ring sized, state = Stopped
//!     └─► start()                    → ring reset, driver thread spawned, state = Running
//!         ├─► pause()  / resume()    → Running ⇄ Paused (thread stays alive)
//!         └─► stop()                 → thread joined, ring reset, state = Stopped
//! ```
//!
//! Every command is idempotent: calling it in a state where it does not apply
//! returns `false` (or `Ok(false)`) rather than an error.
//!
//! ## Threading
//!
//! The frame driver owns the `RingProducer` while it runs and hands it back
//! through its join handle, so the write side of the ring has exactly one
//! owner at all times. The driver is passed to the new thread over a bounded
//! channel so a failed spawn can still reclaim the producer.

pub mod driver;

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    buffering::{format::preferred_ring_capacity, RingBuffer, RingConsumer, RingProducer},
    emulation::CoreHandle,
    error::{FrameError, Result},
    ipc::events::{FrameTimingEvent, SessionState, SessionStatusEvent},
    realtime::{PriorityResult, RealTimeScheduler},
    video::VideoSink,
};

use driver::{
    DiagnosticsSnapshot, DriverContext, DriverControl, DriverDiagnostics, DriverExit,
    DriverPhase, FrameDriver, OverflowPolicy,
};

/// Broadcast channel capacity for status events.
const STATUS_BROADCAST_CAP: usize = 64;

/// Broadcast channel capacity for per-frame timing events (~4 s at 60 Hz).
const TIMING_BROADCAST_CAP: usize = 256;

const DRIVER_THREAD_NAME: &str = "framepace-driver";

/// Configuration for `EmulationSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Explicit ring capacity in bytes. `None` sizes the ring from the core's
    /// audio format and frame duration.
    pub ring_capacity: Option<usize>,
    /// Frames of audio headroom when sizing from format. Default: 3.
    pub ring_buffer_count: usize,
    /// What to do with audio the ring cannot accept. Default: truncate.
    pub overflow_policy: OverflowPolicy,
    /// Request a real-time scheduling class for the driver thread. Default: true.
    pub realtime_priority: bool,
    /// How close to a deadline the driver stops sleeping and starts spinning.
    pub spin_threshold: Duration,
    /// Minimum wall time between rendered video frames. Default: 1/60 s.
    pub screen_refresh_interval: Duration,
    /// Emulation speed multiplier. Default: 1.0.
    pub rate: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ring_capacity: None,
            ring_buffer_count: 3,
            overflow_policy: OverflowPolicy::TruncateNewest,
            realtime_priority: true,
            spin_threshold: RealTimeScheduler::default().spin_threshold(),
            screen_refresh_interval: Duration::from_nanos(16_666_667),
            rate: 1.0,
        }
    }
}

struct SessionInner {
    /// Present whenever no driver thread is running.
    producer: Option<RingProducer>,
    driver: Option<JoinHandle<Option<DriverExit>>>,
    consumer: Option<RingConsumer>,
}

/// One emulation session: ring, driver thread and lifecycle state.
///
/// `EmulationSession` is `Send + Sync`; wrap it in an `Arc` to drive it from
/// several threads or tasks.
pub struct EmulationSession {
    config: SessionConfig,
    core: CoreHandle,
    video: Weak<VideoSink>,
    ring: Arc<RingBuffer>,
    control: Arc<DriverControl>,
    diagnostics: Arc<DriverDiagnostics>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    timing_tx: broadcast::Sender<FrameTimingEvent>,
    last_error: Arc<Mutex<Option<String>>>,
    last_priority: Mutex<Option<PriorityResult>>,
    inner: Mutex<SessionInner>,
}

impl EmulationSession {
    /// Build a stopped session around `core`.
    ///
    /// The video sink is held weakly; the caller owns it.
    ///
    /// # Errors
    /// - `FrameError::InvalidFormat` if the core reports a zero frame duration,
    ///   an unusable audio format, or a video format that differs from the sink's.
    /// - `FrameError::InvalidCapacity` if the ring cannot be sized.
    pub fn new(config: SessionConfig, core: CoreHandle, video: Weak<VideoSink>) -> Result<Self> {
        let (frame_duration, audio_format, video_format) = {
            let core = core.0.lock();
            (core.frame_duration(), core.audio_format(), core.video_format())
        };

        if frame_duration.is_zero() {
            return Err(FrameError::InvalidFormat(
                "frame duration must be non-zero".into(),
            ));
        }
        audio_format.validate()?;
        if let Some(sink) = video.upgrade() {
            if sink.format() != video_format {
                return Err(FrameError::InvalidFormat(format!(
                    "video sink is {:?} but core renders {:?}",
                    sink.format(),
                    video_format
                )));
            }
        }

        let preferred = match config.ring_capacity {
            Some(capacity) => capacity,
            None => preferred_ring_capacity(&audio_format, frame_duration, config.ring_buffer_count)?,
        };
        let (producer, consumer) = RingBuffer::split(preferred)?;
        let ring = Arc::clone(producer.ring());

        let rate = if config.rate.is_finite() && config.rate > 0.0 {
            config.rate
        } else {
            warn!(rate = config.rate, "invalid emulation rate; using 1.0");
            1.0
        };

        let (status_tx, _) = broadcast::channel(STATUS_BROADCAST_CAP);
        let (timing_tx, _) = broadcast::channel(TIMING_BROADCAST_CAP);

        info!(
            capacity = ring.capacity(),
            frame_us = frame_duration.as_micros() as u64,
            sample_rate = audio_format.sample_rate,
            channels = audio_format.channels,
            "emulation session created"
        );

        Ok(Self {
            config,
            core,
            video,
            ring,
            control: Arc::new(DriverControl::new(rate)),
            diagnostics: Arc::new(DriverDiagnostics::default()),
            status_tx,
            timing_tx,
            last_error: Arc::new(Mutex::new(None)),
            last_priority: Mutex::new(None),
            inner: Mutex::new(SessionInner {
                producer: Some(producer),
                driver: None,
                consumer: Some(consumer),
            }),
        })
    }

    /// Stopped → Running. Returns `Ok(false)` if the session was not stopped.
    ///
    /// Blocks until the driver thread is up and has made its real-time
    /// priority request.
    ///
    /// # Errors
    /// - Any error from `EmulationStep::start`.
    /// - `FrameError::DriverSpawn` if the OS refuses the thread.
    /// - `FrameError::DriverPanicked` if a previous or new driver thread panicked.
    pub fn start(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if self.control.state() != SessionState::Stopped {
            return Ok(false);
        }

        self.reap(&mut inner)?;
        let mut producer = inner.producer.take().ok_or_else(|| {
            FrameError::Other(anyhow::anyhow!("ring producer lost by an earlier driver"))
        })?;
        producer.reset();
        self.ring.set_enabled(true);
        self.diagnostics.reset();
        *self.last_error.lock() = None;

        if let Err(e) = self.core.0.lock().start() {
            self.ring.set_enabled(false);
            inner.producer = Some(producer);
            return Err(e);
        }

        self.control.swap_state(SessionState::Running);

        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let frame_driver = FrameDriver::new(DriverContext {
            core: self.core.clone(),
            producer,
            video: self.video.clone(),
            scheduler: RealTimeScheduler::new(self.config.spin_threshold),
            control: Arc::clone(&self.control),
            diagnostics: Arc::clone(&self.diagnostics),
            timing_tx: self.timing_tx.clone(),
            overflow_policy: self.config.overflow_policy,
            realtime_priority: self.config.realtime_priority,
            screen_refresh_interval: self.config.screen_refresh_interval,
            started_tx: Some(started_tx),
            on_failure: Some(self.failure_handler()),
        });

        let (driver_tx, driver_rx) = crossbeam_channel::bounded::<FrameDriver>(1);
        let spawned = thread::Builder::new()
            .name(DRIVER_THREAD_NAME.into())
            .spawn(move || driver_rx.recv().ok().map(FrameDriver::run));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.abort_start(&mut inner, frame_driver.into_producer());
                return Err(FrameError::DriverSpawn(e));
            }
        };
        if let Err(returned) = driver_tx.send(frame_driver) {
            let _ = handle.join();
            self.abort_start(&mut inner, returned.into_inner().into_producer());
            return Err(FrameError::DriverPanicked);
        }

        match started_rx.recv() {
            Ok(priority) => {
                *self.last_priority.lock() = Some(priority);
                inner.driver = Some(handle);
                info!(?priority, "emulation session started");
                self.broadcast(SessionState::Running, None);
                Ok(true)
            }
            Err(_) => {
                error!("frame driver exited before reporting start");
                self.control.swap_state(SessionState::Stopped);
                inner.driver = Some(handle);
                let reaped = self.reap(&mut inner);
                self.ring.set_enabled(false);
                self.core.0.lock().stop();
                self.broadcast(SessionState::Stopped, Some("driver failed to start".into()));
                reaped.and(Err(FrameError::DriverPanicked))
            }
        }
    }

    /// Running | Paused → Stopped. Returns `Ok(false)` if already stopped.
    ///
    /// Joins the driver thread (at most one frame period plus one step) and
    /// resets the ring.
    ///
    /// # Errors
    /// `FrameError::DriverPanicked` if the driver thread panicked.
    pub fn stop(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        let previous = self.control.swap_state(SessionState::Stopped);
        let reaped = self.reap(&mut inner);
        self.ring.set_enabled(false);
        if let Some(producer) = inner.producer.as_mut() {
            producer.reset();
        }

        if previous == SessionState::Stopped {
            return reaped.map(|_| false);
        }

        self.core.0.lock().stop();
        info!("emulation session stopped");
        self.broadcast(SessionState::Stopped, None);
        reaped.map(|_| true)
    }

    /// Running → Paused. Audio is silenced; the driver thread idles.
    ///
    /// Serialized with `start`/`stop` through the session lock, so the enabled
    /// toggle never lands on a ring that `stop` is tearing down.
    pub fn pause(&self) -> bool {
        let _inner = self.inner.lock();
        if !self.control.transition(SessionState::Running, SessionState::Paused) {
            return false;
        }
        self.ring.set_enabled(false);
        self.core.0.lock().pause();
        info!("emulation session paused");
        self.broadcast(SessionState::Paused, None);
        true
    }

    /// Paused → Running. The frame schedule restarts from now.
    pub fn resume(&self) -> bool {
        let _inner = self.inner.lock();
        if self.control.state() != SessionState::Paused {
            return false;
        }
        self.control.request_rearm();
        if !self.control.transition(SessionState::Paused, SessionState::Running) {
            return false;
        }
        self.ring.set_enabled(true);
        self.core.0.lock().resume();
        info!("emulation session resumed");
        self.broadcast(SessionState::Running, None);
        true
    }

    /// Change the emulation speed multiplier. Takes effect on the next frame.
    ///
    /// Non-finite or non-positive rates are ignored.
    pub fn set_rate(&self, rate: f64) {
        if !rate.is_finite() || rate <= 0.0 {
            warn!(rate, "ignoring invalid emulation rate");
            return;
        }
        self.control.set_rate(rate);
        info!(rate, "emulation rate set");
    }

    pub fn rate(&self) -> f64 {
        self.control.rate()
    }

    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    pub fn phase(&self) -> DriverPhase {
        self.control.phase()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of driver counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Subscribe to lifecycle status events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Subscribe to per-frame timing events.
    pub fn subscribe_timing(&self) -> broadcast::Receiver<FrameTimingEvent> {
        self.timing_tx.subscribe()
    }

    /// The shared ring, for occupancy snapshots and the enabled toggle.
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Hand the read side of the ring to the audio output. Returns `None`
    /// after the first call.
    pub fn take_audio_consumer(&self) -> Option<RingConsumer> {
        self.inner.lock().consumer.take()
    }

    /// Message of the emulation failure that last stopped the session.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Outcome of the driver's most recent start-up priority request.
    pub fn last_priority(&self) -> Option<PriorityResult> {
        *self.last_priority.lock()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// Join a finished or stopping driver thread and take its producer back.
    fn reap(&self, inner: &mut SessionInner) -> Result<()> {
        let Some(handle) = inner.driver.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(Some(exit)) => {
                inner.producer = Some(exit.producer);
                exit.result
            }
            Ok(None) => Err(FrameError::DriverPanicked),
            Err(_) => {
                error!("frame driver thread panicked; ring producer lost");
                Err(FrameError::DriverPanicked)
            }
        }
    }

    fn abort_start(&self, inner: &mut SessionInner, producer: RingProducer) {
        self.control.swap_state(SessionState::Stopped);
        self.ring.set_enabled(false);
        inner.producer = Some(producer);
        self.core.0.lock().stop();
    }

    /// Runs on the driver thread after a failed step. Must not take `inner`:
    /// `stop()` may hold it while joining that same thread.
    fn failure_handler(&self) -> driver::FailureHandler {
        let control = Arc::clone(&self.control);
        let ring = Arc::clone(&self.ring);
        let core = self.core.clone();
        let last_error = Arc::clone(&self.last_error);
        let status_tx = self.status_tx.clone();

        Box::new(move |err: FrameError| {
            let previous = control.swap_state(SessionState::Stopped);
            ring.set_enabled(false);
            let message = err.to_string();
            *last_error.lock() = Some(message.clone());
            if previous != SessionState::Stopped {
                core.0.lock().stop();
                error!(%message, "emulation session stopped by step failure");
                let _ = status_tx.send(SessionStatusEvent {
                    state: SessionState::Stopped,
                    detail: Some(message),
                });
            }
        })
    }

    fn broadcast(&self, state: SessionState, detail: Option<String>) {
        let _ = self.status_tx.send(SessionStatusEvent { state, detail });
    }
}

impl Drop for EmulationSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("session teardown: {e}");
        }
    }
}

impl std::fmt::Debug for EmulationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulationSession")
            .field("state", &self.state())
            .field("ring", &self.ring)
            .field("rate", &self.rate())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::buffering::format::AudioFormat;
    use crate::emulation::{BuiltinCore, CoreKind, EmulationStep};
    use crate::video::{PixelFormat, VideoFormat};

    fn quiet_config() -> SessionConfig {
        SessionConfig {
            realtime_priority: false,
            ..SessionConfig::default()
        }
    }

    fn test_pattern_session() -> (EmulationSession, Arc<VideoSink>) {
        let core = BuiltinCore::new(CoreKind::TestPattern);
        let sink = Arc::new(VideoSink::new(core.video_format()).expect("sink"));
        let session = EmulationSession::new(quiet_config(), CoreHandle::new(core), Arc::downgrade(&sink))
            .expect("session");
        (session, sink)
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = SessionConfig::default();
        assert_eq!(config.ring_capacity, None);
        assert_eq!(config.ring_buffer_count, 3);
        assert_eq!(config.overflow_policy, OverflowPolicy::TruncateNewest);
        assert!(config.realtime_priority);
        approx::assert_relative_eq!(config.rate, 1.0);
    }

    #[test]
    fn ring_is_sized_from_core_audio_format() {
        let (session, _sink) = test_pattern_session();
        // 44.1 kHz stereo i16 at 59.97 Hz: 736 frames * 4 bytes * 3 = 8832 → 16384.
        assert_eq!(session.ring().capacity(), 16_384);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn explicit_capacity_overrides_sizing() {
        let config = SessionConfig {
            ring_capacity: Some(1000),
            ..quiet_config()
        };
        let session = EmulationSession::new(
            config,
            CoreHandle::new(BuiltinCore::new(CoreKind::Silent)),
            Weak::new(),
        )
        .expect("session");
        assert_eq!(session.ring().capacity(), 1024);
    }

    #[test]
    fn mismatched_video_sink_is_rejected() {
        let sink = Arc::new(
            VideoSink::new(VideoFormat::new(PixelFormat::Bgra8, 16, 16)).expect("sink"),
        );
        let err = EmulationSession::new(
            quiet_config(),
            CoreHandle::new(BuiltinCore::new(CoreKind::Silent)),
            Arc::downgrade(&sink),
        )
        .unwrap_err();
        assert!(matches!(err, FrameError::InvalidFormat(_)));
    }

    #[test]
    fn invalid_audio_format_is_rejected() {
        struct Mute;
        impl EmulationStep for Mute {
            fn frame_duration(&self) -> Duration {
                Duration::from_millis(16)
            }
            fn audio_format(&self) -> AudioFormat {
                AudioFormat::pcm_i16(0, 2)
            }
            fn video_format(&self) -> VideoFormat {
                VideoFormat::new(PixelFormat::Rgb565, 1, 1)
            }
            fn run_frame(&mut self, _video: Option<&mut [u8]>) -> Result<&[u8]> {
                Ok(&[])
            }
        }
        let err = EmulationSession::new(quiet_config(), CoreHandle::new(Mute), Weak::new()).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFormat(_)));
    }

    #[test]
    fn lifecycle_commands_are_idempotent() {
        let (session, _sink) = test_pattern_session();
        assert!(!session.pause());
        assert!(!session.resume());
        assert!(!session.stop().expect("stop while stopped"));

        assert!(session.start().expect("start"));
        assert!(!session.start().expect("second start"));
        assert_eq!(session.state(), SessionState::Running);

        assert!(session.pause());
        assert!(!session.pause());
        assert_eq!(session.state(), SessionState::Paused);

        assert!(session.resume());
        assert!(!session.resume());

        assert!(session.stop().expect("stop"));
        assert!(!session.stop().expect("second stop"));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.phase(), DriverPhase::Idle);
    }

    #[test]
    fn consumer_is_handed_out_once() {
        let (session, _sink) = test_pattern_session();
        assert!(session.take_audio_consumer().is_some());
        assert!(session.take_audio_consumer().is_none());
    }

    #[test]
    fn invalid_rates_are_ignored() {
        let (session, _sink) = test_pattern_session();
        session.set_rate(2.0);
        session.set_rate(0.0);
        session.set_rate(f64::NAN);
        session.set_rate(-1.0);
        approx::assert_relative_eq!(session.rate(), 2.0);
    }

    #[test]
    fn start_reports_priority_outcome() {
        let (session, _sink) = test_pattern_session();
        assert_eq!(session.last_priority(), None);
        session.start().expect("start");
        assert_eq!(session.last_priority(), Some(PriorityResult::Unsupported));
        session.stop().expect("stop");
    }
}
