//! Fixed-cadence frame loop.
//!
//! ## Per-iteration stages
//!
//! ```text
//! 0. Read lifecycle state (Stopped → exit, Paused → idle one period)
//! 1. Executing:  EmulationStep::run_frame → audio bytes (+ video in place)
//! 2. Commit:     RingProducer::write, truncating what does not fit
//! 3. Scheduling: wait_until(origin + period * index), or skip if already late
//! ```
//!
//! The loop runs on a dedicated OS thread owned by `EmulationSession`. It
//! only reads the lifecycle state; transitions belong to the session.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    buffering::RingProducer,
    emulation::CoreHandle,
    error::{FrameError, Result},
    ipc::events::{FrameTimingEvent, SessionState},
    realtime::{AbsoluteTime, PriorityResult, RealTimeScheduler},
    video::VideoSink,
};

/// Minimum spacing between overrun warnings.
const OVERRUN_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Slack allowed when deciding whether a screen refresh has elapsed.
const RENDER_TOLERANCE_DIVISOR: u32 = 100;

/// What to do with audio the ring cannot accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Keep the head of the frame's audio that fits; drop the tail.
    #[default]
    TruncateNewest,
    /// Drop the whole frame's audio unless all of it fits.
    DropFrame,
}

/// Where the driver thread currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DriverPhase {
    Idle = 0,
    Scheduling = 1,
    Executing = 2,
}

impl DriverPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DriverPhase::Scheduling,
            2 => DriverPhase::Executing,
            _ => DriverPhase::Idle,
        }
    }
}

/// Lock-free control block shared between the session and its driver.
///
/// The session writes `state`, `rearm_epoch` and `rate`; the driver only
/// writes `phase`.
pub struct DriverControl {
    state: AtomicU8,
    phase: AtomicU8,
    rearm_epoch: AtomicU64,
    rate_bits: AtomicU64,
}

impl DriverControl {
    pub fn new(rate: f64) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Stopped as u8),
            phase: AtomicU8::new(DriverPhase::Idle as u8),
            rearm_epoch: AtomicU64::new(0),
            rate_bits: AtomicU64::new(rate.to_bits()),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn phase(&self) -> DriverPhase {
        DriverPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn rate(&self) -> f64 {
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub(crate) fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Release);
    }

    /// Unconditionally move to `state`, returning the previous state.
    pub(crate) fn swap_state(&self, state: SessionState) -> SessionState {
        SessionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst))
    }

    /// Move `from → to` only if the current state is `from`.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Ask the driver to restart its schedule from "now" on its next iteration.
    pub(crate) fn request_rearm(&self) {
        self.rearm_epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn rearm_epoch(&self) -> u64 {
        self.rearm_epoch.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: DriverPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for DriverControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverControl")
            .field("state", &self.state())
            .field("phase", &self.phase())
            .field("rate", &self.rate())
            .finish()
    }
}

/// Frame deadlines anchored at a fixed origin.
///
/// Deadline `n` is `origin + period * n`, computed from the origin every time
/// so per-frame rounding never accumulates.
#[derive(Debug, Clone, Copy)]
pub struct FrameSchedule {
    origin: AbsoluteTime,
    period: Duration,
    frame_index: u64,
}

impl FrameSchedule {
    pub fn new(origin: AbsoluteTime, period: Duration) -> Self {
        Self {
            origin,
            period,
            frame_index: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn origin(&self) -> AbsoluteTime {
        self.origin
    }

    /// Frames scheduled since the origin.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn deadline(&self, index: u64) -> AbsoluteTime {
        let offset = self.period.as_nanos() * index as u128;
        self.origin + Duration::from_nanos(offset.min(u64::MAX as u128) as u64)
    }

    /// Deadline of the frame after the current index.
    pub fn next_deadline(&self) -> AbsoluteTime {
        self.deadline(self.frame_index + 1)
    }

    /// Move past the current frame and return its deadline.
    pub fn advance(&mut self) -> AbsoluteTime {
        self.frame_index += 1;
        self.deadline(self.frame_index)
    }

    /// Restart the schedule at `origin`, optionally with a new period.
    pub fn rearm(&mut self, origin: AbsoluteTime, period: Duration) {
        self.origin = origin;
        self.period = period;
        self.frame_index = 0;
    }
}

/// Atomic counters updated by the driver thread.
#[derive(Default)]
pub struct DriverDiagnostics {
    pub frames_executed: AtomicUsize,
    pub frames_rendered: AtomicUsize,
    pub frames_paused: AtomicUsize,
    pub overruns: AtomicUsize,
    pub audio_bytes_produced: AtomicUsize,
    pub audio_bytes_written: AtomicUsize,
    pub audio_bytes_dropped: AtomicUsize,
    pub overflow_events: AtomicUsize,
    pub priority_requests: AtomicUsize,
    pub priority_failures: AtomicUsize,
    pub max_lateness_us: AtomicU64,
}

impl DriverDiagnostics {
    pub fn reset(&self) {
        self.frames_executed.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.frames_paused.store(0, Ordering::Relaxed);
        self.overruns.store(0, Ordering::Relaxed);
        self.audio_bytes_produced.store(0, Ordering::Relaxed);
        self.audio_bytes_written.store(0, Ordering::Relaxed);
        self.audio_bytes_dropped.store(0, Ordering::Relaxed);
        self.overflow_events.store(0, Ordering::Relaxed);
        self.priority_requests.store(0, Ordering::Relaxed);
        self.priority_failures.store(0, Ordering::Relaxed);
        self.max_lateness_us.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_executed: self.frames_executed.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_paused: self.frames_paused.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            audio_bytes_produced: self.audio_bytes_produced.load(Ordering::Relaxed),
            audio_bytes_written: self.audio_bytes_written.load(Ordering::Relaxed),
            audio_bytes_dropped: self.audio_bytes_dropped.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            priority_requests: self.priority_requests.load(Ordering::Relaxed),
            priority_failures: self.priority_failures.load(Ordering::Relaxed),
            max_lateness_us: self.max_lateness_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_executed: usize,
    pub frames_rendered: usize,
    pub frames_paused: usize,
    pub overruns: usize,
    pub audio_bytes_produced: usize,
    pub audio_bytes_written: usize,
    pub audio_bytes_dropped: usize,
    pub overflow_events: usize,
    pub priority_requests: usize,
    pub priority_failures: usize,
    pub max_lateness_us: u64,
}

/// Result of one executed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub audio_produced: usize,
    pub audio_written: usize,
    pub rendered: bool,
}

/// Callback the session installs to learn about a fatal step failure.
pub type FailureHandler = Box<dyn FnOnce(FrameError) + Send>;

/// All context the driver needs, passed as one struct so construction stays tidy.
pub struct DriverContext {
    pub core: CoreHandle,
    pub producer: RingProducer,
    pub video: Weak<VideoSink>,
    pub scheduler: RealTimeScheduler,
    pub control: Arc<DriverControl>,
    pub diagnostics: Arc<DriverDiagnostics>,
    pub timing_tx: broadcast::Sender<FrameTimingEvent>,
    pub overflow_policy: OverflowPolicy,
    pub realtime_priority: bool,
    pub screen_refresh_interval: Duration,
    /// Receives the priority outcome once the loop is about to start.
    pub started_tx: Option<Sender<PriorityResult>>,
    pub on_failure: Option<FailureHandler>,
}

/// What the driver hands back to the session when its thread exits.
pub struct DriverExit {
    pub producer: RingProducer,
    pub result: Result<()>,
}

pub struct FrameDriver {
    ctx: DriverContext,
    native_period: Duration,
    /// Bytes per audio frame; truncation never splits one.
    audio_frame_size: usize,
    render_credit: Duration,
    frames_executed: u64,
    video_missing_logged: bool,
}

impl FrameDriver {
    pub fn new(ctx: DriverContext) -> Self {
        let (native_period, audio_frame_size) = {
            let core = ctx.core.0.lock();
            (core.frame_duration(), core.audio_format().frame_size().max(1))
        };
        let render_credit = ctx.screen_refresh_interval;
        Self {
            ctx,
            native_period,
            audio_frame_size,
            render_credit,
            frames_executed: 0,
            video_missing_logged: false,
        }
    }

    /// Wall-clock period for the current emulation rate.
    pub fn effective_period(&self) -> Duration {
        let rate = self.ctx.control.rate();
        if rate.is_finite() && rate > 0.0 {
            let nanos = (self.native_period.as_nanos() as f64 / rate).round();
            Duration::from_nanos(nanos.max(1.0) as u64)
        } else {
            self.native_period
        }
    }

    /// Execute one frame and commit its audio, without any waiting.
    ///
    /// # Errors
    /// Propagates the emulation step's failure.
    pub fn step(&mut self, period: Duration) -> Result<FrameReport> {
        self.ctx.control.set_phase(DriverPhase::Executing);

        let render = self.should_render(period);
        let sink = if render { self.upgrade_sink() } else { None };

        let mut core = self.ctx.core.0.lock();
        let mut frame = sink.as_ref().map(|s| s.lock());
        let audio = core.run_frame(frame.as_deref_mut().map(|f| &mut f[..]))?;
        let rendered = frame.is_some();
        drop(frame);
        if let Some(sink) = sink.as_ref() {
            sink.mark_published();
        }

        let produced = audio.len();
        let policy = self.ctx.overflow_policy;
        let frame_size = self.audio_frame_size;
        let written = self.ctx.producer.write(|mut region| {
            if region.len() >= produced {
                return region.copy_from(audio);
            }
            match policy {
                OverflowPolicy::TruncateNewest => {
                    let fit = region.len() - region.len() % frame_size;
                    region.copy_from(&audio[..fit])
                }
                OverflowPolicy::DropFrame => 0,
            }
        });
        drop(core);

        self.frames_executed += 1;
        let diag = &self.ctx.diagnostics;
        diag.frames_executed.fetch_add(1, Ordering::Relaxed);
        diag.audio_bytes_produced.fetch_add(produced, Ordering::Relaxed);
        diag.audio_bytes_written.fetch_add(written, Ordering::Relaxed);
        if rendered {
            diag.frames_rendered.fetch_add(1, Ordering::Relaxed);
        }
        // A ring disabled by pause refuses the write; that is not an overflow.
        if written < produced && self.ctx.producer.ring().is_enabled() {
            diag.overflow_events.fetch_add(1, Ordering::Relaxed);
            diag.audio_bytes_dropped
                .fetch_add(produced - written, Ordering::Relaxed);
            debug!(produced, written, "audio ring full: dropped tail of frame");
        }

        Ok(FrameReport {
            audio_produced: produced,
            audio_written: written,
            rendered,
        })
    }

    /// Run until the session leaves Running/Paused or the step fails.
    pub fn run(mut self) -> DriverExit {
        let scheduler = self.ctx.scheduler;
        let mut period = self.effective_period();
        info!(period_us = period.as_micros() as u64, "frame driver started");

        let priority = self.request_priority(period);
        if let Some(tx) = self.ctx.started_tx.take() {
            let _ = tx.send(priority);
        }

        let mut schedule = FrameSchedule::new(scheduler.absolute_time(), period);
        let mut rearm_seen = self.ctx.control.rearm_epoch();
        let mut overruns_since_warn = 0usize;
        let mut last_overrun_warn: Option<AbsoluteTime> = None;
        let mut result = Ok(());

        loop {
            // ── 0. Lifecycle gate ────────────────────────────────────────
            match self.ctx.control.state() {
                SessionState::Stopped => break,
                SessionState::Paused => {
                    self.ctx.control.set_phase(DriverPhase::Scheduling);
                    self.ctx
                        .diagnostics
                        .frames_paused
                        .fetch_add(1, Ordering::Relaxed);
                    thread::sleep(period);
                    continue;
                }
                SessionState::Running => {}
            }

            let current = self.effective_period();
            if current != period {
                info!(
                    from_us = period.as_micros() as u64,
                    to_us = current.as_micros() as u64,
                    "frame period changed"
                );
                period = current;
                self.request_priority(period);
                schedule.rearm(scheduler.absolute_time(), period);
            }

            let epoch = self.ctx.control.rearm_epoch();
            if epoch != rearm_seen {
                rearm_seen = epoch;
                schedule.rearm(scheduler.absolute_time(), period);
                debug!("frame schedule re-armed");
            }

            // ── 1 + 2. Execute and commit ────────────────────────────────
            let report = match self.step(period) {
                Ok(report) => report,
                Err(e) => {
                    error!("emulation step failed: {e}");
                    result = Err(e);
                    break;
                }
            };

            // ── 3. Wait for the frame deadline ───────────────────────────
            self.ctx.control.set_phase(DriverPhase::Scheduling);
            let deadline = schedule.advance();
            let now = scheduler.absolute_time();
            let overrun = now >= deadline;
            let lateness = if overrun {
                let late = now.saturating_duration_since(deadline);
                self.ctx.diagnostics.overruns.fetch_add(1, Ordering::Relaxed);
                debug!(late_us = late.as_micros() as u64, "frame overran its deadline");
                overruns_since_warn += 1;
                let warn_due = last_overrun_warn
                    .map(|t| now.saturating_duration_since(t) >= OVERRUN_WARN_INTERVAL)
                    .unwrap_or(true);
                if warn_due {
                    warn!(overruns = overruns_since_warn, "frame deadlines missed");
                    overruns_since_warn = 0;
                    last_overrun_warn = Some(now);
                }
                // No catch-up: the next frame starts now and is paced from here.
                schedule.rearm(now, period);
                late
            } else {
                scheduler.wait_until(deadline);
                scheduler.absolute_time().saturating_duration_since(deadline)
            };

            let lateness_us = lateness.as_micros().min(u64::MAX as u128) as u64;
            self.ctx
                .diagnostics
                .max_lateness_us
                .fetch_max(lateness_us, Ordering::Relaxed);
            let _ = self.ctx.timing_tx.send(FrameTimingEvent {
                frame: self.frames_executed,
                lateness_us,
                overrun,
                rendered: report.rendered,
                audio_produced: report.audio_produced,
                audio_written: report.audio_written,
            });
        }

        self.ctx.control.set_phase(DriverPhase::Idle);
        info!(frames = self.frames_executed, "frame driver stopped");

        let FrameDriver { ctx, .. } = self;
        let DriverContext {
            mut producer,
            on_failure,
            ..
        } = ctx;

        if let Err(e) = result {
            // Release buffered audio before anyone can observe the stop.
            producer.ring().set_enabled(false);
            producer.reset();
            if let Some(handler) = on_failure {
                handler(e);
                return DriverExit {
                    producer,
                    result: Ok(()),
                };
            }
            return DriverExit {
                producer,
                result: Err(e),
            };
        }

        DriverExit {
            producer,
            result: Ok(()),
        }
    }

    /// Hand the ring producer back (used when the driver never ran).
    pub fn into_producer(self) -> RingProducer {
        self.ctx.producer
    }

    fn request_priority(&self, period: Duration) -> PriorityResult {
        if !self.ctx.realtime_priority {
            return PriorityResult::Unsupported;
        }
        let diag = &self.ctx.diagnostics;
        diag.priority_requests.fetch_add(1, Ordering::Relaxed);
        let result = self.ctx.scheduler.set_realtime_priority(period);
        if !result.is_granted() {
            diag.priority_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Render only when a screen refresh worth of wall time has passed since
    /// the last rendered frame. The first frame always renders.
    fn should_render(&mut self, period: Duration) -> bool {
        let interval = self.ctx.screen_refresh_interval;
        let tolerance = interval / RENDER_TOLERANCE_DIVISOR;
        if self.render_credit + tolerance >= interval {
            self.render_credit = period;
            true
        } else {
            self.render_credit += period;
            false
        }
    }

    fn upgrade_sink(&mut self) -> Option<Arc<VideoSink>> {
        let sink = self.ctx.video.upgrade();
        if sink.is_none() && !self.video_missing_logged {
            debug!("video sink dropped; frames will not be published");
            self.video_missing_logged = true;
        }
        sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::buffering::{format::AudioFormat, RingBuffer, RingConsumer};
    use crate::emulation::EmulationStep;
    use crate::video::{PixelFormat, VideoFormat};

    /// Emits `bytes_per_frame` bytes counting up from the frame number.
    struct CountingCore {
        bytes_per_frame: usize,
        frame: u8,
        audio: Vec<u8>,
        fail_at: Option<u8>,
    }

    impl CountingCore {
        fn new(bytes_per_frame: usize) -> Self {
            Self {
                bytes_per_frame,
                frame: 0,
                audio: Vec::new(),
                fail_at: None,
            }
        }
    }

    impl EmulationStep for CountingCore {
        fn frame_duration(&self) -> Duration {
            Duration::from_millis(4)
        }

        fn audio_format(&self) -> AudioFormat {
            AudioFormat::pcm_i16(48_000, 1)
        }

        fn video_format(&self) -> VideoFormat {
            VideoFormat::new(PixelFormat::Rgba8, 4, 2)
        }

        fn run_frame(&mut self, video: Option<&mut [u8]>) -> Result<&[u8]> {
            if self.fail_at == Some(self.frame) {
                return Err(FrameError::Emulation("corrupted state".into()));
            }
            self.audio.clear();
            self.audio.resize(self.bytes_per_frame, self.frame);
            if let Some(frame) = video {
                frame.fill(self.frame.wrapping_add(1));
            }
            self.frame = self.frame.wrapping_add(1);
            Ok(&self.audio)
        }
    }

    fn context(
        core: CountingCore,
        capacity: usize,
        policy: OverflowPolicy,
        video: Weak<VideoSink>,
    ) -> (DriverContext, RingConsumer, Arc<DriverControl>) {
        let (producer, consumer) = RingBuffer::split(capacity).expect("ring");
        let control = Arc::new(DriverControl::new(1.0));
        let (timing_tx, _) = broadcast::channel(16);
        let ctx = DriverContext {
            core: CoreHandle::new(core),
            producer,
            video,
            scheduler: RealTimeScheduler::new(Duration::from_micros(500)),
            control: Arc::clone(&control),
            diagnostics: Arc::new(DriverDiagnostics::default()),
            timing_tx,
            overflow_policy: policy,
            realtime_priority: false,
            screen_refresh_interval: Duration::from_millis(4),
            started_tx: None,
            on_failure: None,
        };
        (ctx, consumer, control)
    }

    #[test]
    fn schedule_deadlines_are_anchored_to_origin() {
        let origin = AbsoluteTime::from_ticks(1_000);
        let period = Duration::from_nanos(16_683_350);
        let mut schedule = FrameSchedule::new(origin, period);

        for _ in 0..600 {
            schedule.advance();
        }
        let expected = origin + Duration::from_nanos(16_683_350 * 600);
        assert_eq!(schedule.deadline(600), expected);
        assert_eq!(schedule.frame_index(), 600);
        assert_eq!(schedule.next_deadline(), schedule.deadline(601));
    }

    #[test]
    fn rearm_restarts_index_at_new_origin() {
        let mut schedule = FrameSchedule::new(AbsoluteTime::from_ticks(0), Duration::from_millis(10));
        schedule.advance();
        schedule.advance();

        let origin = AbsoluteTime::from_ticks(5_000_000_000);
        schedule.rearm(origin, Duration::from_millis(5));
        assert_eq!(schedule.frame_index(), 0);
        assert_eq!(schedule.period(), Duration::from_millis(5));
        assert_eq!(schedule.advance(), origin + Duration::from_millis(5));
    }

    #[test]
    fn step_commits_audio_and_renders_video() {
        let sink = Arc::new(
            VideoSink::new(VideoFormat::new(PixelFormat::Rgba8, 4, 2)).expect("sink"),
        );
        let (ctx, mut consumer, _control) = context(
            CountingCore::new(10),
            64,
            OverflowPolicy::TruncateNewest,
            Arc::downgrade(&sink),
        );
        let mut driver = FrameDriver::new(ctx);

        let report = driver.step(Duration::from_millis(4)).expect("step");
        assert_eq!(
            report,
            FrameReport {
                audio_produced: 10,
                audio_written: 10,
                rendered: true
            }
        );
        assert_eq!(sink.frames_published(), 1);
        assert!(sink.snapshot().iter().all(|b| *b == 1));

        let mut out = [0xFFu8; 10];
        assert_eq!(consumer.pop_slice(&mut out), 10);
        assert_eq!(out, [0u8; 10]);
    }

    #[test]
    fn truncate_policy_keeps_the_head_of_the_frame() {
        let (ctx, mut consumer, _control) = context(
            CountingCore::new(12),
            16,
            OverflowPolicy::TruncateNewest,
            Weak::new(),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let mut driver = FrameDriver::new(ctx);

        driver.step(Duration::from_millis(4)).expect("frame 0");
        let report = driver.step(Duration::from_millis(4)).expect("frame 1");
        assert_eq!(report.audio_written, 4);

        let mut out = [0u8; 16];
        assert_eq!(consumer.pop_slice(&mut out), 16);
        assert_eq!(&out[..12], &[0u8; 12]);
        assert_eq!(&out[12..], &[1u8; 4]);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.audio_bytes_dropped, 8);
        assert_eq!(snap.overflow_events, 1);
    }

    #[test]
    fn drop_frame_policy_never_splits_a_frame() {
        let (ctx, consumer, _control) = context(
            CountingCore::new(12),
            16,
            OverflowPolicy::DropFrame,
            Weak::new(),
        );
        let mut driver = FrameDriver::new(ctx);

        driver.step(Duration::from_millis(4)).expect("frame 0");
        let report = driver.step(Duration::from_millis(4)).expect("frame 1");
        assert_eq!(report.audio_written, 0);
        assert_eq!(consumer.ring().available_bytes_for_reading(), 12);
    }

    #[test]
    fn fast_forward_renders_every_other_frame() {
        let sink = Arc::new(
            VideoSink::new(VideoFormat::new(PixelFormat::Rgba8, 4, 2)).expect("sink"),
        );
        let (ctx, _consumer, control) = context(
            CountingCore::new(2),
            1024,
            OverflowPolicy::TruncateNewest,
            Arc::downgrade(&sink),
        );
        control.set_rate(2.0);
        let mut driver = FrameDriver::new(ctx);
        let period = driver.effective_period();
        assert_eq!(period, Duration::from_millis(2));

        let rendered: Vec<bool> = (0..6)
            .map(|_| driver.step(period).expect("step").rendered)
            .collect();
        assert_eq!(rendered, [true, false, true, false, true, false]);
        assert_eq!(sink.frames_published(), 3);
    }

    #[test]
    fn dropped_sink_skips_video_but_keeps_audio() {
        let sink = Arc::new(
            VideoSink::new(VideoFormat::new(PixelFormat::Rgba8, 4, 2)).expect("sink"),
        );
        let (ctx, consumer, _control) = context(
            CountingCore::new(6),
            64,
            OverflowPolicy::TruncateNewest,
            Arc::downgrade(&sink),
        );
        drop(sink);
        let mut driver = FrameDriver::new(ctx);

        let report = driver.step(Duration::from_millis(4)).expect("step");
        assert!(!report.rendered);
        assert_eq!(consumer.ring().available_bytes_for_reading(), 6);
    }

    #[test]
    fn run_exits_on_stop_and_returns_producer() {
        let (ctx, _consumer, control) = context(
            CountingCore::new(8),
            4096,
            OverflowPolicy::TruncateNewest,
            Weak::new(),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);
        control.swap_state(SessionState::Running);
        let driver = FrameDriver::new(ctx);

        let handle = thread::spawn(move || driver.run());
        thread::sleep(Duration::from_millis(60));
        control.swap_state(SessionState::Stopped);
        let exit = handle.join().expect("driver thread panicked");

        assert!(exit.result.is_ok());
        assert_eq!(control.phase(), DriverPhase::Idle);
        let frames = diagnostics.snapshot().frames_executed;
        assert!(frames >= 5, "only {frames} frames in 60ms at 4ms period");
        assert_eq!(exit.producer.ring().write_cursor(), frames * 8);
    }

    #[test]
    fn run_reports_step_failure_through_handler() {
        let mut core = CountingCore::new(4);
        core.fail_at = Some(3);
        let (mut ctx, _consumer, control) =
            context(core, 256, OverflowPolicy::TruncateNewest, Weak::new());
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let (err_tx, err_rx) = crossbeam_channel::bounded(1);
        ctx.on_failure = Some(Box::new(move |e| {
            let _ = err_tx.send(e.to_string());
        }));
        control.swap_state(SessionState::Running);

        let exit = FrameDriver::new(ctx).run();
        assert!(exit.result.is_ok());
        assert_eq!(diagnostics.snapshot().audio_bytes_written, 12);
        let ring = exit.producer.ring();
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(ring.available_bytes_for_reading(), 0);
        assert!(!ring.is_enabled());
        let message = err_rx.try_recv().expect("failure reported");
        assert!(message.contains("corrupted state"));
    }

    #[test]
    fn run_without_handler_still_releases_the_ring() {
        let mut core = CountingCore::new(4);
        core.fail_at = Some(2);
        let (ctx, _consumer, control) =
            context(core, 256, OverflowPolicy::TruncateNewest, Weak::new());
        control.swap_state(SessionState::Running);

        let exit = FrameDriver::new(ctx).run();
        assert!(matches!(exit.result, Err(FrameError::Emulation(_))));
        assert_eq!(exit.producer.ring().available_bytes_for_reading(), 0);
    }

    #[test]
    fn disabled_ring_is_not_counted_as_overflow() {
        let (ctx, _consumer, _control) = context(
            CountingCore::new(8),
            64,
            OverflowPolicy::TruncateNewest,
            Weak::new(),
        );
        let diagnostics = Arc::clone(&ctx.diagnostics);
        let mut driver = FrameDriver::new(ctx);
        driver.ctx.producer.ring().set_enabled(false);

        let report = driver.step(Duration::from_millis(4)).expect("step");
        assert_eq!(report.audio_produced, 8);
        assert_eq!(report.audio_written, 0);
        let snap = diagnostics.snapshot();
        assert_eq!(snap.overflow_events, 0);
        assert_eq!(snap.audio_bytes_dropped, 0);
        assert_eq!(snap.audio_bytes_written, 0);
    }
}
