//! Deterministic providers used by the app, the bench and the tests.
//!
//! Neither emulates a real machine. They produce a correctly sized,
//! correctly paced stream of audio bytes and video frames so the whole
//! pipeline can be exercised without a ROM.

use std::f64::consts::TAU;
use std::time::Duration;

use tracing::debug;

use crate::buffering::format::AudioFormat;
use crate::emulation::EmulationStep;
use crate::error::Result;
use crate::video::{PixelFormat, VideoFormat};

/// 59.97 Hz, the usual NTSC console refresh.
pub const NTSC_FRAME_DURATION: Duration = Duration::from_nanos(16_683_350);

/// Audio frames belonging to emulated frame `index`.
///
/// Per-frame counts vary by one so that the long-run sample rate is exact.
fn samples_in_frame(index: u64, sample_rate: u32, frame_duration: Duration) -> usize {
    let per_frame = sample_rate as f64 * frame_duration.as_secs_f64();
    let end = ((index + 1) as f64 * per_frame).floor() as u64;
    let start = (index as f64 * per_frame).floor() as u64;
    (end - start) as usize
}

/// Produces silence and a black frame.
pub struct SilentCore {
    audio_format: AudioFormat,
    video_format: VideoFormat,
    frame_duration: Duration,
    frame_index: u64,
    audio: Vec<u8>,
}

impl SilentCore {
    pub fn new(audio_format: AudioFormat, video_format: VideoFormat, frame_duration: Duration) -> Self {
        Self {
            audio_format,
            video_format,
            frame_duration,
            frame_index: 0,
            audio: Vec::new(),
        }
    }
}

impl Default for SilentCore {
    fn default() -> Self {
        Self::new(
            AudioFormat::pcm_i16(44_100, 2),
            VideoFormat::new(PixelFormat::Rgb565, 256, 224),
            NTSC_FRAME_DURATION,
        )
    }
}

impl EmulationStep for SilentCore {
    fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    fn audio_format(&self) -> AudioFormat {
        self.audio_format
    }

    fn video_format(&self) -> VideoFormat {
        self.video_format
    }

    fn run_frame(&mut self, video: Option<&mut [u8]>) -> Result<&[u8]> {
        let samples = samples_in_frame(
            self.frame_index,
            self.audio_format.sample_rate,
            self.frame_duration,
        );
        self.frame_index += 1;
        self.audio.clear();
        self.audio.resize(samples * self.audio_format.frame_size(), 0);
        if let Some(frame) = video {
            frame.fill(0);
        }
        Ok(&self.audio)
    }
}

/// Produces a sine tone (16-bit PCM) and scrolling vertical bars.
pub struct TestPatternCore {
    audio_format: AudioFormat,
    video_format: VideoFormat,
    frame_duration: Duration,
    tone_hz: f64,
    amplitude: f64,
    frame_index: u64,
    phase: f64,
    audio: Vec<u8>,
}

impl TestPatternCore {
    pub fn new(
        audio_format: AudioFormat,
        video_format: VideoFormat,
        frame_duration: Duration,
        tone_hz: f64,
    ) -> Self {
        Self {
            audio_format,
            video_format,
            frame_duration,
            tone_hz,
            amplitude: 0.25,
            frame_index: 0,
            phase: 0.0,
            audio: Vec::new(),
        }
    }

    pub fn frames_run(&self) -> u64 {
        self.frame_index
    }

    fn render_bars(&self, frame: &mut [u8]) {
        let bpp = self.video_format.pixel_format.bytes_per_pixel();
        let row = self.video_format.row_bytes();
        let shift = self.frame_index as usize;
        for (y, line) in frame.chunks_exact_mut(row).enumerate() {
            for (x, pixel) in line.chunks_exact_mut(bpp).enumerate() {
                let shade = (((x + shift) / 8) % 8 * 32) as u8;
                pixel.fill(shade ^ (y as u8 & 0x10));
            }
        }
    }
}

impl Default for TestPatternCore {
    fn default() -> Self {
        Self::new(
            AudioFormat::pcm_i16(44_100, 2),
            VideoFormat::new(PixelFormat::Rgb565, 256, 224),
            NTSC_FRAME_DURATION,
            440.0,
        )
    }
}

impl EmulationStep for TestPatternCore {
    fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    fn audio_format(&self) -> AudioFormat {
        self.audio_format
    }

    fn video_format(&self) -> VideoFormat {
        self.video_format
    }

    fn start(&mut self) -> Result<()> {
        debug!(tone_hz = self.tone_hz, "TestPatternCore::start");
        Ok(())
    }

    fn run_frame(&mut self, video: Option<&mut [u8]>) -> Result<&[u8]> {
        let samples = samples_in_frame(
            self.frame_index,
            self.audio_format.sample_rate,
            self.frame_duration,
        );
        let channels = self.audio_format.channels as usize;
        let step = TAU * self.tone_hz / self.audio_format.sample_rate as f64;

        self.audio.clear();
        self.audio.reserve(samples * self.audio_format.frame_size());
        for _ in 0..samples {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f64) as i16;
            for _ in 0..channels {
                self.audio.extend_from_slice(&value.to_le_bytes());
            }
            self.phase = (self.phase + step) % TAU;
        }

        if let Some(frame) = video {
            self.render_bars(frame);
        }
        self.frame_index += 1;
        Ok(&self.audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_frame_sample_counts_average_to_the_sample_rate() {
        let duration = Duration::from_millis(20);
        let total: usize = (0..50).map(|i| samples_in_frame(i, 44_100, duration)).sum();
        assert_eq!(total, 44_100);
    }

    #[test]
    fn silent_core_produces_zeroed_audio_and_clears_video() {
        let mut core = SilentCore::default();
        let mut frame = vec![0xFFu8; core.video_format().buffer_size()];
        let audio = core.run_frame(Some(&mut frame)).expect("frame").to_vec();
        assert!(audio.iter().all(|b| *b == 0));
        assert!(frame.iter().all(|b| *b == 0));
        assert_eq!(audio.len() % 4, 0);
    }

    #[test]
    fn test_pattern_core_renders_and_counts_frames() {
        let mut core = TestPatternCore::default();
        let mut frame = vec![0u8; core.video_format().buffer_size()];
        let audio = core.run_frame(Some(&mut frame)).expect("frame").to_vec();
        let expected_samples = samples_in_frame(0, 44_100, NTSC_FRAME_DURATION);
        assert_eq!(audio.len(), expected_samples * 4);
        assert!(audio.iter().any(|b| *b != 0), "tone should not be silent");
        assert!(frame.iter().any(|b| *b != 0), "bars should be drawn");
        assert_eq!(core.frames_run(), 1);
    }

    #[test]
    fn stereo_channels_carry_identical_samples() {
        let mut core = TestPatternCore::default();
        let audio = core.run_frame(None).expect("frame").to_vec();
        for frame in audio.chunks_exact(4) {
            assert_eq!(frame[0..2], frame[2..4]);
        }
    }
}
