//! Audio playback via cpal backend.
//!
//! # Design constraints
//!
//! The cpal output callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (after the first callback sizes the scratch buffer)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! `SampleDrain` satisfies that contract: it pulls bytes with
//! `RingConsumer::read_into`, which never blocks, and pads a short read with
//! silence.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! `AudioPlayback` therefore must be created and dropped on the same thread.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

use crate::{
    buffering::{format::AudioFormat, RingConsumer},
    error::{FrameError, Result},
};

/// Counters updated from the output callback.
#[derive(Debug, Default)]
pub struct PlaybackStats {
    pub callbacks: AtomicU64,
    pub underruns: AtomicU64,
    pub bytes_played: AtomicU64,
}

impl PlaybackStats {
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn bytes_played(&self) -> u64 {
        self.bytes_played.load(Ordering::Relaxed)
    }
}

/// Converts 16-bit little-endian PCM from the ring into device samples.
pub struct SampleDrain {
    consumer: RingConsumer,
    scratch: Vec<u8>,
    stats: Arc<PlaybackStats>,
}

impl SampleDrain {
    pub fn new(consumer: RingConsumer, stats: Arc<PlaybackStats>) -> Self {
        Self {
            consumer,
            scratch: Vec::new(),
            stats,
        }
    }

    /// Fill `out` from the ring, converting each sample with `convert` and
    /// padding with `silence` on underrun. Returns the samples taken from the ring.
    pub fn fill<T: Copy>(&mut self, out: &mut [T], silence: T, convert: impl Fn(i16) -> T) -> usize {
        let needed = out.len() * 2;
        if self.scratch.len() < needed {
            self.scratch.resize(needed, 0);
        }

        let got = self.consumer.read_into(&mut self.scratch[..needed], needed);
        let samples = got / 2;
        for (slot, bytes) in out.iter_mut().zip(self.scratch[..samples * 2].chunks_exact(2)) {
            *slot = convert(i16::from_le_bytes([bytes[0], bytes[1]]));
        }
        out[samples..].fill(silence);

        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_played.fetch_add(got as u64, Ordering::Relaxed);
        if samples < out.len() {
            self.stats.underruns.fetch_add(1, Ordering::Relaxed);
        }
        samples
    }

    pub fn into_consumer(self) -> RingConsumer {
        self.consumer
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

pub fn i16_to_u16(sample: i16) -> u16 {
    (sample as i32 + 32768) as u16
}

/// Handle to an active audio output stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct AudioPlayback {
    /// Kept alive so the stream is not dropped prematurely.
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    stats: Arc<PlaybackStats>,
    /// Format the device was opened with.
    pub format: AudioFormat,
}

impl AudioPlayback {
    /// Open the system default output device at `format` and drain `consumer`
    /// from its callback.
    ///
    /// # Errors
    /// Returns `FrameError::NoDefaultOutputDevice` when no output is available,
    /// `FrameError::InvalidFormat` for non-16-bit formats, or
    /// `FrameError::AudioStream` if cpal fails to build or start the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open_default(consumer: RingConsumer, format: AudioFormat) -> Result<Self> {
        format.validate()?;
        if format.bytes_per_sample != 2 {
            return Err(FrameError::InvalidFormat(format!(
                "playback expects 16-bit samples, got {} bytes",
                format.bytes_per_sample
            )));
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(FrameError::NoDefaultOutputDevice)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = device
            .default_output_config()
            .map_err(|e| FrameError::AudioDevice(e.to_string()))?;

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            sample_format = ?supported.sample_format(),
            "audio config selected"
        );

        let stats = Arc::new(PlaybackStats::default());
        let mut drain = SampleDrain::new(consumer, Arc::clone(&stats));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _info| {
                    drain.fill(data, 0.0, i16_to_f32);
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    drain.fill(data, 0, |s| s);
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _info| {
                    drain.fill(data, 32768, i16_to_u16);
                },
                |err| error!("audio stream error: {err}"),
                None,
            ),
            fmt => {
                return Err(FrameError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| FrameError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| FrameError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            stats,
            format,
        })
    }

    pub fn stats(&self) -> &Arc<PlaybackStats> {
        &self.stats
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioPlayback {
    pub fn open_default(_consumer: RingConsumer, _format: AudioFormat) -> Result<Self> {
        Err(FrameError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::RingBuffer;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn full_read_converts_every_sample() {
        let (mut producer, consumer) = RingBuffer::split(64).unwrap();
        producer.push_slice(&pcm(&[0, 16384, -32768, 32767]));
        let stats = Arc::new(PlaybackStats::default());
        let mut drain = SampleDrain::new(consumer, Arc::clone(&stats));

        let mut out = [9.0f32; 4];
        assert_eq!(drain.fill(&mut out, 0.0, i16_to_f32), 4);
        approx::assert_relative_eq!(out[0], 0.0);
        approx::assert_relative_eq!(out[1], 0.5);
        approx::assert_relative_eq!(out[2], -1.0);
        approx::assert_relative_eq!(out[3], 32767.0 / 32768.0);
        assert_eq!(stats.underruns(), 0);
        assert_eq!(stats.bytes_played(), 8);
    }

    #[test]
    fn underrun_pads_with_silence() {
        let (mut producer, consumer) = RingBuffer::split(64).unwrap();
        producer.push_slice(&pcm(&[-1, 1]));
        let stats = Arc::new(PlaybackStats::default());
        let mut drain = SampleDrain::new(consumer, Arc::clone(&stats));

        let mut out = [7u16; 5];
        assert_eq!(drain.fill(&mut out, 32768, i16_to_u16), 2);
        assert_eq!(out, [32767, 32769, 32768, 32768, 32768]);
        assert_eq!(stats.underruns(), 1);
    }

    #[test]
    fn disabled_ring_plays_silence() {
        let (mut producer, consumer) = RingBuffer::split(64).unwrap();
        producer.push_slice(&pcm(&[100, 200]));
        consumer.ring().set_enabled(false);
        let mut drain = SampleDrain::new(consumer, Arc::new(PlaybackStats::default()));

        let mut out = [5i16; 2];
        assert_eq!(drain.fill(&mut out, 0, |s| s), 0);
        assert_eq!(out, [0, 0]);

        let consumer = drain.into_consumer();
        assert_eq!(consumer.ring().available_bytes_for_reading(), 4);
    }

    #[cfg(not(feature = "audio-cpal"))]
    #[test]
    fn open_without_backend_reports_error() {
        let (_producer, consumer) = RingBuffer::split(64).unwrap();
        let err = AudioPlayback::open_default(consumer, AudioFormat::pcm_i16(48_000, 2))
            .err()
            .expect("stub must fail");
        assert!(matches!(err, FrameError::AudioStream(_)));
    }
}
