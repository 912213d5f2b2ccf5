//! Audio format negotiated out-of-band between the emulation core and the
//! output device, plus ring sizing derived from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Interleaved PCM layout. The ring only moves bytes; this describes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    /// Samples per second per channel (e.g. 32040, 44100, 48000).
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample per channel (2 for i16 PCM).
    pub bytes_per_sample: u16,
}

impl AudioFormat {
    /// 16-bit interleaved PCM.
    pub const fn pcm_i16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bytes_per_sample: 2,
        }
    }

    /// Bytes per audio frame (one sample for every channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Bytes of audio covering `duration`, rounded up to whole audio frames.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (self.sample_rate as f64 * duration.as_secs_f64()).ceil() as usize;
        frames * self.frame_size()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.bytes_per_sample == 0 {
            return Err(FrameError::InvalidFormat(format!(
                "audio format must be non-zero: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Preferred ring capacity for one emulated frame of audio times
/// `buffer_count` frames of headroom.
///
/// The ring rounds this up to a power of two on construction.
pub fn preferred_ring_capacity(
    format: &AudioFormat,
    frame_duration: Duration,
    buffer_count: usize,
) -> Result<usize> {
    format.validate()?;
    let per_frame = format.bytes_for(frame_duration);
    let capacity = per_frame.saturating_mul(buffer_count.max(1));
    if capacity == 0 {
        return Err(FrameError::InvalidCapacity {
            requested: capacity,
        });
    }
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_covers_all_channels() {
        assert_eq!(AudioFormat::pcm_i16(48_000, 2).frame_size(), 4);
        assert_eq!(AudioFormat::pcm_i16(44_100, 1).frame_size(), 2);
    }

    #[test]
    fn bytes_for_rounds_up_to_whole_frames() {
        let format = AudioFormat::pcm_i16(48_000, 1);
        assert_eq!(format.bytes_for(Duration::from_millis(16)), 1536);

        // 44100 Hz * 16.683 ms = 735.72 frames, rounded up to 736.
        let format = AudioFormat::pcm_i16(44_100, 1);
        assert_eq!(format.bytes_for(Duration::from_micros(16_683)), 1472);
    }

    #[test]
    fn preferred_capacity_scales_with_buffer_count() {
        let format = AudioFormat::pcm_i16(32_000, 2);
        let frame = Duration::from_millis(20);
        assert_eq!(preferred_ring_capacity(&format, frame, 1).unwrap(), 2560);
        assert_eq!(preferred_ring_capacity(&format, frame, 4).unwrap(), 10_240);
        assert_eq!(preferred_ring_capacity(&format, frame, 0).unwrap(), 2560);
    }

    #[test]
    fn zero_format_is_rejected() {
        let format = AudioFormat::pcm_i16(0, 2);
        assert!(matches!(
            preferred_ring_capacity(&format, Duration::from_millis(16), 3),
            Err(FrameError::InvalidFormat(_))
        ));
    }

    #[test]
    fn format_serializes_with_camel_case() {
        let json = serde_json::to_value(AudioFormat::pcm_i16(48_000, 2)).expect("serialize");
        assert_eq!(json["sampleRate"], 48_000);
        assert_eq!(json["bytesPerSample"], 2);
    }
}
