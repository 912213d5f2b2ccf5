//! Video sink: a fixed-size frame region owned by the orchestrator.
//!
//! The frame driver only holds a `Weak<VideoSink>`. Dropping the sink between
//! sessions is fine; the driver upgrades once per frame and simply skips
//! video publication when the sink is gone.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb565,
    Bgra8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => 4,
        }
    }
}

/// Pixel layout and dimensions, fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
        }
    }

    /// Bytes in one tightly packed frame.
    pub fn buffer_size(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.pixel_format.bytes_per_pixel()
    }
}

/// Externally owned frame memory the emulation step renders into.
pub struct VideoSink {
    format: VideoFormat,
    frame: Mutex<Box<[u8]>>,
    frames_published: AtomicU64,
}

impl VideoSink {
    /// # Errors
    /// `FrameError::InvalidFormat` for a zero-sized frame.
    pub fn new(format: VideoFormat) -> Result<Self> {
        let size = format.buffer_size();
        if size == 0 {
            return Err(FrameError::InvalidFormat(format!(
                "video frame must be non-empty: {format:?}"
            )));
        }
        Ok(Self {
            format,
            frame: Mutex::new(vec![0u8; size].into_boxed_slice()),
            frames_published: AtomicU64::new(0),
        })
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    /// Number of frames rendered into the sink so far.
    pub fn frames_published(&self) -> u64 {
        self.frames_published.load(Ordering::Acquire)
    }

    /// Lock the frame for reading (presentation) or writing (rendering).
    pub fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.frame.lock()
    }

    /// Copy the latest frame out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.frame.lock().to_vec()
    }

    pub(crate) fn mark_published(&self) {
        self.frames_published.fetch_add(1, Ordering::Release);
    }
}

impl std::fmt::Debug for VideoSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoSink")
            .field("format", &self.format)
            .field("frames_published", &self.frames_published())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_size_matches_pixel_format() {
        let gba = VideoFormat::new(PixelFormat::Rgb565, 240, 160);
        assert_eq!(gba.buffer_size(), 240 * 160 * 2);
        assert_eq!(gba.row_bytes(), 480);

        let nes = VideoFormat::new(PixelFormat::Bgra8, 256, 240);
        assert_eq!(nes.buffer_size(), 256 * 240 * 4);
    }

    #[test]
    fn empty_frame_is_rejected() {
        let err = VideoSink::new(VideoFormat::new(PixelFormat::Rgba8, 0, 144)).unwrap_err();
        assert!(matches!(err, FrameError::InvalidFormat(_)));
    }

    #[test]
    fn sink_allocates_one_zeroed_frame() {
        let sink = VideoSink::new(VideoFormat::new(PixelFormat::Rgb565, 160, 144)).unwrap();
        let frame = sink.snapshot();
        assert_eq!(frame.len(), 160 * 144 * 2);
        assert!(frame.iter().all(|b| *b == 0));
        assert_eq!(sink.frames_published(), 0);
    }
}
