//! Audio consumers for the host: the real cpal device or a simulated drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use framepace_core::{AudioFormat, AudioPlayback, PlaybackStats, RingConsumer, SampleDrain};
use tracing::{debug, info};

use crate::settings::AudioOutputKind;

/// Callback cadence of the simulated device.
const SIMULATED_TICK: Duration = Duration::from_millis(5);

pub enum AudioOutput {
    Device(AudioPlayback),
    Simulated(SimulatedDrain),
}

impl AudioOutput {
    /// Must be called, and the result dropped, on the same thread: a device
    /// stream is bound to its creation thread.
    pub fn open(kind: AudioOutputKind, consumer: RingConsumer, format: AudioFormat) -> Result<Self> {
        match kind {
            AudioOutputKind::Device => {
                let playback = AudioPlayback::open_default(consumer, format)
                    .context("opening default audio output (use --audio simulated to skip)")?;
                info!("audio output: default device");
                Ok(AudioOutput::Device(playback))
            }
            AudioOutputKind::Simulated => {
                info!(tick_ms = SIMULATED_TICK.as_millis() as u64, "audio output: simulated drain");
                Ok(AudioOutput::Simulated(SimulatedDrain::spawn(consumer, format)?))
            }
        }
    }

    pub fn stats(&self) -> Arc<PlaybackStats> {
        match self {
            AudioOutput::Device(playback) => Arc::clone(playback.stats()),
            AudioOutput::Simulated(drain) => Arc::clone(&drain.stats),
        }
    }
}

/// Pulls one tick of samples every `SIMULATED_TICK`, like a device callback.
pub struct SimulatedDrain {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<PlaybackStats>,
}

impl SimulatedDrain {
    pub fn spawn(consumer: RingConsumer, format: AudioFormat) -> Result<Self> {
        let stats = Arc::new(PlaybackStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let samples_per_tick =
            (format.bytes_for(SIMULATED_TICK) / format.bytes_per_sample.max(1) as usize).max(1);

        let mut drain = SampleDrain::new(consumer, Arc::clone(&stats));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("framepace-audio-sim".into())
            .spawn(move || {
                let mut out = vec![0i16; samples_per_tick];
                while flag.load(Ordering::Relaxed) {
                    drain.fill(&mut out, 0, |s| s);
                    thread::sleep(SIMULATED_TICK);
                }
                debug!("simulated audio drain stopped");
            })
            .context("spawning simulated audio drain")?;

        Ok(Self {
            running,
            handle: Some(handle),
            stats,
        })
    }
}

impl Drop for SimulatedDrain {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
