//! Persistent host settings (JSON file chosen with `--settings`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use framepace_core::{CoreKind, OverflowPolicy, SessionConfig};
use serde::{Deserialize, Serialize};

/// Where drained audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioOutputKind {
    /// Default cpal output device (needs the `audio-cpal` feature).
    Device,
    /// A thread that drains the ring at the device cadence and discards it.
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub core: CoreKind,
    pub audio_output: AudioOutputKind,
    pub run_seconds: f64,
    pub rate: f64,
    pub realtime_priority: bool,
    pub overflow_policy: OverflowPolicy,
    pub ring_capacity: Option<usize>,
    pub ring_buffer_count: usize,
    /// Overrides the scheduler's spin window. `None` keeps the session
    /// default, which honours `FRAMEPACE_SPIN_THRESHOLD_US`.
    pub spin_threshold_us: Option<u64>,
    /// Pause for one second halfway through the run.
    pub pause_demo: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            core: CoreKind::TestPattern,
            audio_output: AudioOutputKind::Simulated,
            run_seconds: 5.0,
            rate: 1.0,
            realtime_priority: true,
            overflow_policy: OverflowPolicy::TruncateNewest,
            ring_capacity: None,
            ring_buffer_count: 3,
            spin_threshold_us: None,
            pause_demo: true,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.run_seconds = if self.run_seconds.is_finite() {
            self.run_seconds.clamp(0.1, 3_600.0)
        } else {
            5.0
        };
        self.rate = if self.rate.is_finite() && self.rate > 0.0 {
            self.rate.clamp(0.1, 16.0)
        } else {
            1.0
        };
        self.ring_capacity = self.ring_capacity.filter(|c| *c > 0);
        self.ring_buffer_count = self.ring_buffer_count.clamp(1, 16);
        self.spin_threshold_us = self.spin_threshold_us.map(|us| us.clamp(50, 5_000));
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs_f64(self.run_seconds)
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            ring_capacity: self.ring_capacity,
            ring_buffer_count: self.ring_buffer_count,
            overflow_policy: self.overflow_policy,
            realtime_priority: self.realtime_priority,
            spin_threshold: self
                .spin_threshold_us
                .map_or(defaults.spin_threshold, Duration::from_micros),
            rate: self.rate,
            ..defaults
        }
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
