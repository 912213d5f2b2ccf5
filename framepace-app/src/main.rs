//! `framepace`: headless host for one emulation session.
//!
//! Builds a session around a built-in core, attaches an audio consumer, runs
//! for the configured time (optionally pausing halfway) and logs diagnostics.

mod output;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use framepace_core::{
    BuiltinCore, CoreHandle, CoreKind, EmulationSession, EmulationStep, SessionStatusEvent,
    VideoSink,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use crate::output::AudioOutput;
use crate::settings::{load_settings, save_settings, AppSettings, AudioOutputKind};

#[derive(Debug, Default)]
struct Args {
    settings: Option<PathBuf>,
    save_settings: Option<PathBuf>,
    seconds: Option<f64>,
    rate: Option<f64>,
    core: Option<CoreKind>,
    audio: Option<AudioOutputKind>,
    no_pause: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("missing value for {name}"));
        match arg.as_str() {
            "--settings" => args.settings = Some(PathBuf::from(value("--settings")?)),
            "--save-settings" => args.save_settings = Some(PathBuf::from(value("--save-settings")?)),
            "--seconds" => {
                args.seconds = Some(value("--seconds")?.parse().context("invalid --seconds")?)
            }
            "--rate" => args.rate = Some(value("--rate")?.parse().context("invalid --rate")?),
            "--core" => {
                args.core = Some(match value("--core")?.as_str() {
                    "silent" => CoreKind::Silent,
                    "test-pattern" | "testPattern" => CoreKind::TestPattern,
                    other => bail!("unknown core: {other}"),
                })
            }
            "--audio" => {
                args.audio = Some(match value("--audio")?.as_str() {
                    "device" => AudioOutputKind::Device,
                    "simulated" => AudioOutputKind::Simulated,
                    other => bail!("unknown audio output: {other}"),
                })
            }
            "--no-pause" => args.no_pause = true,
            "--help" | "-h" => {
                println!(
                    "Usage: framepace [--settings <file.json>] [--save-settings <file.json>] \\
  [--seconds <s>] [--rate <r>] [--core silent|test-pattern] [--audio device|simulated] [--no-pause]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn resolve_settings(args: &Args) -> AppSettings {
    let mut settings = match &args.settings {
        Some(path) => load_settings(path),
        None => AppSettings::default(),
    };
    if let Some(seconds) = args.seconds {
        settings.run_seconds = seconds;
    }
    if let Some(rate) = args.rate {
        settings.rate = rate;
    }
    if let Some(core) = args.core {
        settings.core = core;
    }
    if let Some(audio) = args.audio {
        settings.audio_output = audio;
    }
    if args.no_pause {
        settings.pause_demo = false;
    }
    settings.normalize();
    settings
}

/// Log every lifecycle event until the session is dropped.
async fn forward_status(mut rx: broadcast::Receiver<SessionStatusEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                match &event.detail {
                    Some(detail) => warn!(%json, %detail, "session status"),
                    None => info!(%json, "session status"),
                }
            }
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "status events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("framepace=info")),
        )
        .init();

    let args = parse_args()?;
    let settings = resolve_settings(&args);
    if let Some(path) = &args.save_settings {
        save_settings(path, &settings)
            .with_context(|| format!("writing settings to {}", path.display()))?;
        info!(path = %path.display(), "settings saved");
    }
    info!(?settings, "framepace starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    // ── Session ───────────────────────────────────────────────────────────
    let core = BuiltinCore::new(settings.core);
    let audio_format = core.audio_format();
    let sink = Arc::new(VideoSink::new(core.video_format())?);
    let session = EmulationSession::new(
        settings.session_config(),
        CoreHandle::new(core),
        Arc::downgrade(&sink),
    )?;

    runtime.spawn(forward_status(session.subscribe_status()));

    let consumer = session
        .take_audio_consumer()
        .context("audio consumer already taken")?;
    let output = AudioOutput::open(settings.audio_output, consumer, audio_format)?;

    // ── Run ───────────────────────────────────────────────────────────────
    session.start()?;
    let run = settings.run_duration();
    if settings.pause_demo {
        thread::sleep(run / 2);
        session.pause();
        thread::sleep(Duration::from_secs(1));
        session.resume();
        thread::sleep(run - run / 2);
    } else {
        thread::sleep(run);
    }

    session.stop()?;
    let failure = session.last_error();
    if let Some(message) = &failure {
        error!(%message, "session ended early");
    }

    // ── Report ────────────────────────────────────────────────────────────
    let diagnostics = session.diagnostics_snapshot();
    let stats = output.stats();
    info!(
        diagnostics = %serde_json::to_string(&diagnostics)?,
        frames_published = sink.frames_published(),
        underruns = stats.underruns(),
        bytes_played = stats.bytes_played(),
        priority = ?session.last_priority(),
        "run complete"
    );

    drop(output);
    drop(session);
    runtime.shutdown_timeout(Duration::from_millis(100));

    match failure {
        Some(message) => bail!("session stopped with an error: {message}"),
        None => Ok(()),
    }
}
