fn main() {
    if let Err(e) = run() {
        eprintln!("pacing bench failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use framepace_core::{
        BuiltinCore, CoreHandle, CoreKind, EmulationSession, EmulationStep, SessionConfig,
        VideoSink,
    };
    use serde::Serialize;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast::error::RecvError;

    #[derive(Debug)]
    struct Args {
        frames: u64,
        rate: f64,
        realtime_priority: bool,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        frames: u64,
        rate: f64,
        period_us: u64,
        priority: String,
        wall_time_ms: f64,
        p50_lateness_us: f64,
        p95_lateness_us: f64,
        max_lateness_us: f64,
        overruns: usize,
        frames_rendered: usize,
        timing_events_lagged: u64,
        bytes_written: usize,
        bytes_read: usize,
        bytes_dropped: usize,
    }

    fn parse_args() -> Result<Args, String> {
        let mut frames: u64 = 600;
        let mut rate: f64 = 1.0;
        let mut realtime_priority = true;
        let mut output: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--frames" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --frames".into());
                    };
                    frames = v
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --frames".to_string())?
                        .clamp(1, 1_000_000);
                }
                "--rate" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --rate".into());
                    };
                    rate = v
                        .parse::<f64>()
                        .ok()
                        .filter(|r| r.is_finite() && *r > 0.0)
                        .ok_or_else(|| "invalid value for --rate".to_string())?;
                }
                "--no-priority" => realtime_priority = false,
                "--output" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --output".into());
                    };
                    output = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p framepace-core --bin pacing_bench -- \\
  [--frames <n>] [--rate <r>] [--no-priority] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }

        Ok(Args {
            frames,
            rate,
            realtime_priority,
            output,
        })
    }

    fn percentile(values: &[f64], p: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        if sorted.len() == 1 {
            return sorted[0];
        }
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    let args = parse_args()?;

    let core = BuiltinCore::new(CoreKind::TestPattern);
    let native_period = core.frame_duration();
    let sink = Arc::new(VideoSink::new(core.video_format()).map_err(|e| e.to_string())?);
    let config = SessionConfig {
        rate: args.rate,
        realtime_priority: args.realtime_priority,
        ..SessionConfig::default()
    };
    let session = EmulationSession::new(config, CoreHandle::new(core), Arc::downgrade(&sink))
        .map_err(|e| e.to_string())?;
    let mut consumer = session
        .take_audio_consumer()
        .ok_or_else(|| "audio consumer already taken".to_string())?;

    // Drain at roughly the device cadence: everything available, every millisecond.
    let draining = Arc::new(AtomicBool::new(true));
    let drain_flag = Arc::clone(&draining);
    let drain = std::thread::spawn(move || {
        let mut scratch = vec![0u8; consumer.ring().capacity()];
        let mut total = 0usize;
        while drain_flag.load(Ordering::Relaxed) {
            let len = scratch.len();
            total += consumer.read_into(&mut scratch, len);
            std::thread::sleep(Duration::from_millis(1));
        }
        total
    });

    let mut timing_rx = session.subscribe_timing();
    let started = Instant::now();
    session.start().map_err(|e| e.to_string())?;

    let mut lateness = Vec::with_capacity(args.frames as usize);
    let mut lagged = 0u64;
    while (lateness.len() as u64) < args.frames {
        match timing_rx.blocking_recv() {
            Ok(event) => lateness.push(event.lateness_us as f64),
            Err(RecvError::Lagged(n)) => lagged += n,
            Err(RecvError::Closed) => break,
        }
    }

    let wall_time = started.elapsed();
    let priority = session
        .last_priority()
        .map(|p| format!("{p:?}").to_lowercase())
        .unwrap_or_else(|| "unknown".into());
    session.stop().map_err(|e| e.to_string())?;
    draining.store(false, Ordering::Relaxed);
    let bytes_read = drain
        .join()
        .map_err(|_| "drain thread panicked".to_string())?;

    let diag = session.diagnostics_snapshot();
    let period = native_period.div_f64(args.rate);

    let summary = Summary {
        frames: args.frames,
        rate: args.rate,
        period_us: period.as_micros() as u64,
        priority,
        wall_time_ms: wall_time.as_secs_f64() * 1000.0,
        p50_lateness_us: percentile(&lateness, 0.50),
        p95_lateness_us: percentile(&lateness, 0.95),
        max_lateness_us: lateness.iter().copied().fold(0.0, f64::max),
        overruns: diag.overruns,
        frames_rendered: diag.frames_rendered,
        timing_events_lagged: lagged,
        bytes_written: diag.audio_bytes_written,
        bytes_read,
        bytes_dropped: diag.audio_bytes_dropped,
    };

    eprintln!(
        "pacing: frames={} p50={:.0}us p95={:.0}us max={:.0}us overruns={}",
        summary.frames,
        summary.p50_lateness_us,
        summary.p95_lateness_us,
        summary.max_lateness_us,
        summary.overruns
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote pacing report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
