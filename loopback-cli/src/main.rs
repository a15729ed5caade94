//! `loopback`: play the default input device through the default output
//! device until Ctrl+C.

mod args;
mod settings;

use std::time::Duration;

use anyhow::Context;
use loopback_core::{
    audio::{list_devices, CpalBackend, DeviceInfo, SineSource, SyntheticBackend},
    AudioBackend, DiagnosticsSnapshot, DuplexEngine, LoopbackError,
};
use tracing::{debug, error, info, warn};

use args::{parse_args, CliArgs, USAGE};
use settings::LoopbackSettings;

/// Usage or configuration error (sysexits `EX_USAGE`).
const EXIT_USAGE: i32 = 64;
/// A running stream could not be restarted (sysexits `EX_SOFTWARE`).
const EXIT_STREAM_FAULT: i32 = 70;

const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);
/// Supervisor ticks between periodic counter logs.
const STATS_LOG_TICKS: u32 = 50;

fn main() {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loopback=info,loopback_core=info")),
        )
        .init();

    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}\n\n{USAGE}");
            return EXIT_USAGE;
        }
    };
    if args.help {
        println!("{USAGE}");
        return 0;
    }

    let (settings, settings_path) = match settings::resolve(&args) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("loopback: {e}");
            return EXIT_USAGE;
        }
    };
    info!(
        settings_path = ?settings_path,
        backend = %settings.backend,
        sample_rate = settings.sample_rate,
        block_size = settings.block_size,
        capacity = settings.buffer_capacity_frames,
        "settings loaded"
    );

    if args.list_devices {
        print_devices(settings.sample_rate);
        return 0;
    }

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("loopback: {e:#}");
            return 1;
        }
    };

    // The engine holds platform streams that must stay on this thread, so
    // everything runs on a current-thread runtime.
    let (snapshot, outcome) = match settings.backend.as_str() {
        "synthetic" => {
            let source = SineSource::new(
                settings.synthetic_tone_hz,
                settings.sample_rate,
                settings.synthetic_amplitude,
            );
            let backend = SyntheticBackend::new(source).discard_playback();
            runtime.block_on(run(backend, &settings, &args))
        }
        _ => runtime.block_on(run(CpalBackend::new(), &settings, &args)),
    };

    if args.stats_json {
        match stats_json(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("{e:#}"),
        }
    }

    match outcome {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("loopback: {e}");
            exit_code(&e)
        }
    }
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")
}

fn stats_json(snapshot: &DiagnosticsSnapshot) -> anyhow::Result<String> {
    serde_json::to_string_pretty(snapshot).context("failed to serialise diagnostics")
}

/// Run the engine until Ctrl+C, `--duration` or an unrecoverable fault.
async fn run<B: AudioBackend>(
    backend: B,
    settings: &LoopbackSettings,
    args: &CliArgs,
) -> (DiagnosticsSnapshot, Result<(), LoopbackError>) {
    let mut engine = DuplexEngine::new(backend, settings.engine_config());
    let mut status = engine.subscribe_status();

    if let Err(e) = engine.start(&settings.duplex_config()) {
        error!(error = %e, "failed to start loopback");
        return (engine.diagnostics_snapshot(), Err(e));
    }
    for stream in engine.negotiated() {
        info!(
            direction = %stream.direction,
            device = %stream.device_name,
            sample_rate = stream.sample_rate,
            block_size = ?stream.block_size,
            "stream open"
        );
    }
    info!(backend = %engine.backend().name(), "loopback running, Ctrl+C to stop");

    let deadline = args.duration.map(|d| tokio::time::Instant::now() + d);
    let elapsed = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(elapsed);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = tokio::time::interval(SUPERVISE_INTERVAL);
    let mut ticks = 0u32;
    let mut last = engine.diagnostics_snapshot();

    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received, stopping");
                break Ok(());
            }
            _ = &mut elapsed => {
                info!("duration elapsed, stopping");
                break Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = engine.supervise() {
                    break Err(e);
                }
                while let Ok(event) = status.try_recv() {
                    debug!(seq = event.seq, state = ?event.state, detail = ?event.detail, "engine status");
                }
                ticks += 1;
                if ticks % STATS_LOG_TICKS == 0 {
                    let now = engine.diagnostics_snapshot();
                    let delta = now.since(&last);
                    info!(
                        ring_fill = ?engine.ring_fill(),
                        frames_played = delta.frames_played,
                        underruns = delta.underrun_events,
                        overruns = delta.overrun_events,
                        transient_faults = delta.transient_faults,
                        restarts = delta.restarts,
                        "loopback stats"
                    );
                    last = now;
                }
            }
        }
    };

    engine.stop();
    (engine.diagnostics_snapshot(), outcome)
}

fn exit_code(err: &LoopbackError) -> i32 {
    match err {
        LoopbackError::StreamInit(e) => e.code.clamp(1, 255),
        LoopbackError::StreamFault { .. } => EXIT_STREAM_FAULT,
        LoopbackError::InvalidConfig(_) | LoopbackError::Io(_) => EXIT_USAGE,
        LoopbackError::AlreadyRunning | LoopbackError::Other(_) => 1,
    }
}

fn print_devices(sample_rate: u32) {
    let devices = list_devices(sample_rate);
    let name = |d: Option<&DeviceInfo>| d.map_or("(none)".to_string(), |d| d.name.clone());
    println!("Default input:  {}", name(devices.default_input()));
    println!("Default output: {}", name(devices.default_output()));

    for (title, list) in [("Inputs", &devices.inputs), ("Outputs", &devices.outputs)] {
        println!("\n{title}:");
        if list.is_empty() {
            println!("  (none)");
        }
        for device in list {
            let rate = device
                .default_sample_rate
                .map_or("?".to_string(), |r| r.to_string());
            let channels = device
                .default_channels
                .map_or("?".to_string(), |c| c.to_string());
            println!(
                "  {} {}  ({rate} Hz, {channels} ch, f32 @ {sample_rate} Hz: {}){}",
                if device.is_default { "*" } else { " " },
                device.name,
                if device.supports_f32_at_rate { "yes" } else { "no" },
                if device.is_monitor_like { " [monitors output]" } else { "" },
            );
        }
    }
}
