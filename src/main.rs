//! soundbath - headless guided-relaxation session runner

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use soundbath::timer::{format_clock, PRESET_MINUTES};
use soundbath::track::catalog;
use soundbath::{
    AudioBackend, CpalBackend, EngineConfig, EngineEvent, OfflineBackend, SessionEngine,
    SessionError, Slot, Track, VolumeSlot, Waveform,
};

/// How often the session loop services the engine
const TICK: Duration = Duration::from_millis(50);

/// Play a relaxation session: music bed, binaural beat and an optional
/// looped voice mantra
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Music track id (see --list)
    #[arg(long)]
    music: Option<String>,

    /// Binaural track id (see --list)
    #[arg(long)]
    binaural: Option<String>,

    /// Session length in minutes
    #[arg(long, default_value_t = 15)]
    minutes: u64,

    #[arg(long)]
    music_volume: Option<f32>,

    #[arg(long)]
    binaural_volume: Option<f32>,

    #[arg(long)]
    recording_volume: Option<f32>,

    /// Binaural tone shape: sine, square, saw or triangle
    #[arg(long, default_value = "sine")]
    waveform: Waveform,

    /// Record a mantra for this many seconds first, then loop it
    #[arg(long)]
    record_seconds: Option<f32>,

    /// Print the track catalog and exit
    #[arg(long)]
    list: bool,

    /// Render without audio hardware
    #[arg(long)]
    offline: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if args.list {
        print_catalog();
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("soundbath: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_catalog() {
    println!("Music:");
    for track in catalog::music_tracks() {
        println!("  {:<14} {}", track.id, track.name);
    }
    println!("Binaural:");
    for track in catalog::binaural_tracks() {
        println!(
            "  {:<14} {} ({:.1} Hz)",
            track.id,
            track.name,
            track.frequency.unwrap_or_default()
        );
    }
    println!(
        "Session lengths (minutes): {}",
        PRESET_MINUTES.map(|m| m.to_string()).join(", ")
    );
}

fn lookup(id: &str) -> Option<Track> {
    let track = catalog::find(id);
    if track.is_none() {
        log::warn!("Unknown track '{}', see --list", id);
    }
    track
}

fn run(args: Args) -> Result<(), SessionError> {
    let config = match &args.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load(),
    };

    if !PRESET_MINUTES.contains(&args.minutes) {
        log::warn!("{} minutes is not one of the presets, using it anyway", args.minutes);
    }

    let offline = args.offline.then(|| OfflineBackend::new(48_000));
    let backend: Box<dyn AudioBackend> = match &offline {
        Some(backend) => Box::new(backend.clone()),
        None => {
            log::info!("Output devices: {:?}", CpalBackend::output_device_names());
            Box::new(CpalBackend::new())
        }
    };

    let mut engine = SessionEngine::new(config, backend);
    engine.on_event(|event| match event {
        EngineEvent::TrackReady { slot, track_id } => log::info!("{} ready: {}", slot, track_id),
        EngineEvent::TrackLoadFailed { slot, track_id, error } => {
            log::error!("{} track '{}' failed: {}", slot, track_id, error)
        }
        EngineEvent::RecordingComplete(buffer) => log::info!(
            "Mantra recorded ({:.1}s)",
            buffer.duration().as_secs_f32()
        ),
        EngineEvent::RecordingFailed(error) => log::error!("Recording failed: {}", error),
    });

    engine.set_binaural_waveform(args.waveform);

    let volumes = [
        (VolumeSlot::Music, args.music_volume),
        (VolumeSlot::Binaural, args.binaural_volume),
        (VolumeSlot::Recording, args.recording_volume),
    ];
    for (slot, volume) in volumes {
        if let Some(v) = volume {
            engine.set_volume(slot, v);
        }
    }
    if let Some(track) = args.music.as_deref().and_then(lookup) {
        engine.set_track(Slot::Music, track);
    }
    if let Some(track) = args.binaural.as_deref().and_then(lookup) {
        engine.set_track(Slot::Binaural, track);
    }

    if let Some(seconds) = args.record_seconds {
        record_mantra(&mut engine, offline.as_ref(), seconds)?;
    }

    engine.set_session_length(Duration::from_secs(args.minutes * 60));
    engine.start()?;
    engine.settle();
    if engine.has_recording() {
        engine.play_voice(true);
    }

    log::info!(
        "Session running for {} ({} node(s) live)",
        format_clock(engine.timer().duration()),
        engine.live_node_count()
    );

    let mut last_report = Instant::now();
    let mut peak = 0.0f32;
    while !engine.timer().is_finished() {
        engine.tick();
        if let Some(backend) = &offline {
            let frames = (48_000.0 * TICK.as_secs_f32()) as usize;
            let out = backend.render_frames(frames);
            peak = out.iter().fold(peak, |p, s| p.max(s.abs()));
        }
        if last_report.elapsed() >= Duration::from_secs(60) {
            log::info!("{} remaining", format_clock(engine.timer().remaining()));
            last_report = Instant::now();
        }
        thread::sleep(TICK);
    }

    engine.stop();
    if offline.is_some() {
        log::info!("Offline render peak level: {:.3}", peak);
    }
    engine.dispose();
    log::info!("Session complete");
    Ok(())
}

/// Record from the microphone before the session starts
fn record_mantra(
    engine: &mut SessionEngine,
    offline: Option<&OfflineBackend>,
    seconds: f32,
) -> Result<(), SessionError> {
    engine.record_voice()?;
    println!("Recording for {:.0}s...", seconds);

    let until = Instant::now() + Duration::try_from_secs_f32(seconds.max(0.0)).unwrap_or_default();
    let mut phase = 0.0f32;
    while Instant::now() < until {
        if let Some(backend) = offline {
            // No microphone offline: feed a quiet hum instead
            let hum: Vec<f32> = (0..(48_000.0 * TICK.as_secs_f32()) as usize)
                .map(|_| {
                    phase = (phase + 110.0 / 48_000.0).fract();
                    (phase * std::f32::consts::TAU).sin() * 0.1
                })
                .collect();
            backend.push_capture(&hum);
        }
        engine.tick();
        thread::sleep(TICK);
    }

    engine.stop_recording_voice()?;
    Ok(())
}
