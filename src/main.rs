//! Command-line entry point: runs one Huntmaster session end to end.
//!
//! # Sequence
//!
//! 1. Initialise logging.
//! 2. Load [`PipelineConfig`] from disk (defaults on first run).
//! 3. Create the [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Construct and initialize the [`Orchestrator`].
//! 5. Load the elk bugle master call and queue it for playback.
//! 6. Start a session and a recording, then feed a synthetic bugle through
//!    the scripted capture input from a feeder thread while the run loop
//!    pumps frames.
//! 7. Stop, enhance and export the recording as 16-bit WAV.
//! 8. Print the system state and clean up.

use std::f32::consts::PI;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;

use huntmaster_pipeline::config::{AppPaths, PipelineConfig};
use huntmaster_pipeline::modules::AudioFormat;
use huntmaster_pipeline::pipeline::Orchestrator;

/// Length of each block handed to the capture input.
const CHUNK: usize = 960;

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Huntmaster pipeline starting up");

    // 2. Configuration
    let config = PipelineConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        PipelineConfig::default()
    });
    let overrides = serde_json::to_value(&config).context("serializing configuration")?;

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(run_session(overrides, config.sample_rate))
}

async fn run_session(overrides: serde_json::Value, sample_rate: u32) -> anyhow::Result<()> {
    // 4. Orchestrator
    let mut orch = Orchestrator::new(Some(overrides))?;
    orch.initialize().await?;
    log::info!("Modules: {}", orch.loaded_modules().join(", "));

    // 5. Master call
    for call in orch.master_call_library()? {
        log::info!("  master call `{}`: {} ({:.1}s)", call.id, call.name, call.duration_secs);
    }
    match orch.play_master_call(Some("elk-bugle")) {
        Ok(queued) => {
            // no output device in the demo; drain what a player would consume
            let played = orch.take_playback(queued)?;
            log::info!("Played {} of {queued} queued master call samples", played.len());
        }
        Err(e) => log::warn!("Master call unavailable: {e}"),
    }

    // 6. Session
    let session_id = orch.start_processing()?;
    let recording_id = orch.start_recording()?;
    log::info!("Session {session_id}, recording {recording_id}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let input = orch.capture_input();
    let channels = orch.config().channels;
    let feeder = std::thread::Builder::new()
        .name("demo-feeder".into())
        .spawn(move || {
            let samples = synthetic_bugle(sample_rate, channels, 2.0);
            for chunk in samples.chunks(CHUNK * channels as usize) {
                input.push_samples(chunk);
                std::thread::sleep(Duration::from_millis(5));
            }
            // let the run loop drain the tail
            std::thread::sleep(Duration::from_millis(100));
            let _ = shutdown_tx.send(true);
        })
        .context("failed to spawn feeder thread")?;

    orch.run(shutdown_rx).await?;
    if feeder.join().is_err() {
        log::warn!("Feeder thread panicked");
    }

    // 7. Stop and export
    let stop = orch.stop_processing()?;
    if let Some(session) = &stop.session {
        log::info!(
            "Session finished: {} frames processed, {} dropped, degraded: {}",
            session.frames_processed,
            session.frames_dropped,
            stop.degraded
        );
    }
    let enhanced = orch.enhance_recording(&recording_id, None)?;
    for warning in &enhanced.warnings {
        log::warn!("Recording: {warning}");
    }
    let wav = orch.export_recording(&recording_id, AudioFormat::WavPcm16)?;
    let dir = AppPaths::new().recordings_dir;
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{recording_id}.{}", wav.format.extension()));
    std::fs::write(&path, &wav.bytes).with_context(|| format!("writing {}", path.display()))?;
    log::info!("Exported {:.2}s recording to {}", enhanced.duration_secs, path.display());

    // 8. State
    println!("{}", serde_json::to_string_pretty(&orch.system_state())?);
    orch.cleanup();
    Ok(())
}

/// Rising then falling whistle with a soft envelope, roughly bugle shaped.
fn synthetic_bugle(sample_rate: u32, channels: u16, secs: f32) -> Vec<f32> {
    let len = (sample_rate as f32 * secs) as usize;
    let mut phase = 0.0_f32;
    let mut out = Vec::with_capacity(len * channels as usize);
    for i in 0..len {
        let t = i as f32 / len as f32;
        let freq = 700.0 + 1_100.0 * (PI * t).sin();
        phase += 2.0 * PI * freq / sample_rate as f32;
        let sample = 0.5 * (PI * t).sin() * phase.sin();
        out.extend(std::iter::repeat(sample).take(channels as usize));
    }
    out
}
