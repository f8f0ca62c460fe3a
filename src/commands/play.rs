use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::{Result, Context};
use clap::Args;
use tokio::sync::Notify;

use crate::audio::device::{self, AudioDevice, SimulatedDevice};
use crate::audio::playback::PlaybackSession;
use crate::audio::timeline::format_time;
use crate::state::Settings;

#[derive(Args, Debug)]
pub struct PlayArgs {
    /// File containing the base64 payload
    pub file: PathBuf,

    /// Start position in seconds
    #[arg(long)]
    pub seek: Option<f64>,

    /// Linear volume in [0, 1]
    #[arg(long)]
    pub volume: Option<f32>,

    /// Run against a silent, clock-accurate device instead of the sound card
    #[arg(long)]
    pub null_output: bool,

    /// Print playback events as JSON lines on stdout
    #[arg(long)]
    pub json: bool,
}

/// Internal: load the payload, play it to the end (or Ctrl-C), then close the session
pub async fn do_play(settings: &Settings, args: &PlayArgs) -> Result<()> {
    let payload = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read payload file {}", args.file.display()))?;

    let device: Arc<dyn AudioDevice> = if args.null_output {
        Arc::new(SimulatedDevice::new())
    } else {
        device::open_default_device(&settings.playback)
            .context("Failed to open audio output")?
    };

    let session = PlaybackSession::create(&payload, device, &settings.playback)
        .await
        .context("Failed to load speech payload")?;

    let finished = Arc::new(Notify::new());
    wire_events(&session, args.json, Arc::clone(&finished));

    if let Some(volume) = args.volume {
        session.set_volume(volume);
    }
    if let Some(seconds) = args.seek {
        session.seek(seconds);
    }

    session.play().await.context("Failed to start playback")?;

    tokio::select! {
        _ = finished.notified() => {
            tracing::info!("Playback finished");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted at {}", format_time(session.position()));
        }
    }

    session.close();
    Ok(())
}

fn wire_events(session: &PlaybackSession, json: bool, finished: Arc<Notify>) {
    session.on_state_change(move |state| {
        if json {
            println!("{}", serde_json::json!({"event": "state", "state": state}));
        } else {
            tracing::info!("Playback {}", state);
        }
    });

    // Only report whole-second changes in human mode
    let last_second = AtomicU64::new(u64::MAX);
    session.on_progress(move |position, duration| {
        if json {
            println!("{}", serde_json::json!({
                "event": "progress",
                "position": position,
                "duration": duration,
            }));
        } else if last_second.swap(position as u64, Ordering::Relaxed) != position as u64 {
            tracing::info!("{} / {}", format_time(position), format_time(duration));
        }
    });

    session.on_ended(move || {
        if json {
            println!("{}", serde_json::json!({"event": "ended"}));
        }
        finished.notify_one();
    });
}
