pub mod audio;
pub mod commands;
pub mod error;
pub mod persistence;
pub mod state;

pub use audio::{AudioBuffer, AudioDevice, DeviceState, PlaybackSession, PlayerSlot, SimulatedDevice};
pub use error::PlaybackError;
pub use state::{PlaybackSettings, PlaybackState, Settings};

use anyhow::Result;
use clap::Parser;
use commands::{Cli, Command};
use tracing_subscriber::EnvFilter;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = match &cli.config {
        Some(path) => path.clone(),
        None => persistence::default_settings_path()?,
    };
    let settings = persistence::load_settings(&settings_path);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.general.log_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Read Aloud v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Settings loaded from {}", settings_path.display());

    match &cli.command {
        Command::Play(args) => commands::play::do_play(&settings, args).await,
        Command::Inspect { file } => commands::inspect::do_inspect(&settings, file),
        Command::Config { write_default } => {
            commands::config::do_config(&settings, &settings_path, *write_default)
        }
    }
}
