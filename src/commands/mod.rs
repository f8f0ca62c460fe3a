pub mod config;
pub mod inspect;
pub mod play;

use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "read-aloud")]
#[command(about = "Play back synthesized speech with seek, pause and volume control")]
#[command(version)]
pub struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(short, long, global = true, env = "READ_ALOUD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a base64 speech payload until it ends
    Play(play::PlayArgs),
    /// Decode a payload and print its format
    Inspect {
        /// File containing the base64 payload
        file: PathBuf,
    },
    /// Show the effective settings
    Config {
        /// Write the default settings to the settings file
        #[arg(long)]
        write_default: bool,
    },
}
