//! Stream Player: plays local files, HTTP streams and playlists through the streaming engine.
//!
//! ## Pipeline
//! 1. **Input**: a reader thread detects the container and splits it into encoded packets.
//! 2. **Decode**: a decoder thread turns packets into `f32` PCM and trims encoder padding.
//! 3. **Output**: an output thread feeds the device, resampling when the device rate differs.
//!
//! ## Modes
//! - `play`: play one or more inputs back to back (playlists are expanded).
//! - `probe`: print the detected stream header as JSON.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stream_player::cli::{self, Command};
use stream_player::runtime;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,stream_player=info,audio_engine=info")
        }))
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }

    match args.cmd.as_ref() {
        Some(Command::Play { inputs }) => runtime::run_play(args.play_config(inputs.clone()), true),
        Some(Command::Probe { input }) => runtime::run_probe(args.probe_config(input.clone())),
        None => {
            tracing::error!("nothing to do; pass a subcommand or --list-devices");
            std::process::exit(2);
        }
    }
}
