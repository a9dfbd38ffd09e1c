//! KikuMoe: a LISTEN.moe radio player for the terminal.
//!
//! Streams J-POP or K-POP through an external `ffmpeg` decoder (or the native
//! Symphonia engine) to a CPAL output device, and prints now-playing updates
//! from the gateway WebSocket.
//!
//! ## Commands
//! - `play`: play a channel, controlled by single-letter commands on stdin.
//! - `devices`: list output devices and their indices.
//! - `now-playing`: follow the feed without audio.

use anyhow::Result;
use clap::Parser;
use kikumoe::{cli, config, runtime};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,kikumoe=info,kiku_player=info,kiku_feed=info")
        }))
        .init();

    let cfg = config::AppConfig::resolve(args.config.as_deref())?;
    match args.cmd {
        cli::Command::Play(play) => runtime::run_play(config::resolve_play(&cfg, &play)),
        cli::Command::Devices => runtime::list_devices(),
        cli::Command::NowPlaying { channel } => {
            let channel = channel.or(cfg.stream.channel).unwrap_or_default();
            runtime::run_now_playing(cfg.feed_config(channel), cfg.track_filter())
        }
    }
}
