use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kiku_player::Backend;
use kiku_types::{Channel, StreamFormat};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "kikumoe", version = VERSION, about = "LISTEN.moe radio player")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Config file (TOML). Defaults to config.toml next to the executable when present
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a channel; control it with single-letter commands on stdin
    Play(PlayArgs),

    /// List output devices with their indices
    Devices,

    /// Print track changes from the now-playing feed without audio
    NowPlaying {
        /// J-POP or K-POP
        #[arg(long)]
        channel: Option<Channel>,
    },
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct PlayArgs {
    /// J-POP or K-POP
    #[arg(long)]
    pub channel: Option<Channel>,

    /// Stream encoding: vorbis or mp3
    #[arg(long)]
    pub format: Option<StreamFormat>,

    /// Play this URL instead of the channel stream
    #[arg(long)]
    pub url: Option<String>,

    /// Decoder: ffmpeg (external process) or native (in-process)
    #[arg(long)]
    pub backend: Option<Backend>,

    /// ffmpeg executable to run
    #[arg(long)]
    pub decoder: Option<String>,

    /// Output device index as printed by `devices`
    #[arg(long)]
    pub device_index: Option<usize>,

    /// Initial volume (0-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub volume: Option<u8>,

    /// Start muted
    #[arg(long)]
    pub mute: bool,

    /// Do not connect to the now-playing feed
    #[arg(long)]
    pub no_feed: bool,
}
