//! Runtime wiring for the CLI.
//!
//! Builds the controller and feed client from resolved settings, then runs a
//! single event loop over player events, feed events and stdin commands.

use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, select};
use kiku_feed::display::{now_epoch, now_playing_line};
use kiku_feed::{FeedConfig, FeedEvent, NowPlayingClient, TrackFilter};
use kiku_player::decoder::{DecoderBackend, FfmpegBackend};
use kiku_player::native::NativeBackend;
use kiku_player::output::CpalOpener;
use kiku_player::{Backend, PlaybackController, device};
use kiku_types::{Channel, PlayerEvent};

use crate::config::PlaySettings;

const IDLE_TICK: Duration = Duration::from_millis(200);
const VOLUME_STEP: u8 = 5;

const HELP: &str = "commands: p pause/resume | s stop | r replay | m mute | + / - volume | v N set volume | c switch channel | i status | q quit";

/// A line typed on stdin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserCommand {
    PauseToggle,
    Stop,
    Replay,
    MuteToggle,
    VolumeUp,
    VolumeDown,
    SetVolume(u8),
    SwitchChannel,
    Status,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Option<UserCommand> {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let cmd = match cmd.to_ascii_lowercase().as_str() {
        "p" | "pause" => UserCommand::PauseToggle,
        "s" | "stop" => UserCommand::Stop,
        "r" | "replay" | "play" => UserCommand::Replay,
        "m" | "mute" => UserCommand::MuteToggle,
        "+" => UserCommand::VolumeUp,
        "-" => UserCommand::VolumeDown,
        "v" | "vol" | "volume" => {
            let value: u32 = parts.next()?.parse().ok()?;
            UserCommand::SetVolume(value.min(100) as u8)
        }
        "c" | "channel" => UserCommand::SwitchChannel,
        "i" | "status" => UserCommand::Status,
        "h" | "help" | "?" => UserCommand::Help,
        "q" | "quit" | "exit" => UserCommand::Quit,
        _ => return None,
    };
    Some(cmd)
}

/// Replays the stream a short while after it errors or ends.
///
/// An explicit stop cancels any pending replay.
#[derive(Debug)]
pub struct RetryPolicy {
    delay: Duration,
    due: Option<Instant>,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay, due: None }
    }

    pub fn observe(&mut self, event: PlayerEvent, now: Instant) {
        match event {
            PlayerEvent::Error | PlayerEvent::Ended => {
                if self.due.is_none() {
                    self.due = Some(now + self.delay);
                }
            }
            PlayerEvent::Stopped | PlayerEvent::Playing => self.due = None,
            _ => {}
        }
    }

    pub fn cancel(&mut self) {
        self.due = None;
    }

    pub fn is_pending(&self) -> bool {
        self.due.is_some()
    }

    /// Time until the replay is due, if one is pending.
    pub fn wait(&self, now: Instant) -> Option<Duration> {
        self.due.map(|due| due.saturating_duration_since(now))
    }

    /// Consume the pending replay if its time has come.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                true
            }
            _ => false,
        }
    }
}

/// List output devices and print them to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let devices = device::list_device_infos(&host)?;
    if devices.is_empty() {
        println!("no output devices found");
        return Ok(());
    }
    for d in devices {
        let rates = match (d.min_rate, d.max_rate) {
            (Some(lo), Some(hi)) if lo == hi => format!("{lo} Hz"),
            (Some(lo), Some(hi)) => format!("{lo}-{hi} Hz"),
            _ => "rates unknown".to_string(),
        };
        let marker = if d.is_default { " (default)" } else { "" };
        println!("{:>3}  {}{}  [{}]", d.index, d.name, marker, rates);
    }
    Ok(())
}

fn install_quit_handler(tx: Sender<UserCommand>) {
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(UserCommand::Quit);
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }
}

fn print_track(event: FeedEvent) {
    match event {
        FeedEvent::NowPlaying(track) => println!("♪ {}", now_playing_line(&track, now_epoch())),
        FeedEvent::Error(text) => tracing::warn!("now-playing feed error: {text}"),
        FeedEvent::Closed(_) => tracing::debug!("now-playing feed closed"),
    }
}

/// Print feed updates until Ctrl-C.
pub fn run_now_playing(config: FeedConfig, filter: Option<TrackFilter>) -> Result<()> {
    let (quit_tx, quit_rx) = crossbeam_channel::bounded::<UserCommand>(1);
    install_quit_handler(quit_tx);

    let (feed_tx, feed_rx) = crossbeam_channel::unbounded::<FeedEvent>();
    tracing::info!(url = %config.url, "following now-playing feed");
    let mut client = NowPlayingClient::start(config, Arc::new(feed_tx), filter)?;

    loop {
        select! {
            recv(feed_rx) -> event => match event {
                Ok(event) => print_track(event),
                Err(_) => break,
            },
            recv(quit_rx) -> _ => break,
        }
    }
    client.shutdown();
    Ok(())
}

fn build_backend(settings: &PlaySettings) -> Arc<dyn DecoderBackend> {
    match settings.backend {
        Backend::Ffmpeg => Arc::new(FfmpegBackend::new(settings.player.decoder_binary.clone())),
        Backend::Native => Arc::new(NativeBackend::default()),
    }
}

fn spawn_stdin_reader(tx: Sender<UserCommand>) -> Result<()> {
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Some(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    None => println!("{HELP}"),
                }
            }
            tracing::debug!("stdin closed");
        })
        .context("spawn stdin reader")?;
    Ok(())
}

struct Station {
    controller: PlaybackController,
    channel: Channel,
    url: String,
    settings: PlaySettings,
    feed: Option<NowPlayingClient>,
    feed_tx: Sender<FeedEvent>,
    retry: RetryPolicy,
}

impl Station {
    fn start_feed(&mut self) {
        let Some(base) = self.settings.feed.as_ref() else {
            return;
        };
        if let Some(mut old) = self.feed.take() {
            old.shutdown();
        }
        let mut config = FeedConfig::for_channel(self.channel);
        config.reconnect_delay = base.reconnect_delay;
        if self.settings.url_override.is_none() && self.channel == self.settings.channel {
            config.url = base.url.clone();
        }
        let filter = self.settings.track_filter();
        match NowPlayingClient::start(config, Arc::new(self.feed_tx.clone()), filter) {
            Ok(client) => self.feed = Some(client),
            Err(e) => tracing::warn!("now-playing feed unavailable: {e:#}"),
        }
    }

    fn play(&mut self) {
        println!("▶ {} {} ({})", self.channel, self.settings.format, self.url);
        if !self.controller.play(&self.url) {
            tracing::error!(url = %self.url, "playback did not start");
        }
    }

    /// Apply one command. Returns `false` to quit.
    fn handle(&mut self, cmd: UserCommand) -> bool {
        match cmd {
            UserCommand::PauseToggle => match self.controller.pause_toggle() {
                Some(_) => {}
                None => println!("nothing is playing"),
            },
            UserCommand::Stop => {
                self.retry.cancel();
                self.controller.stop();
            }
            UserCommand::Replay => {
                self.retry.cancel();
                self.play();
            }
            UserCommand::MuteToggle => {
                let muted = !self.controller.is_muted();
                self.controller.set_mute(muted);
                println!("{}", if muted { "muted" } else { "unmuted" });
            }
            UserCommand::VolumeUp => {
                let v = self.controller.volume().saturating_add(VOLUME_STEP).min(100);
                self.set_volume(v);
            }
            UserCommand::VolumeDown => {
                let v = self.controller.volume().saturating_sub(VOLUME_STEP);
                self.set_volume(v);
            }
            UserCommand::SetVolume(v) => self.set_volume(v),
            UserCommand::SwitchChannel => {
                self.channel = self.channel.toggled();
                self.url = self.channel.stream_url(self.settings.format).to_string();
                self.retry.cancel();
                self.play();
                self.start_feed();
            }
            UserCommand::Status => {
                let s = self.controller.status();
                println!(
                    "url={} playing={} paused={} volume={} muted={} last={}",
                    s.current_url.as_deref().unwrap_or("-"),
                    s.playing,
                    s.paused,
                    s.volume,
                    s.muted,
                    s.last_event.map(|e| e.to_string()).unwrap_or_else(|| "-".into()),
                );
            }
            UserCommand::Help => println!("{HELP}"),
            UserCommand::Quit => return false,
        }
        true
    }

    fn set_volume(&self, volume: u8) {
        self.controller.set_volume(volume);
        println!("volume {}", self.controller.volume());
    }

    fn shutdown(&mut self) {
        self.retry.cancel();
        self.controller.stop();
        if let Some(mut feed) = self.feed.take() {
            feed.shutdown();
        }
    }
}

/// Play until the user quits.
pub fn run_play(settings: PlaySettings) -> Result<()> {
    let (event_tx, event_rx) = crossbeam_channel::unbounded::<PlayerEvent>();
    let (feed_tx, feed_rx) = crossbeam_channel::unbounded::<FeedEvent>();
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<UserCommand>();

    let backend = build_backend(&settings);
    tracing::info!(backend = backend.name(), device = ?settings.player.device_index, "starting player");
    let opener = Arc::new(CpalOpener {
        buffer_seconds: settings.player.buffer_seconds,
    });
    let controller =
        PlaybackController::new(settings.player.clone(), backend, opener, Arc::new(event_tx));
    controller.set_volume(settings.volume);
    controller.set_mute(settings.muted);

    install_quit_handler(cmd_tx.clone());
    spawn_stdin_reader(cmd_tx)?;

    let mut station = Station {
        controller,
        channel: settings.channel,
        url: settings.stream_url(),
        retry: RetryPolicy::new(settings.retry_delay),
        settings,
        feed: None,
        feed_tx,
    };
    println!("{HELP}");
    station.start_feed();
    station.play();

    event_loop(&mut station, &event_rx, &feed_rx, &cmd_rx);
    station.shutdown();
    Ok(())
}

fn event_loop(
    station: &mut Station,
    event_rx: &Receiver<PlayerEvent>,
    feed_rx: &Receiver<FeedEvent>,
    cmd_rx: &Receiver<UserCommand>,
) {
    let closed = crossbeam_channel::never::<UserCommand>();
    let mut stdin_open = true;
    loop {
        let tick = station
            .retry
            .wait(Instant::now())
            .map_or(IDLE_TICK, |w| w.min(IDLE_TICK));
        select! {
            recv(event_rx) -> event => {
                if let Ok(event) = event {
                    println!("[{event}]");
                    station.retry.observe(event, Instant::now());
                    if station.retry.is_pending() && event.is_terminal() {
                        tracing::info!(
                            delay_ms = station.settings.retry_delay.as_millis() as u64,
                            "scheduling replay"
                        );
                    }
                }
            }
            recv(feed_rx) -> event => {
                if let Ok(event) = event {
                    print_track(event);
                }
            }
            recv(if stdin_open { cmd_rx } else { &closed }) -> cmd => match cmd {
                Ok(cmd) => {
                    if !station.handle(cmd) {
                        return;
                    }
                }
                Err(_) => stdin_open = false,
            },
            default(tick) => {}
        }
        if station.retry.take_due(Instant::now()) {
            tracing::info!(url = %station.url, "replaying stream");
            station.play();
        }
    }
}
