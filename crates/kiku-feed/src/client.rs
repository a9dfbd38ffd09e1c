//! Now-playing WebSocket client.
//!
//! One background thread owns the socket: it connects, heartbeats, parses
//! track updates and reconnects after a fixed delay until shut down.

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use kiku_types::{Channel, NowPlayingTrack};
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::protocol::{GatewayMessage, TrackFilter, heartbeat_payload, parse_message, parse_track, passes_filter};

/// Connection settings for [`NowPlayingClient`].
#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub url: String,
    /// Wait between a closed connection and the next attempt.
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// Socket read timeout; bounds how late heartbeats and shutdown are noticed.
    pub poll_interval: Duration,
    /// Bound on joining the client thread in [`NowPlayingClient::shutdown`].
    pub shutdown_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::for_channel(Channel::default())
    }
}

impl FeedConfig {
    pub fn for_channel(channel: Channel) -> Self {
        Self {
            url: channel.gateway_url().to_string(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// Receives feed callbacks on the client thread.
pub trait FeedListener: Send + Sync {
    fn on_now_playing(&self, track: NowPlayingTrack);
    fn on_error_text(&self, text: &str);
    /// Called whenever a connection ends, with the close reason if the server gave one.
    fn on_closed_text(&self, text: &str);
}

/// Feed callbacks as values, for channel-based consumers.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    NowPlaying(NowPlayingTrack),
    Error(String),
    Closed(String),
}

impl FeedListener for Sender<FeedEvent> {
    fn on_now_playing(&self, track: NowPlayingTrack) {
        let _ = self.send(FeedEvent::NowPlaying(track));
    }

    fn on_error_text(&self, text: &str) {
        let _ = self.send(FeedEvent::Error(text.to_string()));
    }

    fn on_closed_text(&self, text: &str) {
        let _ = self.send(FeedEvent::Closed(text.to_string()));
    }
}

fn notify(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("feed listener panicked");
    }
}

type SocketSlot = Arc<Mutex<Option<TcpStream>>>;

/// Handle to the running feed thread.
pub struct NowPlayingClient {
    shutdown: Arc<AtomicBool>,
    wake_tx: Option<Sender<()>>,
    socket: SocketSlot,
    join: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl NowPlayingClient {
    pub fn start(
        config: FeedConfig,
        listener: Arc<dyn FeedListener>,
        filter: Option<TrackFilter>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded::<()>(1);
        let socket: SocketSlot = Arc::new(Mutex::new(None));
        let shutdown_timeout = config.shutdown_timeout;

        let worker = FeedWorker {
            config,
            listener,
            filter,
            shutdown: shutdown.clone(),
            socket: socket.clone(),
        };
        let join = thread::Builder::new()
            .name("kiku-feed".into())
            .spawn(move || worker.run(wake_rx))
            .context("spawn feed thread")?;

        Ok(Self {
            shutdown,
            wake_tx: Some(wake_tx),
            socket,
            join: Some(join),
            shutdown_timeout,
        })
    }

    /// Stop reconnecting, close the socket and join the thread (bounded). Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake_tx.take();
        let Some(join) = self.join.take() else {
            return;
        };

        let start = Instant::now();
        let graceful = self.shutdown_timeout / 2;
        let mut forced = false;
        while !join.is_finished() {
            let waited = start.elapsed();
            if waited >= self.shutdown_timeout {
                tracing::warn!("feed thread did not exit in time; detaching");
                self.close_socket();
                return;
            }
            if !forced && waited >= graceful {
                forced = true;
                self.close_socket();
            }
            thread::sleep(Duration::from_millis(10));
        }
        if join.join().is_err() {
            tracing::error!("feed thread panicked");
        }
        self.close_socket();
        tracing::info!("feed client shut down");
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    fn close_socket(&self) {
        if let Some(stream) = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for NowPlayingClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct FeedWorker {
    config: FeedConfig,
    listener: Arc<dyn FeedListener>,
    filter: Option<TrackFilter>,
    shutdown: Arc<AtomicBool>,
    socket: SocketSlot,
}

impl FeedWorker {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn run(self, wake_rx: Receiver<()>) {
        let mut attempt: u64 = 0;
        while !self.stopping() {
            attempt += 1;
            tracing::info!(url = %self.config.url, attempt, "connecting to now-playing feed");

            let reason = match self.connection() {
                Ok(reason) => reason,
                Err(e) => {
                    if self.stopping() {
                        String::new()
                    } else {
                        tracing::warn!(url = %self.config.url, "feed connection failed: {e:#}");
                        let text = format!("{e:#}");
                        notify(|| self.listener.on_error_text(&text));
                        String::new()
                    }
                }
            };
            *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = None;
            notify(|| self.listener.on_closed_text(&reason));

            if self.stopping() {
                break;
            }
            tracing::info!(
                delay_ms = self.config.reconnect_delay.as_millis() as u64,
                "feed closed; reconnecting"
            );
            match wake_rx.recv_timeout(self.config.reconnect_delay) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        tracing::debug!("feed thread exiting");
    }

    fn connect(&self) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
        let request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid feed url {}", self.config.url))?;
        let uri = request.uri();
        let host = uri.host().context("feed url has no host")?.to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if uri.scheme_str() == Some("wss") { 443 } else { 80 });

        let addrs: Vec<SocketAddr> = (host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {host}:{port}"))?
            .collect();
        let tcp = connect_any(&addrs, self.config.connect_timeout)
            .with_context(|| format!("connect {host}:{port}"))?;
        tcp.set_nodelay(true).ok();
        tcp.set_read_timeout(Some(self.config.connect_timeout))
            .context("set handshake timeout")?;
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(tcp.try_clone().context("clone feed socket")?);

        let (ws, _response) = tungstenite::client_tls(request, tcp)
            .map_err(|e| anyhow!("websocket handshake failed: {e}"))?;
        if let Some(stream) = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            stream
                .set_read_timeout(Some(self.config.poll_interval))
                .context("set poll timeout")?;
        }
        Ok(ws)
    }

    /// Run one connection until it closes. Returns the server's close reason.
    fn connection(&self) -> Result<String> {
        let mut ws = self.connect()?;
        tracing::info!(url = %self.config.url, "now-playing feed connected");

        let mut heartbeat: Option<(Duration, Instant)> = None;
        let mut close_reason = String::new();

        loop {
            if self.stopping() {
                let _ = ws.close(None);
                let _ = ws.flush();
                return Ok(close_reason);
            }

            if let Some((every, due)) = heartbeat {
                if Instant::now() >= due {
                    ws.send(Message::text(heartbeat_payload()))
                        .context("send heartbeat")?;
                    tracing::trace!("heartbeat sent");
                    heartbeat = Some((every, Instant::now() + every));
                }
            }

            match ws.read() {
                Ok(Message::Text(text)) => match parse_message(text.as_str()) {
                    Some(GatewayMessage::Hello { heartbeat: every }) => {
                        tracing::debug!(interval_ms = every.as_millis() as u64, "feed hello");
                        heartbeat = Some((every, Instant::now() + every));
                    }
                    Some(GatewayMessage::Track(d)) => {
                        if !passes_filter(self.filter.as_ref(), &d) {
                            tracing::debug!("track update filtered out");
                            continue;
                        }
                        let track = parse_track(&d);
                        tracing::info!(title = %track.title, artist = %track.artist, "now playing");
                        notify(|| self.listener.on_now_playing(track));
                    }
                    None => tracing::trace!("ignored feed message"),
                },
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        close_reason = frame.reason.as_str().to_string();
                    }
                    tracing::info!(reason = %close_reason, "feed closed by server");
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(close_reason);
                }
                Err(e) => {
                    if self.stopping() {
                        return Ok(close_reason);
                    }
                    return Err(e).context("feed socket");
                }
            }
        }
    }
}

/// Try each resolved address in order; the last failure is reported.
fn connect_any(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => {
                tracing::debug!(%addr, "feed connect failed: {e}");
                last_err = Some(anyhow!("connect {addr}: {e}"));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("no address resolved")))
}
