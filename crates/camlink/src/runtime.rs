//! Client runtime.
//!
//! Wires the CPAL devices, the Socket.IO channel and the WebRTC transport into an
//! [`AudioSession`] and a [`VideoTransport`], then drives them from stdin commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bytes::Bytes;
use camlink_audio::capture::CpalInput;
use camlink_audio::device;
use camlink_audio::playback::CpalOutput;
use camlink_audio::session::{AudioObserver, AudioSession, Notice, SessionError};
use camlink_transport::SocketIoFactory;
use camlink_types::AudioStatus;
use camlink_video::peer::{RtpPacket, TrackInfo};
use camlink_video::{
    HttpFrameSource, HttpSignaling, NullSink, VideoDeps, VideoError, VideoObserver, VideoSink,
    VideoTransport, WebRtcPeerFactory,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::ClientConfig;

/// Options for `camlink run`.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub video: bool,
    pub frame_out: Option<PathBuf>,
}

/// Print input and output devices to stdout.
pub fn list_devices() -> Result<()> {
    let host = cpal::default_host();
    let devices = device::list_devices(&host).context("enumerate audio devices")?;
    for info in devices {
        println!(
            "{:<6} {}{} ({}-{} Hz)",
            info.direction,
            info.name,
            if info.is_default { " [default]" } else { "" },
            info.min_rate,
            info.max_rate
        );
    }
    Ok(())
}

/// Listen to the camera until Ctrl-C.
pub async fn run_listen(config: ClientConfig) -> Result<()> {
    let mut quit = install_ctrlc()?;
    let (audio, output) = open_audio(&config).await?;
    audio.connect().context("connect audio channel")?;
    audio.start_listening().context("start listening")?;
    tracing::info!(server = %config.server, "listening; press Ctrl-C to stop");

    let _ = quit.recv().await;
    audio.close().await;
    shutdown_output(output).await;
    Ok(())
}

/// Interactive client: video plus two-way audio, controlled from stdin.
pub async fn run_client(config: ClientConfig, options: RunOptions) -> Result<()> {
    let mut quit = install_ctrlc()?;
    let (audio, output) = open_audio(&config).await?;
    audio.connect().context("connect audio channel")?;

    let sink: Arc<dyn VideoSink> = match &options.frame_out {
        Some(path) => Arc::new(FrameFileSink::new(path.clone())),
        None => Arc::new(NullSink),
    };
    let video = if options.video {
        let transport = Arc::new(open_video(&config));
        spawn_video_connect(transport.clone(), sink.clone());
        Some(transport)
    } else {
        None
    };

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = quit.recv() => break,
            line = lines.next_line() => match line.context("read stdin")? {
                Some(line) => line,
                None => break,
            },
        };
        let Some(command) = UserCommand::parse(&line) else {
            if !line.trim().is_empty() {
                println!("unknown command: {}", line.trim());
                print_help();
            }
            continue;
        };
        match command {
            UserCommand::ToggleListen => {
                if audio.is_listening() {
                    audio.stop_listening();
                } else {
                    report(audio.start_listening());
                }
            }
            UserCommand::ToggleTalk => {
                if audio.is_talking() {
                    audio.stop_talking().await;
                } else {
                    let audio = audio.clone();
                    tokio::spawn(async move { report(audio.start_talking().await) });
                }
            }
            UserCommand::Volume(percent) => {
                let applied = audio.set_volume(f32::from(percent) / 100.0);
                println!("volume {:.0}%", applied * 100.0);
            }
            UserCommand::Reconnect => {
                audio.resume();
                if let Some(video) = &video {
                    spawn_video_connect(video.clone(), sink.clone());
                }
            }
            UserCommand::Status => {
                println!(
                    "audio: {:?} (blocked: {}), video: {}",
                    audio.phase(),
                    audio.is_blocked(),
                    video
                        .as_ref()
                        .map(|v| v.state().to_string())
                        .unwrap_or_else(|| "off".to_string())
                );
            }
            UserCommand::Help => print_help(),
            UserCommand::Quit => break,
        }
    }

    tracing::info!("shutting down");
    if let Some(video) = &video {
        video.close();
    }
    audio.close().await;
    shutdown_output(output).await;
    Ok(())
}

async fn open_audio(config: &ClientConfig) -> Result<(AudioSession, Arc<CpalOutput>)> {
    let device = config.output_device.clone();
    let rate = config.audio.wire_rate;
    let output = tokio::task::spawn_blocking(move || CpalOutput::open(device.as_deref(), rate))
        .await
        .context("output device task")?
        .context("open audio output")?;
    let output = Arc::new(output);
    let input = Arc::new(CpalInput {
        default_device: config.input_device.clone(),
    });
    let factory = Arc::new(SocketIoFactory::new(config.socket_io()));
    let session = AudioSession::new(
        config.audio.clone(),
        factory,
        output.clone(),
        input,
        Arc::new(LogAudioObserver),
    );
    Ok((session, output))
}

/// Joins the output thread, so it runs on the blocking pool.
async fn shutdown_output(output: Arc<CpalOutput>) {
    if let Err(err) = tokio::task::spawn_blocking(move || output.shutdown()).await {
        tracing::warn!(error = %err, "output shutdown failed");
    }
}

fn open_video(config: &ClientConfig) -> VideoTransport {
    VideoTransport::spawn(
        config.video.clone(),
        config.fallback.clone(),
        VideoDeps {
            peers: Arc::new(WebRtcPeerFactory {
                ice_servers: config.ice_servers.clone(),
            }),
            signaling: Arc::new(HttpSignaling::new(config.server.clone(), config.token.clone())),
            frames: Arc::new(HttpFrameSource::new(
                config.server.clone(),
                config.token.clone(),
                &config.fallback,
            )),
            observer: Arc::new(LogVideoObserver),
        },
    )
}

fn spawn_video_connect(video: Arc<VideoTransport>, sink: Arc<dyn VideoSink>) {
    tokio::spawn(async move {
        if video.connect(sink).await {
            tracing::info!("video negotiated; waiting for media");
        } else {
            tracing::warn!("initial video negotiation failed; showing still frames while retrying");
            video.show_fallback();
        }
    });
}

/// Ctrl-C becomes a message so shutdown runs on the async side.
fn install_ctrlc() -> Result<mpsc::UnboundedReceiver<()>> {
    let (tx, rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;
    Ok(rx)
}

fn report(result: Result<(), SessionError>) {
    if let Err(err) = result {
        println!("{err}");
    }
}

fn print_help() {
    println!("commands: l = listen on/off, t = talk on/off, v N = volume %, r = reconnect, s = status, q = quit");
}

/// One line of interactive input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UserCommand {
    ToggleListen,
    ToggleTalk,
    Volume(u8),
    Reconnect,
    Status,
    Help,
    Quit,
}

impl UserCommand {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let head = parts.next()?;
        let command = match head {
            "l" | "listen" => Self::ToggleListen,
            "t" | "talk" => Self::ToggleTalk,
            "v" | "volume" => {
                let percent = parts.next()?.parse::<u8>().ok()?;
                Self::Volume(percent.min(100))
            }
            "r" | "reconnect" => Self::Reconnect,
            "s" | "status" => Self::Status,
            "h" | "help" | "?" => Self::Help,
            "q" | "quit" | "exit" => Self::Quit,
            _ => return None,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(command)
    }
}

struct LogAudioObserver;

impl AudioObserver for LogAudioObserver {
    fn blocked_changed(&self, blocked: bool) {
        if blocked {
            tracing::warn!("another client took exclusive control; audio stopped");
        } else {
            tracing::info!("exclusive control released");
        }
    }

    fn notice(&self, notice: &Notice) {
        tracing::warn!(%notice, "audio");
    }

    fn status(&self, status: &AudioStatus) {
        tracing::debug!(
            listening = status.listening,
            talking = ?status.talking,
            talking_clients = ?status.talking_clients,
            "audio status"
        );
    }
}

struct LogVideoObserver;

impl VideoObserver for LogVideoObserver {
    fn on_connected(&self) {
        tracing::info!("video live");
    }

    fn on_disconnected(&self) {
        tracing::warn!("video connection lost");
    }

    fn on_fallback(&self) {
        tracing::warn!("video unavailable; showing still frames");
    }

    fn on_negotiation_failed(&self, error: &VideoError) {
        tracing::warn!(error = %error, "video negotiation failed");
    }
}

/// Counts RTP traffic and writes the latest fallback frame to disk.
struct FrameFileSink {
    path: PathBuf,
    packets: AtomicU64,
    frames: AtomicU64,
}

impl FrameFileSink {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            packets: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        }
    }
}

impl VideoSink for FrameFileSink {
    fn track_started(&self, track: &TrackInfo) {
        tracing::info!(codec = %track.codec, ssrc = track.ssrc, "receiving video");
    }

    fn rtp(&self, _track: &TrackInfo, _packet: &RtpPacket) {
        let n = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 1000 == 0 {
            tracing::debug!(packets = n, "video rtp");
        }
    }

    fn fallback_frame(&self, jpeg: &Bytes) {
        // Write beside the target and rename so readers never see a partial frame.
        let tmp = self.path.with_extension("part");
        let result = std::fs::write(&tmp, jpeg).and_then(|_| std::fs::rename(&tmp, &self.path));
        match result {
            Ok(()) => {
                let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(frames = n, bytes = jpeg.len(), "fallback frame written");
            }
            Err(err) => tracing::warn!(path = ?self.path, error = %err, "write fallback frame"),
        }
    }
}
