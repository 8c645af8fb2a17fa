//! Playback stage: schedules inbound wire chunks onto a gap-free output timeline.
//!
//! [`PlaybackScheduler`] keeps the playback cursor and turns each [`AudioChunk`] into a buffer
//! placed at an absolute time on the output clock. [`AudioOutput`] is the clock plus the place
//! buffers land; [`CpalOutput`] implements it with a CPAL stream whose callback mixes the
//! scheduled timeline into the device buffer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use camlink_types::AudioChunk;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::device::{self, Direction};
use crate::pcm::{clamp_volume, dequantize_block};
use crate::resample::resample_linear;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Device(#[from] device::DeviceError),
    #[error("output stream: {0}")]
    Stream(String),
    #[error("output closed")]
    Closed,
}

/// Output clock plus a place to put scheduled buffers.
pub trait AudioOutput: Send + Sync {
    /// Rate buffers passed to [`schedule`](Self::schedule) are expected in.
    fn sample_rate(&self) -> u32;

    /// Current position of the output clock in seconds.
    fn current_time(&self) -> f64;

    /// Play mono `samples` starting at `start` seconds on the output clock.
    fn schedule(&self, start: f64, samples: Vec<f32>);

    /// Resume a suspended output. Idempotent.
    fn resume(&self) -> Result<(), PlaybackError>;
}

/// Places wire chunks back to back on the output clock.
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    wire_rate: u32,
    next_play_time: f64,
    volume: f32,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>, wire_rate: u32, volume: f32) -> Self {
        Self {
            output,
            wire_rate,
            next_play_time: 0.0,
            volume: clamp_volume(volume),
        }
    }

    /// Forget the cursor; the next chunk starts at the current output time.
    pub fn reset(&mut self) {
        self.next_play_time = 0.0;
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = clamp_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }

    /// Schedule `chunk` and return the start time it was placed at.
    ///
    /// Empty chunks are ignored. If the cursor fell behind the output clock it snaps forward to
    /// "now" first, so playback never schedules into the past.
    pub fn play(&mut self, chunk: &AudioChunk) -> Option<f64> {
        if chunk.is_empty() || self.wire_rate == 0 {
            return None;
        }
        let samples = dequantize_block(chunk.samples(), self.volume);
        let out_rate = self.output.sample_rate();
        let samples = resample_linear(&samples, self.wire_rate, out_rate);
        if samples.is_empty() || out_rate == 0 {
            return None;
        }
        // Step by the buffer actually scheduled, not the wire length.
        let duration = samples.len() as f64 / out_rate as f64;

        let now = self.output.current_time();
        if self.next_play_time < now {
            self.next_play_time = now;
        }
        let start = self.next_play_time;
        self.output.schedule(start, samples);
        self.next_play_time += duration;
        Some(start)
    }
}

struct Scheduled {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Scheduled {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Timeline shared between [`CpalOutput`] and its stream callback.
struct Timeline {
    rate: u32,
    played_frames: AtomicU64,
    queue: Mutex<VecDeque<Scheduled>>,
}

impl Timeline {
    fn new(rate: u32) -> Self {
        Self {
            rate,
            played_frames: AtomicU64::new(0),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Scheduled>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> f64 {
        self.played_frames.load(Ordering::Relaxed) as f64 / self.rate as f64
    }

    fn push(&self, start: f64, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let start_frame = (start * self.rate as f64).round().max(0.0) as u64;
        let mut queue = self.lock();
        // Callers schedule in order; keep the queue sorted anyway.
        let at = queue
            .iter()
            .rposition(|s| s.start_frame <= start_frame)
            .map(|i| i + 1)
            .unwrap_or(0);
        queue.insert(at, Scheduled { start_frame, samples });
    }

    /// Render `frames` mono samples starting at the current clock position into `out`.
    fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let base = self.played_frames.load(Ordering::Relaxed);
        let end = base + out.len() as u64;
        let mut queue = self.lock();
        while queue.front().is_some_and(|s| s.end_frame() <= base) {
            queue.pop_front();
        }
        for entry in queue.iter() {
            if entry.start_frame >= end {
                break;
            }
            let from = entry.start_frame.max(base);
            let to = entry.end_frame().min(end);
            for frame in from..to {
                out[(frame - base) as usize] += entry.samples[(frame - entry.start_frame) as usize];
            }
        }
        drop(queue);
        self.played_frames.fetch_add(out.len() as u64, Ordering::Relaxed);
    }
}

enum OutputCommand {
    Resume,
    Shutdown,
}

/// CPAL-backed [`AudioOutput`].
///
/// The stream lives on a dedicated thread (CPAL streams are not `Send` on every host); this
/// handle talks to it over a command channel.
pub struct CpalOutput {
    timeline: Arc<Timeline>,
    cmd_tx: Sender<OutputCommand>,
    failed: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalOutput {
    /// Open the output device matching `needle` (or the default one) and start the stream.
    pub fn open(needle: Option<&str>, preferred_rate: u32) -> Result<Self, PlaybackError> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let needle = needle.map(str::to_string);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_for_thread = failed.clone();

        let thread = std::thread::Builder::new()
            .name("camlink-output".to_string())
            .spawn(move || {
                output_thread_main(needle, preferred_rate, failed_for_thread, ready_tx, cmd_rx)
            })
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;

        let timeline = match ready_rx.recv() {
            Ok(Ok(timeline)) => timeline,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => return Err(PlaybackError::Closed),
        };

        Ok(Self {
            timeline,
            cmd_tx,
            failed,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Stop the stream and join the output thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(OutputCommand::Shutdown);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.timeline.rate
    }

    fn current_time(&self) -> f64 {
        self.timeline.now()
    }

    fn schedule(&self, start: f64, samples: Vec<f32>) {
        self.timeline.push(start, samples);
    }

    fn resume(&self) -> Result<(), PlaybackError> {
        if self.failed.load(Ordering::Relaxed) {
            tracing::warn!("output stream reported an error; resuming anyway");
        }
        self.cmd_tx
            .send(OutputCommand::Resume)
            .map_err(|_| PlaybackError::Closed)
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn output_thread_main(
    needle: Option<String>,
    preferred_rate: u32,
    failed: Arc<AtomicBool>,
    ready_tx: Sender<Result<Arc<Timeline>, PlaybackError>>,
    cmd_rx: Receiver<OutputCommand>,
) {
    let opened = open_stream(needle.as_deref(), preferred_rate, failed);
    let (stream, timeline) = match opened {
        Ok(pair) => pair,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    if ready_tx.send(Ok(timeline)).is_err() {
        return;
    }

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            OutputCommand::Resume => {
                if let Err(err) = stream.play() {
                    tracing::warn!(error = %err, "output resume failed");
                }
            }
            OutputCommand::Shutdown => break,
        }
    }
    tracing::debug!("output thread exiting");
}

fn open_stream(
    needle: Option<&str>,
    preferred_rate: u32,
    failed: Arc<AtomicBool>,
) -> Result<(cpal::Stream, Arc<Timeline>), PlaybackError> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, Direction::Output, needle)?;
    let config = device::pick_config(&device, Direction::Output, preferred_rate)?;
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config) {
        stream_config.buffer_size = buf;
    }

    let timeline = Arc::new(Timeline::new(stream_config.sample_rate));
    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, &timeline, &failed),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, &timeline, &failed),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, &timeline, &failed),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, &timeline, &failed),
        other => Err(PlaybackError::Stream(format!(
            "unsupported sample format: {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| PlaybackError::Stream(e.to_string()))?;

    tracing::info!(
        device = %device::device_name(&device),
        sample_rate = stream_config.sample_rate,
        channels = stream_config.channels,
        format = ?config.sample_format(),
        "output stream started"
    );
    Ok((stream, timeline))
}

/// Type-specialized stream builder: renders the mono timeline and copies it to every channel.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    timeline: &Arc<Timeline>,
    failed: &Arc<AtomicBool>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = (config.channels as usize).max(1);
    let timeline = timeline.clone();
    let failed = failed.clone();
    let mut mono: Vec<f32> = Vec::new();

    let err_fn = move |err| {
        failed.store(true, Ordering::Relaxed);
        tracing::warn!("output stream error: {err}");
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                timeline.render(&mut mono);
                for (frame, sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    let value = <T as cpal::Sample>::from_sample::<f32>(sample.clamp(-1.0, 1.0));
                    frame.fill(value);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| PlaybackError::Stream(e.to_string()))
}
