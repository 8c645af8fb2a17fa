//! Capture stage: microphone frames to wire chunks.
//!
//! An [`AudioInput`] hands out [`InputHandle`]s (an opened microphone). A handle broadcasts
//! mono `f32` blocks at its own rate to any attached taps. [`CapturePipeline`] attaches one
//! tap, cuts the stream into fixed frames, resamples each to the wire rate, quantizes it and
//! hands the resulting [`AudioChunk`] to a sink on a worker thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use camlink_types::AudioChunk;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};

use crate::config::AudioConfig;
use crate::device::{self, Direction};
use crate::pcm::quantize_block;
use crate::resample::resample_linear;

/// Processing requested when opening the microphone.
///
/// Hosts without built-in voice processing ignore the flags they cannot honour.
#[derive(Clone, Debug)]
pub struct CaptureConstraints {
    pub mono: bool,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Substring of the input device name; `None` for the default device.
    pub device: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            mono: true,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    Denied(String),
    #[error("no microphone: {0}")]
    NoDevice(String),
    #[error("capture stream: {0}")]
    Stream(String),
}

impl From<device::DeviceError> for CaptureError {
    fn from(err: device::DeviceError) -> Self {
        match err {
            device::DeviceError::Backend(msg) => CaptureError::Stream(msg),
            other => CaptureError::NoDevice(other.to_string()),
        }
    }
}

/// Identifies one tap attached to an [`InputHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TapId(u64);

/// An opened microphone.
pub trait InputHandle: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Start delivering mono blocks to `tap`.
    fn attach(&self, tap: Sender<Vec<f32>>) -> TapId;

    /// Stop delivering to `id`; the tap's sender is dropped.
    fn detach(&self, id: TapId);

    /// Release the device. Further blocks are never delivered. Idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

/// Something that can open the microphone.
pub trait AudioInput: Send + Sync {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Arc<dyn InputHandle>, CaptureError>;
}

/// Fan-out of captured blocks to attached taps.
#[derive(Default)]
pub struct TapSet {
    next_id: AtomicU64,
    taps: Mutex<Vec<(TapId, Sender<Vec<f32>>)>>,
}

impl TapSet {
    pub fn attach(&self, tap: Sender<Vec<f32>>) -> TapId {
        let id = TapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.taps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, tap));
        id
    }

    pub fn detach(&self, id: TapId) {
        self.taps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(tap, _)| *tap != id);
    }

    pub fn clear(&self) {
        self.taps.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Send a copy of `block` to every tap, dropping taps whose receiver is gone.
    pub fn broadcast(&self, block: &[f32]) {
        let mut taps = self.taps.lock().unwrap_or_else(|e| e.into_inner());
        taps.retain(|(_, tx)| tx.send(block.to_vec()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.taps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cuts device-rate blocks into fixed frames and converts each frame to a wire chunk.
pub struct FrameProcessor {
    device_rate: u32,
    wire_rate: u32,
    frame_len: usize,
    pending: Vec<f32>,
}

impl FrameProcessor {
    pub fn new(device_rate: u32, wire_rate: u32, frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            device_rate,
            wire_rate,
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
        }
    }

    /// Append `block`; returns one chunk for every frame completed.
    pub fn push(&mut self, block: &[f32]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(block);
        let mut out = Vec::new();
        while self.pending.len() >= self.frame_len {
            let frame: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            out.push(self.convert(&frame));
        }
        out
    }

    fn convert(&self, frame: &[f32]) -> AudioChunk {
        let resampled = resample_linear(frame, self.device_rate, self.wire_rate);
        AudioChunk::new(quantize_block(&resampled))
    }
}

/// Who releases the input handle when capture stops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// The pipeline opened the handle and stops it on teardown.
    Owned,
    /// The handle belongs to the caller and is left running.
    Shared,
}

/// A running capture graph: one tap on an input handle plus a conversion worker.
pub struct CapturePipeline {
    handle: Arc<dyn InputHandle>,
    tap: TapId,
    ownership: Ownership,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Attach to `handle` and deliver one chunk per captured frame to `sink`.
    pub fn start<F>(
        handle: Arc<dyn InputHandle>,
        ownership: Ownership,
        config: &AudioConfig,
        mut sink: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        let (tx, rx): (Sender<Vec<f32>>, Receiver<Vec<f32>>) = crossbeam_channel::unbounded();
        let mut processor =
            FrameProcessor::new(handle.sample_rate(), config.wire_rate, config.capture_frame);
        let worker = std::thread::Builder::new()
            .name("camlink-capture".to_string())
            .spawn(move || {
                while let Ok(block) = rx.recv() {
                    for chunk in processor.push(&block) {
                        sink(chunk);
                    }
                }
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;
        let tap = handle.attach(tx);

        tracing::info!(
            device_rate = handle.sample_rate(),
            wire_rate = config.wire_rate,
            frame = config.capture_frame,
            ?ownership,
            "capture started"
        );
        Ok(Self {
            handle,
            tap,
            ownership,
            worker: Some(worker),
        })
    }

    /// Detach, drain the worker, and release the handle if this pipeline owns it.
    pub fn stop(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.handle.detach(self.tap);
        let _ = worker.join();
        if self.ownership == Ownership::Owned {
            self.handle.stop();
        }
        tracing::info!(ownership = ?self.ownership, "capture stopped");
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// CPAL-backed microphone.
#[derive(Clone, Debug, Default)]
pub struct CpalInput {
    /// Used when the constraints do not name a device.
    pub default_device: Option<String>,
}

impl AudioInput for CpalInput {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Arc<dyn InputHandle>, CaptureError> {
        let needle = constraints
            .device
            .clone()
            .or_else(|| self.default_device.clone());
        let handle = CpalInputHandle::open(needle, constraints)?;
        Ok(Arc::new(handle))
    }
}

enum InputCommand {
    Stop,
}

/// Open CPAL input stream. The stream lives on its own thread.
pub struct CpalInputHandle {
    rate: u32,
    taps: Arc<TapSet>,
    stopped: AtomicBool,
    cmd_tx: Sender<InputCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalInputHandle {
    fn open(needle: Option<String>, constraints: &CaptureConstraints) -> Result<Self, CaptureError> {
        if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
            tracing::debug!(
                echo_cancellation = constraints.echo_cancellation,
                noise_suppression = constraints.noise_suppression,
                auto_gain_control = constraints.auto_gain_control,
                "voice processing is left to the host"
            );
        }
        let taps = Arc::new(TapSet::default());
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let taps_for_thread = taps.clone();

        let thread = std::thread::Builder::new()
            .name("camlink-input".to_string())
            .spawn(move || input_thread_main(needle, taps_for_thread, ready_tx, cmd_rx))
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        let rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => return Err(CaptureError::Stream("input thread exited".to_string())),
        };

        Ok(Self {
            rate,
            taps,
            stopped: AtomicBool::new(false),
            cmd_tx,
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl InputHandle for CpalInputHandle {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn attach(&self, tap: Sender<Vec<f32>>) -> TapId {
        self.taps.attach(tap)
    }

    fn detach(&self, id: TapId) {
        self.taps.detach(id);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.taps.clear();
        let _ = self.cmd_tx.send(InputCommand::Stop);
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for CpalInputHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn input_thread_main(
    needle: Option<String>,
    taps: Arc<TapSet>,
    ready_tx: Sender<Result<u32, CaptureError>>,
    cmd_rx: Receiver<InputCommand>,
) {
    let stream = match open_input_stream(needle.as_deref(), taps) {
        Ok((stream, rate)) => {
            if ready_tx.send(Ok(rate)).is_err() {
                return;
            }
            stream
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    // Any command, or the handle going away, ends the stream.
    let _ = cmd_rx.recv();
    drop(stream);
    tracing::debug!("input thread exiting");
}

fn open_input_stream(
    needle: Option<&str>,
    taps: Arc<TapSet>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = device::pick_device(&host, Direction::Input, needle)?;
    let config = device
        .default_input_config()
        .map_err(|e| CaptureError::Denied(e.to_string()))?;
    let stream_config: cpal::StreamConfig = config.clone().into();

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, taps),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, taps),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, taps),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, taps),
        other => Err(CaptureError::Stream(format!(
            "unsupported sample format: {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| CaptureError::Denied(e.to_string()))?;

    tracing::info!(
        device = %device::device_name(&device),
        sample_rate = stream_config.sample_rate,
        channels = stream_config.channels,
        format = ?config.sample_format(),
        "input stream started"
    );
    Ok((stream, stream_config.sample_rate))
}

/// Type-specialized input stream builder: downmixes to mono and broadcasts each callback block.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    taps: Arc<TapSet>,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample + cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = (config.channels as usize).max(1);
    let mut mono: Vec<f32> = Vec::new();
    let err_fn = |err| tracing::warn!("input stream error: {err}");

    device
        .build_input_stream(
            config,
            move |data: &[T], _| {
                if taps.is_empty() {
                    return;
                }
                mono.clear();
                for frame in data.chunks(channels) {
                    let sum: f32 = frame.iter().map(|s| s.to_sample::<f32>()).sum();
                    mono.push(sum / frame.len() as f32);
                }
                taps.broadcast(&mono);
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::Denied(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// Input handle fed by the test through its tap set.
    #[derive(Default)]
    pub(crate) struct FakeHandle {
        pub rate: u32,
        pub taps: TapSet,
        pub stopped: AtomicBool,
    }

    impl FakeHandle {
        pub(crate) fn new(rate: u32) -> Arc<Self> {
            Arc::new(Self {
                rate,
                ..Default::default()
            })
        }

        pub(crate) fn feed(&self, block: &[f32]) {
            self.taps.broadcast(block);
        }
    }

    impl InputHandle for FakeHandle {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn attach(&self, tap: Sender<Vec<f32>>) -> TapId {
            self.taps.attach(tap)
        }

        fn detach(&self, id: TapId) {
            self.taps.detach(id);
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            self.taps.clear();
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    fn config(frame: usize) -> AudioConfig {
        AudioConfig {
            capture_frame: frame,
            ..AudioConfig::default()
        }
    }

    #[test]
    fn frame_processor_emits_one_chunk_per_full_frame() {
        let mut processor = FrameProcessor::new(48_000, 16_000, 4_096);
        assert!(processor.push(&vec![0.1; 3_000]).is_empty());
        let chunks = processor.push(&vec![0.1; 3_000]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1_365);
        assert_eq!(processor.pending.len(), 6_000 - 4_096);
    }

    #[test]
    fn frame_processor_clamps_and_quantizes() {
        let mut processor = FrameProcessor::new(16_000, 16_000, 4);
        let chunks = processor.push(&[2.0, -2.0, 0.5, -0.5]);
        assert_eq!(chunks[0].samples(), &[32_767, -32_768, 16_383, -16_384]);
    }

    #[test]
    fn owned_pipeline_stops_handle() {
        let handle = FakeHandle::new(16_000);
        let (tx, rx) = crossbeam_channel::unbounded();
        let pipeline = CapturePipeline::start(handle.clone(), Ownership::Owned, &config(160), move |c| {
            let _ = tx.send(c);
        })
        .unwrap();

        handle.feed(&vec![0.25; 320]);
        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.len(), 160);
        assert_eq!(second.len(), 160);

        pipeline.stop();
        assert!(handle.is_stopped());
        assert!(handle.taps.is_empty());
    }

    #[test]
    fn shared_handle_is_never_stopped() {
        let handle = FakeHandle::new(16_000);
        let (tx, rx) = crossbeam_channel::unbounded();
        let pipeline = CapturePipeline::start(handle.clone(), Ownership::Shared, &config(160), move |c| {
            let _ = tx.send(c);
        })
        .unwrap();
        handle.feed(&vec![0.25; 160]);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());

        drop(pipeline);
        assert!(!handle.is_stopped());
        assert!(handle.taps.is_empty());

        // Blocks after teardown go nowhere.
        handle.feed(&vec![0.25; 160]);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn tap_set_drops_disconnected_taps() {
        let taps = TapSet::default();
        let (tx, rx) = crossbeam_channel::unbounded();
        taps.attach(tx);
        drop(rx);
        taps.broadcast(&[0.0]);
        assert!(taps.is_empty());
    }
}
