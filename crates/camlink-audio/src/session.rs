//! Full-duplex audio session with the camera.
//!
//! One [`AudioSession`] owns the `/audio` channel, the playback scheduler and (while talking)
//! a capture pipeline. Channel events are pumped into [`AudioSession::handle_event`] by a tokio
//! task; everything else is driven by the caller. Opening the microphone and tearing down
//! capture run on tokio's blocking pool. Listening and talking survive reconnects:
//! while the channel is down both are suspended, and on reconnect the device is asked to resume
//! them exactly once.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use camlink_transport::{ChannelError, ChannelEvent, ChannelEvents, ChannelFactory, EventChannel, Payload};
use camlink_types::{AudioChunk, AudioStatus, ErrorCode, ErrorPayload, ExclusiveStatus, audio_event, namespace};

use crate::capture::{AudioInput, CaptureConstraints, CaptureError, CapturePipeline, InputHandle, Ownership};
use crate::config::AudioConfig;
use crate::playback::{AudioOutput, PlaybackScheduler};

/// User-facing notices raised by the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// The microphone could not be opened; talking did not start.
    MicrophoneDenied { reason: String },
    /// The device refused this client's talk request; talking was stopped locally.
    TalkRejected { reason: String },
    /// Any other error reported by the device.
    Device { code: ErrorCode, message: Option<String> },
    /// The channel failed to connect.
    Channel { message: String },
    /// The channel gave up reconnecting.
    ReconnectFailed,
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::MicrophoneDenied { reason } => write!(f, "microphone unavailable: {reason}"),
            Notice::TalkRejected { reason } => write!(f, "talk rejected: {reason}"),
            Notice::Device { code, message } => match message {
                Some(message) => write!(f, "device error {code:?}: {message}"),
                None => write!(f, "device error {code:?}"),
            },
            Notice::Channel { message } => write!(f, "audio channel: {message}"),
            Notice::ReconnectFailed => f.write_str("audio channel gave up reconnecting"),
        }
    }
}

/// Callbacks for the UI layer. Invoked synchronously, never while the session lock is held.
pub trait AudioObserver: Send + Sync {
    fn blocked_changed(&self, _blocked: bool) {}
    fn notice(&self, _notice: &Notice) {}
    fn status(&self, _status: &AudioStatus) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl AudioObserver for NoopObserver {}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("another client holds exclusive control")]
    Blocked,
    #[error("audio session requires a tokio runtime")]
    NoRuntime,
}

/// Coarse session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Listening,
    Talking,
    ListeningAndTalking,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Listen {
    Off,
    /// Wanted, but the channel is down; resumed on the next connect.
    Suspended,
    Active,
}

struct Talk {
    pipeline: CapturePipeline,
    /// `audio_talk_start` was sent on the current connection.
    announced: bool,
}

struct State {
    channel: Option<Arc<dyn EventChannel>>,
    connected: bool,
    listen: Listen,
    talk: Option<Talk>,
    /// Token of the talk start waiting on the microphone. Cleared to cancel it.
    talk_starting: Option<u64>,
    next_talk_token: u64,
    blocked: bool,
    scheduler: PlaybackScheduler,
}

impl State {
    fn send(&self, event: &str, payload: Payload) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(err) = channel.emit(event, payload) {
            tracing::warn!(event, error = %err, "audio emit failed");
        }
    }

    fn stop_listen(&mut self) {
        if self.listen == Listen::Active {
            self.send(audio_event::LISTEN_STOP, Payload::Empty);
        }
        self.listen = Listen::Off;
        self.scheduler.reset();
    }

    fn take_talk(&mut self, announce_stop: bool) -> Option<CapturePipeline> {
        let talk = self.talk.take()?;
        if announce_stop && talk.announced {
            self.send(audio_event::TALK_STOP, Payload::Empty);
        }
        Some(talk.pipeline)
    }
}

/// Work deferred until the state lock is released.
#[derive(Default)]
struct Effects {
    stop: Option<CapturePipeline>,
    blocked: Option<bool>,
    status: Option<AudioStatus>,
    notices: Vec<Notice>,
}

struct Shared {
    config: AudioConfig,
    constraints: CaptureConstraints,
    factory: Arc<dyn ChannelFactory>,
    output: Arc<dyn AudioOutput>,
    input: Arc<dyn AudioInput>,
    observer: Arc<dyn AudioObserver>,
    state: Mutex<State>,
}

/// Handle to the audio session. Cheap to clone.
#[derive(Clone)]
pub struct AudioSession {
    shared: Arc<Shared>,
}

impl AudioSession {
    pub fn new(
        config: AudioConfig,
        factory: Arc<dyn ChannelFactory>,
        output: Arc<dyn AudioOutput>,
        input: Arc<dyn AudioInput>,
        observer: Arc<dyn AudioObserver>,
    ) -> Self {
        let scheduler = PlaybackScheduler::new(output.clone(), config.wire_rate, config.initial_volume);
        Self {
            shared: Arc::new(Shared {
                config,
                constraints: CaptureConstraints::default(),
                factory,
                output,
                input,
                observer,
                state: Mutex::new(State {
                    channel: None,
                    connected: false,
                    listen: Listen::Off,
                    talk: None,
                    talk_starting: None,
                    next_talk_token: 0,
                    blocked: false,
                    scheduler,
                }),
            }),
        }
    }

    /// Replace the microphone constraints. Only valid before the session is shared.
    pub fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.constraints = constraints;
        } else {
            tracing::warn!("session already shared; capture constraints unchanged");
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the `/audio` channel if it is not open yet. Idempotent.
    ///
    /// Must run inside a tokio runtime: channel events are pumped by a spawned task.
    pub fn connect(&self) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let mut state = self.lock();
        if state.channel.is_some() {
            return Ok(());
        }
        let (channel, events) = self.shared.factory.open(namespace::AUDIO)?;
        state.channel = Some(channel);
        drop(state);

        runtime.spawn(pump(Arc::downgrade(&self.shared), events));
        tracing::info!(namespace = namespace::AUDIO, "audio channel opened");
        Ok(())
    }

    /// Ask the device to stream its microphone to us. Idempotent.
    pub fn start_listening(&self) -> Result<(), SessionError> {
        self.connect()?;
        let mut state = self.lock();
        if state.blocked {
            return Err(SessionError::Blocked);
        }
        if state.listen != Listen::Off {
            return Ok(());
        }
        state.scheduler.reset();
        if state.connected {
            state.send(audio_event::LISTEN_START, Payload::Empty);
            state.listen = Listen::Active;
        } else {
            state.listen = Listen::Suspended;
        }
        let listen = state.listen;
        drop(state);

        if let Err(err) = self.shared.output.resume() {
            tracing::warn!(error = %err, "output resume failed");
        }
        tracing::info!(?listen, "listening started");
        Ok(())
    }

    /// Stop listening. Idempotent.
    pub fn stop_listening(&self) {
        let mut state = self.lock();
        if state.listen == Listen::Off {
            return;
        }
        state.stop_listen();
        drop(state);
        tracing::info!("listening stopped");
    }

    /// Open the microphone and stream it to the device's speaker. Idempotent.
    ///
    /// The device is opened on the blocking pool. A [`stop_talking`](Self::stop_talking) or
    /// [`close`](Self::close) issued meanwhile cancels the start and releases the microphone.
    /// A denied microphone raises [`Notice::MicrophoneDenied`] and is not retried.
    pub async fn start_talking(&self) -> Result<(), SessionError> {
        let Some(token) = self.claim_talk_slot()? else {
            return Ok(());
        };
        let input = self.shared.input.clone();
        let constraints = self.shared.constraints.clone();
        let acquired = tokio::task::spawn_blocking(move || input.acquire(&constraints))
            .await
            .unwrap_or_else(|err| Err(CaptureError::Stream(format!("microphone task: {err}"))));
        let handle = match acquired {
            Ok(handle) => handle,
            Err(err) => {
                self.clear_talk_claim(token);
                tracing::warn!(error = %err, "microphone unavailable");
                self.shared.observer.notice(&Notice::MicrophoneDenied {
                    reason: err.to_string(),
                });
                return Err(err.into());
            }
        };
        self.begin_talk(token, handle, Ownership::Owned)
    }

    /// Talk using a microphone handle the caller keeps open. The handle is never stopped here.
    pub fn start_talking_with(&self, handle: Arc<dyn InputHandle>) -> Result<(), SessionError> {
        let Some(token) = self.claim_talk_slot()? else {
            return Ok(());
        };
        self.begin_talk(token, handle, Ownership::Shared)
    }

    /// `None` when talking is already on or starting.
    fn claim_talk_slot(&self) -> Result<Option<u64>, SessionError> {
        let mut state = self.lock();
        if state.blocked {
            return Err(SessionError::Blocked);
        }
        if state.talk.is_some() || state.talk_starting.is_some() {
            return Ok(None);
        }
        state.next_talk_token += 1;
        let token = state.next_talk_token;
        state.talk_starting = Some(token);
        Ok(Some(token))
    }

    fn clear_talk_claim(&self, token: u64) {
        let mut state = self.lock();
        if state.talk_starting == Some(token) {
            state.talk_starting = None;
        }
    }

    fn begin_talk(
        &self,
        token: u64,
        handle: Arc<dyn InputHandle>,
        ownership: Ownership,
    ) -> Result<(), SessionError> {
        let release = |handle: Arc<dyn InputHandle>| {
            if ownership == Ownership::Owned {
                release_input(handle);
            }
        };
        if let Err(err) = self.connect() {
            self.clear_talk_claim(token);
            release(handle);
            return Err(err);
        }

        let mut state = self.lock();
        if state.talk_starting != Some(token) {
            drop(state);
            tracing::info!("talk start cancelled while opening the microphone");
            release(handle);
            return Ok(());
        }
        state.talk_starting = None;
        let blocked = state.blocked;
        let channel = match state.channel.clone() {
            Some(channel) if !blocked => channel,
            _ => {
                drop(state);
                release(handle);
                return Err(if blocked {
                    SessionError::Blocked
                } else {
                    SessionError::Channel(ChannelError::Closed)
                });
            }
        };

        let pipeline = CapturePipeline::start(handle.clone(), ownership, &self.shared.config, move |chunk| {
            let bytes = Bytes::from(chunk.to_le_bytes());
            if let Err(err) = channel.emit_volatile(audio_event::TALK, Payload::Binary(bytes)) {
                tracing::trace!(error = %err, "talk frame dropped");
            }
        });
        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(err) => {
                drop(state);
                release(handle);
                return Err(err.into());
            }
        };

        let announced = state.connected;
        if announced {
            state.send(audio_event::TALK_START, Payload::Empty);
        }
        state.talk = Some(Talk { pipeline, announced });
        drop(state);
        tracing::info!(?ownership, announced, "talking started");
        Ok(())
    }

    /// Stop talking (or cancel a pending start) and tear down capture. Idempotent.
    pub async fn stop_talking(&self) {
        let pipeline = {
            let mut state = self.lock();
            state.talk_starting = None;
            state.take_talk(true)
        };
        if let Some(pipeline) = pipeline {
            retire(pipeline).await;
            tracing::info!("talking stopped");
        }
    }

    /// Set playback volume; returns the clamped value in effect.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let mut state = self.lock();
        state.scheduler.set_volume(volume);
        state.scheduler.volume()
    }

    pub fn volume(&self) -> f32 {
        self.lock().scheduler.volume()
    }

    /// Bring audio back after the host was idle: resume the output and reconnect the channel now
    /// if it is down.
    pub fn resume(&self) {
        if let Err(err) = self.shared.output.resume() {
            tracing::warn!(error = %err, "output resume failed");
        }
        let state = self.lock();
        if let Some(channel) = &state.channel {
            if !state.connected {
                tracing::info!("reconnecting audio channel");
                channel.reconnect_now();
            }
        }
    }

    /// Stop talking and listening and close the channel.
    pub async fn close(&self) {
        let (pipeline, channel) = {
            let mut state = self.lock();
            if state.listen != Listen::Off {
                state.stop_listen();
            }
            state.talk_starting = None;
            let pipeline = state.take_talk(true);
            state.connected = false;
            (pipeline, state.channel.take())
        };
        if let Some(pipeline) = pipeline {
            retire(pipeline).await;
        }
        if let Some(channel) = channel {
            channel.close();
            tracing::info!("audio channel closed");
        }
    }

    /// Apply one channel event.
    pub fn handle_event(&self, event: ChannelEvent) {
        let mut fx = Effects::default();
        {
            let mut state = self.lock();
            match event {
                ChannelEvent::Connected => self.on_connected(&mut state),
                ChannelEvent::Disconnected { reason } => {
                    tracing::warn!(%reason, "audio channel disconnected");
                    state.connected = false;
                    if state.listen == Listen::Active {
                        state.listen = Listen::Suspended;
                    }
                    if let Some(talk) = &mut state.talk {
                        talk.announced = false;
                    }
                }
                ChannelEvent::ConnectError { message } => {
                    tracing::warn!(%message, "audio channel connect error");
                    fx.notices.push(Notice::Channel { message });
                }
                ChannelEvent::ReconnectAttempt { attempt } => {
                    tracing::debug!(attempt, "audio channel reconnecting");
                }
                ChannelEvent::ReconnectFailed => {
                    tracing::error!("audio channel gave up reconnecting");
                    fx.notices.push(Notice::ReconnectFailed);
                }
                ChannelEvent::Message { name, payload } => {
                    self.on_message(&mut state, &name, &payload, &mut fx);
                }
            }
        }
        self.apply(fx);
    }

    fn on_connected(&self, state: &mut State) {
        state.connected = true;
        if state.listen != Listen::Off {
            state.scheduler.reset();
            state.send(audio_event::LISTEN_START, Payload::Empty);
            state.listen = Listen::Active;
        }
        if state.talk.as_ref().is_some_and(|t| !t.announced) {
            state.send(audio_event::TALK_START, Payload::Empty);
            if let Some(talk) = &mut state.talk {
                talk.announced = true;
            }
        }
        tracing::info!(
            listening = state.listen == Listen::Active,
            talking = state.talk.is_some(),
            "audio channel connected"
        );
    }

    fn on_message(&self, state: &mut State, name: &str, payload: &Payload, fx: &mut Effects) {
        match name {
            audio_event::STREAM => {
                if state.listen == Listen::Off {
                    return;
                }
                let Some(bytes) = payload.binary() else {
                    tracing::debug!("ignoring non-binary audio_stream payload");
                    return;
                };
                state.scheduler.play(&AudioChunk::from_le_bytes(bytes));
            }
            audio_event::STATUS => {
                let Some(status) = payload.json::<AudioStatus>() else {
                    tracing::debug!(?payload, "malformed audio_status");
                    return;
                };
                if status.is_talk_rejected() && state.talk.is_some() {
                    tracing::warn!("talk slot busy");
                    fx.stop = state.take_talk(false);
                    fx.notices.push(Notice::TalkRejected {
                        reason: status.error.clone().unwrap_or_default(),
                    });
                }
                fx.status = Some(status);
            }
            audio_event::EXCLUSIVE => {
                let Some(ExclusiveStatus { blocked }) = payload.json::<ExclusiveStatus>() else {
                    tracing::debug!(?payload, "malformed exclusive_status");
                    return;
                };
                state.blocked = blocked;
                if blocked {
                    tracing::info!("exclusive control held elsewhere; stopping local audio");
                    fx.stop = state.take_talk(true);
                    if state.listen != Listen::Off {
                        state.stop_listen();
                    }
                }
                fx.blocked = Some(blocked);
            }
            audio_event::ERROR => {
                let Some(err) = payload.json::<ErrorPayload>() else {
                    tracing::debug!(?payload, "malformed audio_error");
                    return;
                };
                tracing::warn!(code = ?err.code, message = ?err.message, "device audio error");
                if err.code.is_arbitration_rejection() {
                    fx.stop = state.take_talk(false);
                    fx.notices.push(Notice::TalkRejected {
                        reason: err.message.unwrap_or_else(|| format!("{:?}", err.code)),
                    });
                } else {
                    fx.notices.push(Notice::Device {
                        code: err.code,
                        message: err.message,
                    });
                }
            }
            other => tracing::trace!(event = other, "unhandled audio event"),
        }
    }

    fn apply(&self, fx: Effects) {
        if let Some(pipeline) = fx.stop {
            retire_detached(pipeline);
        }
        let observer = &self.shared.observer;
        if let Some(blocked) = fx.blocked {
            observer.blocked_changed(blocked);
        }
        if let Some(status) = &fx.status {
            observer.status(status);
        }
        for notice in &fx.notices {
            observer.notice(notice);
        }
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listen != Listen::Off
    }

    pub fn is_talking(&self) -> bool {
        self.lock().talk.is_some()
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn phase(&self) -> SessionPhase {
        let state = self.lock();
        match (state.channel.is_some(), state.listen != Listen::Off, state.talk.is_some()) {
            (false, _, _) => SessionPhase::Idle,
            (true, true, true) => SessionPhase::ListeningAndTalking,
            (true, true, false) => SessionPhase::Listening,
            (true, false, true) => SessionPhase::Talking,
            (true, false, false) if state.connected => SessionPhase::Connected,
            (true, false, false) => SessionPhase::Connecting,
        }
    }
}

/// Stop `pipeline` on the blocking pool and wait for it.
async fn retire(pipeline: CapturePipeline) {
    if let Err(err) = tokio::task::spawn_blocking(move || pipeline.stop()).await {
        tracing::warn!(error = %err, "capture teardown failed");
    }
}

/// Stop `pipeline` on the blocking pool without waiting.
fn retire_detached(pipeline: CapturePipeline) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || pipeline.stop());
        }
        Err(_) => pipeline.stop(),
    }
}

fn release_input(handle: Arc<dyn InputHandle>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || handle.stop());
        }
        Err(_) => handle.stop(),
    }
}

async fn pump(shared: Weak<Shared>, mut events: ChannelEvents) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        AudioSession { shared }.handle_event(event);
    }
    tracing::debug!("audio event pump finished");
}
