//! Video transport state machine.
//!
//! [`VideoTransport`] is a handle to a single tokio task that owns all video state. Commands,
//! peer events, negotiation results and timers are all messages into that task's loop, so
//! transitions never interleave. Peer events and negotiation results carry the generation of
//! the session that produced them; anything from an older generation, or arriving after
//! `close()`, is dropped (its server-side session is still released).
//!
//! Retry policy:
//! - peer "failed" (connection or ICE layer, counted once per session) or a failed negotiation
//!   consumes one retry and waits `base * 2^(n-1)`;
//! - peer "disconnected" consumes one retry and waits a flat `disconnect_delay`;
//! - with the budget spent, the next failure demotes to the fallback stream and arms a periodic
//!   probe that resets the budget and tries peer-to-peer again.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;

use camlink_types::{OfferRequest, SdpKind};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::config::{FallbackConfig, VideoConfig};
use crate::error::VideoError;
use crate::fallback::{FallbackStream, FrameSource};
use crate::peer::{IceState, PeerEvent, PeerEventSender, PeerFactory, PeerSession, PeerState, VideoSink};
use crate::signaling::Signaling;
use crate::state::VideoState;

/// Callbacks for the UI layer, invoked synchronously inside the transition that causes them.
pub trait VideoObserver: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
    fn on_fallback(&self) {}
    fn on_negotiation_failed(&self, _error: &VideoError) {}
}

/// Collaborators injected into the state machine.
pub struct VideoDeps {
    pub peers: Arc<dyn PeerFactory>,
    pub signaling: Arc<dyn Signaling>,
    pub frames: Arc<dyn FrameSource>,
    pub observer: Arc<dyn VideoObserver>,
}

enum Command {
    Connect {
        sink: Arc<dyn VideoSink>,
        reply: oneshot::Sender<bool>,
    },
    ShowFallback,
    Close,
}

/// Handle to the video state machine. Dropping it closes the transport.
pub struct VideoTransport {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<VideoState>,
}

impl VideoTransport {
    /// Spawn the state machine on the current tokio runtime.
    pub fn spawn(config: VideoConfig, fallback: FallbackConfig, deps: VideoDeps) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VideoState::Idle);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            fallback: FallbackStream::new(deps.frames.clone(), &fallback),
            config,
            deps,
            state_tx,
            cmd_rx,
            peer_tx,
            peer_rx,
            result_tx,
            result_rx,
            sink: None,
            closing: false,
            generation: 0,
            retry_count: 0,
            failure_reported: false,
            session: None,
            reply: None,
            retry_timer: None,
            probe_timer: None,
        };
        tokio::spawn(actor.run());
        Self { cmd_tx, state_rx }
    }

    /// Start (or restart) video into `sink`.
    ///
    /// Resolves once the first negotiation round finishes: `true` if the offer/answer exchange
    /// succeeded, `false` if it failed or was superseded. Either way the state machine keeps
    /// retrying on its own until [`close`](Self::close).
    pub async fn connect(&self, sink: Arc<dyn VideoSink>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Connect { sink, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Show still frames in the connected sink while peer-to-peer video keeps retrying.
    ///
    /// Does not change the state or the retry budget. Frames stop as soon as the peer
    /// connects. Ignored when idle or already connected.
    pub fn show_fallback(&self) {
        let _ = self.cmd_tx.send(Command::ShowFallback);
    }

    /// Stop everything and go idle. No callbacks fire until the next `connect`.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }

    pub fn state(&self) -> VideoState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == VideoState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<VideoState> {
        self.state_rx.clone()
    }
}

/// Live peer session plus the id the device issued for it.
struct Session {
    peer: Arc<dyn PeerSession>,
    pc_id: String,
}

enum Negotiated {
    Ready(Session),
    Failed {
        peer: Option<Arc<dyn PeerSession>>,
        pc_id: Option<String>,
        error: VideoError,
    },
}

struct Actor {
    config: VideoConfig,
    deps: VideoDeps,
    fallback: FallbackStream,
    state_tx: watch::Sender<VideoState>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    peer_tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
    peer_rx: mpsc::UnboundedReceiver<(u64, PeerEvent)>,
    result_tx: mpsc::UnboundedSender<(u64, Negotiated)>,
    result_rx: mpsc::UnboundedReceiver<(u64, Negotiated)>,
    sink: Option<Arc<dyn VideoSink>>,
    closing: bool,
    generation: u64,
    retry_count: u32,
    /// A failure was already counted for the current generation.
    failure_reported: bool,
    session: Option<Session>,
    reply: Option<oneshot::Sender<bool>>,
    retry_timer: Option<Pin<Box<Sleep>>>,
    probe_timer: Option<Interval>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Connect { sink, reply }) => self.on_connect(sink, reply),
                    Some(Command::ShowFallback) => self.show_fallback(),
                    Some(Command::Close) => self.close(),
                    None => {
                        self.close();
                        break;
                    }
                },
                Some((generation, event)) = self.peer_rx.recv() => {
                    self.on_peer_event(generation, event);
                }
                Some((generation, result)) = self.result_rx.recv() => {
                    self.on_negotiated(generation, result);
                }
                _ = wait_retry(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    tracing::debug!(retry = self.retry_count, "retry timer fired");
                    self.start_session();
                }
                _ = wait_probe(&mut self.probe_timer) => {
                    tracing::info!("probing peer-to-peer video from fallback");
                    self.probe_timer = None;
                    self.retry_count = 0;
                    self.start_session();
                }
            }
        }
        tracing::debug!("video transport stopped");
    }

    fn set_state(&self, state: VideoState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(from = %*current, to = %state, "video state");
            *current = state;
            true
        });
    }

    fn on_connect(&mut self, sink: Arc<dyn VideoSink>, reply: oneshot::Sender<bool>) {
        tracing::info!("video connect requested");
        self.closing = false;
        self.sink = Some(sink);
        self.retry_count = 0;
        self.probe_timer = None;
        self.reply = Some(reply);
        self.start_session();
    }

    /// Tear down the current session and negotiate a new one.
    fn start_session(&mut self) {
        if self.closing {
            return;
        }
        let Some(sink) = self.sink.clone() else {
            return;
        };
        self.retry_timer = None;
        self.teardown_session();
        self.generation += 1;
        self.failure_reported = false;
        self.set_state(VideoState::Connecting);

        let generation = self.generation;
        let events = PeerEventSender::new(generation, self.peer_tx.clone());
        let peers = self.deps.peers.clone();
        let signaling = self.deps.signaling.clone();
        let gather_timeout = self.config.gather_timeout;
        let results = self.result_tx.clone();
        tracing::debug!(generation, retry = self.retry_count, "negotiating video session");
        tokio::spawn(async move {
            let outcome = negotiate(peers, signaling, events, sink, gather_timeout).await;
            let _ = results.send((generation, outcome));
        });
    }

    fn on_negotiated(&mut self, generation: u64, outcome: Negotiated) {
        if generation != self.generation || self.closing {
            tracing::debug!(generation, current = self.generation, "discarding stale negotiation");
            let (peer, pc_id) = match outcome {
                Negotiated::Ready(session) => (Some(session.peer), Some(session.pc_id)),
                Negotiated::Failed { peer, pc_id, .. } => (peer, pc_id),
            };
            self.dispose(peer, pc_id);
            return;
        }

        match outcome {
            Negotiated::Ready(session) => {
                tracing::info!(pc_id = %session.pc_id, "video session negotiated");
                self.session = Some(session);
                self.answer(true);
            }
            Negotiated::Failed { peer, pc_id, error } => {
                tracing::warn!(error = %error, retry = self.retry_count, "video negotiation failed");
                self.dispose(peer, pc_id);
                self.deps.observer.on_negotiation_failed(&error);
                self.answer(false);
                if !self.failure_reported {
                    self.failure_reported = true;
                    self.schedule_retry(None);
                }
            }
        }
    }

    fn on_peer_event(&mut self, generation: u64, event: PeerEvent) {
        if generation != self.generation || self.closing {
            tracing::trace!(generation, ?event, "ignoring stale peer event");
            return;
        }
        match event {
            PeerEvent::Connection(PeerState::Connected) => {
                tracing::info!("video connected");
                self.retry_count = 0;
                self.retry_timer = None;
                self.probe_timer = None;
                self.fallback.stop();
                self.set_state(VideoState::Connected);
                self.deps.observer.on_connected();
            }
            PeerEvent::Connection(PeerState::Disconnected) => {
                tracing::warn!("video transport disconnected");
                self.set_state(VideoState::Disconnected);
                self.schedule_retry(Some(self.config.disconnect_delay));
            }
            PeerEvent::Connection(PeerState::Failed) | PeerEvent::Ice(IceState::Failed) => {
                if self.failure_reported {
                    return;
                }
                self.failure_reported = true;
                tracing::warn!(?event, "video transport failed");
                self.set_state(VideoState::Disconnected);
                self.deps.observer.on_disconnected();
                self.schedule_retry(None);
            }
            PeerEvent::Track(track) => {
                tracing::debug!(kind = %track.kind, codec = %track.codec, "video track attached");
            }
            other => tracing::trace!(?other, "peer event"),
        }
    }

    /// Arm the retry timer, or demote to fallback once the budget is spent.
    /// `flat` overrides the exponential delay.
    fn schedule_retry(&mut self, flat: Option<std::time::Duration>) {
        if self.closing {
            return;
        }
        self.retry_timer = None;

        if self.retry_count >= self.config.max_retries {
            self.enter_fallback();
            return;
        }

        self.retry_count += 1;
        let delay = flat.unwrap_or_else(|| self.config.backoff(self.retry_count));
        tracing::info!(
            retry = self.retry_count,
            max = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "video retry scheduled"
        );
        self.set_state(VideoState::Retrying);
        self.retry_timer = Some(Box::pin(tokio::time::sleep(delay)));
    }

    fn show_fallback(&mut self) {
        if self.closing || *self.state_tx.borrow() == VideoState::Connected {
            return;
        }
        if let Some(sink) = self.sink.clone() {
            self.fallback.start(sink);
        }
    }

    fn enter_fallback(&mut self) {
        tracing::warn!(
            retries = self.retry_count,
            probe_s = self.config.fallback_probe.as_secs(),
            "video retries exhausted, falling back to still frames"
        );
        self.teardown_session();
        self.set_state(VideoState::Fallback);
        self.deps.observer.on_fallback();
        if let Some(sink) = self.sink.clone() {
            self.fallback.start(sink);
        }
        let period = self.config.fallback_probe;
        let mut probe = tokio::time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.probe_timer = Some(probe);
    }

    fn close(&mut self) {
        if !self.closing {
            tracing::info!("video transport closing");
        }
        self.closing = true;
        self.retry_timer = None;
        self.probe_timer = None;
        self.fallback.stop();
        self.teardown_session();
        self.generation += 1;
        self.answer(false);
        self.set_state(VideoState::Idle);
    }

    fn answer(&mut self, ok: bool) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(ok);
        }
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.dispose(Some(session.peer), Some(session.pc_id));
        }
    }

    /// Close a peer and release its server session without waiting for either.
    fn dispose(&self, peer: Option<Arc<dyn PeerSession>>, pc_id: Option<String>) {
        if peer.is_none() && pc_id.is_none() {
            return;
        }
        let signaling = self.deps.signaling.clone();
        tokio::spawn(async move {
            if let Some(peer) = peer {
                peer.close().await;
            }
            if let Some(pc_id) = pc_id {
                match signaling.release(&pc_id).await {
                    Ok(()) => tracing::debug!(%pc_id, "video session released"),
                    Err(err) => tracing::debug!(%pc_id, error = %err, "video session release failed"),
                }
            }
        });
    }
}

async fn negotiate(
    peers: Arc<dyn PeerFactory>,
    signaling: Arc<dyn Signaling>,
    events: PeerEventSender,
    sink: Arc<dyn VideoSink>,
    gather_timeout: std::time::Duration,
) -> Negotiated {
    let peer = match peers.create(events, sink).await {
        Ok(peer) => peer,
        Err(error) => {
            return Negotiated::Failed {
                peer: None,
                pc_id: None,
                error,
            };
        }
    };
    let failed = |peer: Arc<dyn PeerSession>, pc_id: Option<String>, error: VideoError| {
        Negotiated::Failed {
            peer: Some(peer),
            pc_id,
            error,
        }
    };

    let sdp = match peer.create_offer(gather_timeout).await {
        Ok(sdp) => sdp,
        Err(error) => return failed(peer, None, error),
    };
    let answer = match signaling
        .post_offer(OfferRequest {
            sdp,
            kind: SdpKind::Offer,
        })
        .await
    {
        Ok(answer) => answer,
        Err(error) => return failed(peer, None, error),
    };
    let pc_id = answer.pc_id;
    match peer.apply_answer(answer.sdp).await {
        Ok(()) => Negotiated::Ready(Session { peer, pc_id }),
        Err(error) => failed(peer, Some(pc_id), error),
    }
}

async fn wait_retry(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn wait_probe(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use camlink_types::OfferAnswer;

    use crate::fallback::tests::{CountingSource, FrameRecorder};

    struct FakePeer {
        events: PeerEventSender,
        closed: AtomicBool,
    }

    impl FakePeer {
        fn emit(&self, event: PeerEvent) {
            self.events.send(event);
        }

        fn fail(&self) {
            self.emit(PeerEvent::Connection(PeerState::Failed));
        }
    }

    #[async_trait]
    impl PeerSession for FakePeer {
        async fn create_offer(&self, _gather_timeout: Duration) -> Result<String, VideoError> {
            Ok("v=0 offer".to_string())
        }

        async fn apply_answer(&self, _sdp: String) -> Result<(), VideoError> {
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Reports every created peer (with its creation time) to the test.
    struct FakePeers {
        created: mpsc::UnboundedSender<(Instant, Arc<FakePeer>)>,
    }

    #[async_trait]
    impl PeerFactory for FakePeers {
        async fn create(
            &self,
            events: PeerEventSender,
            _sink: Arc<dyn VideoSink>,
        ) -> Result<Arc<dyn PeerSession>, VideoError> {
            let peer = Arc::new(FakePeer {
                events,
                closed: AtomicBool::new(false),
            });
            let _ = self.created.send((Instant::now(), peer.clone()));
            Ok(peer)
        }
    }

    #[derive(Default)]
    struct FakeSignaling {
        delay: Duration,
        rejections: Mutex<VecDeque<bool>>,
        issued: Mutex<u32>,
        released: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Signaling for FakeSignaling {
        async fn post_offer(&self, offer: OfferRequest) -> Result<OfferAnswer, VideoError> {
            assert_eq!(offer.kind, SdpKind::Offer);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.rejections.lock().unwrap().pop_front().unwrap_or(false) {
                return Err(VideoError::Negotiation("server returned 500".to_string()));
            }
            let mut issued = self.issued.lock().unwrap();
            *issued += 1;
            Ok(OfferAnswer {
                sdp: "v=0 answer".to_string(),
                kind: SdpKind::Answer,
                pc_id: format!("pc-{issued}"),
            })
        }

        async fn release(&self, pc_id: &str) -> Result<(), VideoError> {
            self.released.lock().unwrap().push(pc_id.to_string());
            Ok(())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Seen {
        Connected,
        Disconnected,
        Fallback,
        NegotiationFailed,
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<(Instant, Seen)>,
    }

    impl VideoObserver for Recorder {
        fn on_connected(&self) {
            let _ = self.tx.send((Instant::now(), Seen::Connected));
        }
        fn on_disconnected(&self) {
            let _ = self.tx.send((Instant::now(), Seen::Disconnected));
        }
        fn on_fallback(&self) {
            let _ = self.tx.send((Instant::now(), Seen::Fallback));
        }
        fn on_negotiation_failed(&self, _error: &VideoError) {
            let _ = self.tx.send((Instant::now(), Seen::NegotiationFailed));
        }
    }

    struct Harness {
        transport: VideoTransport,
        created: mpsc::UnboundedReceiver<(Instant, Arc<FakePeer>)>,
        seen: mpsc::UnboundedReceiver<(Instant, Seen)>,
        signaling: Arc<FakeSignaling>,
        frames: Arc<CountingSource>,
        sink: Arc<FrameRecorder>,
    }

    impl Harness {
        fn new(config: VideoConfig, signaling: FakeSignaling) -> Self {
            let (created_tx, created) = mpsc::unbounded_channel();
            let (seen_tx, seen) = mpsc::unbounded_channel();
            let signaling = Arc::new(signaling);
            let frames = Arc::new(CountingSource::default());
            let transport = VideoTransport::spawn(
                config,
                FallbackConfig::default(),
                VideoDeps {
                    peers: Arc::new(FakePeers { created: created_tx }),
                    signaling: signaling.clone(),
                    frames: frames.clone(),
                    observer: Arc::new(Recorder { tx: seen_tx }),
                },
            );
            Self {
                transport,
                created,
                seen,
                signaling,
                frames,
                sink: Arc::new(FrameRecorder::default()),
            }
        }

        async fn connect(&self) -> bool {
            self.transport.connect(self.sink.clone()).await
        }

        async fn next_peer(&mut self) -> (Instant, Arc<FakePeer>) {
            self.created.recv().await.unwrap()
        }

        async fn next_seen(&mut self) -> (Instant, Seen) {
            self.seen.recv().await.unwrap()
        }

        /// Let spawned tasks run without moving the clock far.
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connected_only_after_transport_reports_it() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        assert!(h.connect().await);
        let (_, peer) = h.next_peer().await;
        assert_eq!(h.transport.state(), VideoState::Connecting);
        assert!(!h.transport.is_connected());

        peer.emit(PeerEvent::Connection(PeerState::Connected));
        assert_eq!(h.next_seen().await.1, Seen::Connected);
        assert!(h.transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn five_failures_back_off_then_fall_back_with_probe() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        assert!(h.connect().await);
        let (_, mut peer) = h.next_peer().await;

        let mut delays = Vec::new();
        for _ in 0..5 {
            let failed_at = Instant::now();
            peer.fail();
            assert_eq!(h.next_seen().await.1, Seen::Disconnected);
            let (created_at, next) = h.next_peer().await;
            delays.push((created_at - failed_at).as_secs());
            peer = next;
        }
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);

        peer.fail();
        assert_eq!(h.next_seen().await.1, Seen::Disconnected);
        let (fallback_at, seen) = h.next_seen().await;
        assert_eq!(seen, Seen::Fallback);
        assert_eq!(h.transport.state(), VideoState::Fallback);

        // No backoff retry while in fallback; still frames flow instead.
        let quiet = tokio::time::timeout(Duration::from_secs(59), h.created.recv()).await;
        assert!(quiet.is_err());
        assert!(!h.sink.frames.lock().unwrap().is_empty());
        assert!(h.seen.try_recv().is_err());

        let (probe_at, _) = h.next_peer().await;
        assert_eq!(probe_at - fallback_at, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_cancels_fallback() {
        let config = VideoConfig {
            max_retries: 1,
            ..VideoConfig::default()
        };
        let mut h = Harness::new(config, FakeSignaling::default());
        h.connect().await;
        let (_, peer) = h.next_peer().await;
        peer.fail();
        let (_, peer) = h.next_peer().await;
        peer.fail();
        assert_eq!(h.next_seen().await.1, Seen::Disconnected);
        assert_eq!(h.next_seen().await.1, Seen::Disconnected);
        assert_eq!(h.next_seen().await.1, Seen::Fallback);

        let (_, probe) = h.next_peer().await;
        probe.emit(PeerEvent::Connection(PeerState::Connected));
        assert_eq!(h.next_seen().await.1, Seen::Connected);
        let fetched = h.frames.calls.load(Ordering::SeqCst);

        let quiet = tokio::time::timeout(Duration::from_secs(300), h.created.recv()).await;
        assert!(quiet.is_err());
        assert_eq!(h.frames.calls.load(Ordering::SeqCst), fetched);
        assert_eq!(h.transport.state(), VideoState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_runs_budget_again_then_falls_back() {
        let config = VideoConfig {
            max_retries: 1,
            ..VideoConfig::default()
        };
        let mut h = Harness::new(config, FakeSignaling::default());
        h.connect().await;
        for _ in 0..2 {
            let (_, peer) = h.next_peer().await;
            peer.fail();
        }
        let mut fallbacks = 0;
        while fallbacks < 1 {
            if h.next_seen().await.1 == Seen::Fallback {
                fallbacks += 1;
            }
        }

        // Probe fails, one retry fails, fallback again.
        for _ in 0..2 {
            let (_, peer) = h.next_peer().await;
            peer.fail();
        }
        while fallbacks < 2 {
            if h.next_seen().await.1 == Seen::Fallback {
                fallbacks += 1;
            }
        }
        assert_eq!(h.transport.state(), VideoState::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_retries_after_flat_delay() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        h.connect().await;
        let (_, peer) = h.next_peer().await;
        peer.emit(PeerEvent::Connection(PeerState::Connected));
        assert_eq!(h.next_seen().await.1, Seen::Connected);

        let dropped_at = Instant::now();
        peer.emit(PeerEvent::Connection(PeerState::Disconnected));
        h.settle().await;
        assert_eq!(h.transport.state(), VideoState::Retrying);
        let (created_at, _) = h.next_peer().await;
        assert_eq!(created_at - dropped_at, Duration::from_secs(5));
        h.settle().await;
        assert!(h.seen.try_recv().is_err());
        assert!(peer.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn peer_and_ice_failure_count_once() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        h.connect().await;
        let (_, peer) = h.next_peer().await;

        let failed_at = Instant::now();
        peer.emit(PeerEvent::Ice(IceState::Failed));
        peer.fail();
        let (created_at, _) = h.next_peer().await;
        assert_eq!(created_at - failed_at, Duration::from_secs(2));
        assert_eq!(h.next_seen().await.1, Seen::Disconnected);
        assert!(h.seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn negotiation_failure_reports_false_and_backs_off() {
        let signaling = FakeSignaling {
            rejections: Mutex::new(VecDeque::from([true])),
            ..Default::default()
        };
        let mut h = Harness::new(VideoConfig::default(), signaling);
        let started = Instant::now();
        assert!(!h.connect().await);
        let (_, first) = h.next_peer().await;
        assert_eq!(h.next_seen().await.1, Seen::NegotiationFailed);

        let (created_at, _) = h.next_peer().await;
        assert_eq!(created_at - started, Duration::from_secs(2));
        h.settle().await;
        assert!(first.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn still_frames_cover_retries_after_failed_first_offer() {
        let signaling = FakeSignaling {
            rejections: Mutex::new(VecDeque::from([true])),
            ..Default::default()
        };
        let mut h = Harness::new(VideoConfig::default(), signaling);
        let started = Instant::now();
        assert!(!h.connect().await);
        h.transport.show_fallback();
        let _ = h.next_peer().await;

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!h.sink.frames.lock().unwrap().is_empty());
        assert_eq!(h.transport.state(), VideoState::Retrying);

        // Retries keep their schedule; the peer connecting stops the frames.
        let (created_at, peer) = h.next_peer().await;
        assert_eq!(created_at - started, Duration::from_secs(2));
        peer.emit(PeerEvent::Connection(PeerState::Connected));
        loop {
            if h.next_seen().await.1 == Seen::Connected {
                break;
            }
        }
        let fetched = h.frames.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.frames.calls.load(Ordering::SeqCst), fetched);
        assert!(h.seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn show_fallback_is_ignored_while_connected() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        assert!(h.connect().await);
        let (_, peer) = h.next_peer().await;
        peer.emit(PeerEvent::Connection(PeerState::Connected));
        assert_eq!(h.next_seen().await.1, Seen::Connected);

        h.transport.show_fallback();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.frames.calls.load(Ordering::SeqCst), 0);
        assert!(h.sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_suppresses_callbacks_and_releases_session() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        assert!(h.connect().await);
        let (_, peer) = h.next_peer().await;

        h.transport.close();
        h.settle().await;
        assert_eq!(h.transport.state(), VideoState::Idle);
        assert!(peer.closed.load(Ordering::SeqCst));
        assert_eq!(*h.signaling.released.lock().unwrap(), vec!["pc-1".to_string()]);

        peer.fail();
        peer.emit(PeerEvent::Connection(PeerState::Connected));
        let quiet = tokio::time::timeout(Duration::from_secs(600), h.created.recv()).await;
        assert!(quiet.is_err());
        assert!(h.seen.try_recv().is_err());
        assert_eq!(h.transport.state(), VideoState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn result_arriving_after_close_is_discarded() {
        let signaling = FakeSignaling {
            delay: Duration::from_secs(3),
            ..Default::default()
        };
        let mut h = Harness::new(VideoConfig::default(), signaling);
        let transport = &h.transport;
        let sink = h.sink.clone();
        let (ok, _) = tokio::join!(transport.connect(sink), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            transport.close();
        });
        assert!(!ok);

        let (_, peer) = h.next_peer().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(peer.closed.load(Ordering::SeqCst));
        assert_eq!(*h.signaling.released.lock().unwrap(), vec!["pc-1".to_string()]);
        assert_eq!(h.transport.state(), VideoState::Idle);
        assert!(h.seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_supersedes_previous_session() {
        let mut h = Harness::new(VideoConfig::default(), FakeSignaling::default());
        assert!(h.connect().await);
        let (_, first) = h.next_peer().await;
        assert!(h.connect().await);
        let (_, second) = h.next_peer().await;
        h.settle().await;

        assert!(first.closed.load(Ordering::SeqCst));
        assert_eq!(*h.signaling.released.lock().unwrap(), vec!["pc-1".to_string()]);

        // Events from the superseded peer are ignored.
        first.fail();
        second.emit(PeerEvent::Connection(PeerState::Connected));
        assert_eq!(h.next_seen().await.1, Seen::Connected);
        assert!(h.transport.is_connected());
    }
}
