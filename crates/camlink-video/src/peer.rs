//! Peer connection seam and its webrtc-rs implementation.
//!
//! The controller only sees [`PeerFactory`] / [`PeerSession`] plus a stream of [`PeerEvent`]s
//! tagged with the session generation they belong to, so stale events from a torn-down peer can
//! be told apart from the current one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use crate::error::VideoError;

/// Overall peer connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Connectivity-check (ICE) layer state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Remote media track announced by the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackInfo {
    pub kind: String,
    pub codec: String,
    pub ssrc: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connection(PeerState),
    Ice(IceState),
    Track(TrackInfo),
}

/// One received RTP packet.
#[derive(Clone, Debug)]
pub struct RtpPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
}

/// Where video ends up: remote tracks while peer-to-peer, still frames while in fallback.
pub trait VideoSink: Send + Sync {
    fn track_started(&self, _track: &TrackInfo) {}
    fn rtp(&self, _track: &TrackInfo, _packet: &RtpPacket) {}
    fn fallback_frame(&self, _jpeg: &Bytes) {}
}

/// Sink that discards everything.
pub struct NullSink;

impl VideoSink for NullSink {}

/// Sends peer events tagged with the generation of the session that produced them.
#[derive(Clone, Debug)]
pub struct PeerEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Returns `false` once the controller has gone away.
    pub fn send(&self, event: PeerEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// One receive-only peer session.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Create the local offer and wait for candidate gathering (bounded by `gather_timeout`).
    /// Returns the offer SDP including gathered candidates.
    async fn create_offer(&self, gather_timeout: Duration) -> Result<String, VideoError>;

    async fn apply_answer(&self, sdp: String) -> Result<(), VideoError>;

    /// Close the peer. Events are no longer delivered afterwards.
    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: PeerEventSender,
        sink: Arc<dyn VideoSink>,
    ) -> Result<Arc<dyn PeerSession>, VideoError>;
}

/// Builds webrtc-rs peer connections restricted to receiving one video track.
#[derive(Clone, Debug, Default)]
pub struct WebRtcPeerFactory {
    /// STUN/TURN urls; empty on a private network.
    pub ice_servers: Vec<String>,
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: PeerEventSender,
        sink: Arc<dyn VideoSink>,
    ) -> Result<Arc<dyn PeerSession>, VideoError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: Vec::new(),
            }),
        )
        .await?;

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(state) = map_peer_state(state) {
                tx.send(PeerEvent::Connection(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            if let Some(state) = map_ice_state(state) {
                tx.send(PeerEvent::Ice(state));
            }
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_track(Box::new(move |track, _, _| {
            let tx = tx.clone();
            let sink = sink.clone();
            tokio::spawn(forward_track(track, tx, sink));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

async fn forward_track(track: Arc<TrackRemote>, events: PeerEventSender, sink: Arc<dyn VideoSink>) {
    let info = TrackInfo {
        kind: track.kind().to_string(),
        codec: track.codec().capability.mime_type,
        ssrc: track.ssrc(),
    };
    tracing::info!(kind = %info.kind, codec = %info.codec, ssrc = info.ssrc, "remote track");
    events.send(PeerEvent::Track(info.clone()));
    sink.track_started(&info);

    let mut packets: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                packets += 1;
                sink.rtp(
                    &info,
                    &RtpPacket {
                        sequence: packet.header.sequence_number,
                        timestamp: packet.header.timestamp,
                        marker: packet.header.marker,
                        payload: packet.payload,
                    },
                );
            }
            Err(err) => {
                tracing::debug!(ssrc = info.ssrc, packets, error = %err, "remote track ended");
                break;
            }
        }
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn create_offer(&self, gather_timeout: Duration) -> Result<String, VideoError> {
        let offer = self.pc.create_offer(None).await?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await?;
        if tokio::time::timeout(gather_timeout, gathered.recv()).await.is_err() {
            tracing::warn!(
                timeout_ms = gather_timeout.as_millis() as u64,
                "ICE gathering timed out; sending partial offer"
            );
        }
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| VideoError::Negotiation("local description unavailable".to_string()))?;
        Ok(local.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), VideoError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(error = %err, "peer close failed");
        }
    }
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => return None,
    })
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unspecified_states_are_not_reported() {
        assert_eq!(map_peer_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(map_ice_state(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Failed),
            Some(PeerState::Failed)
        );
        assert_eq!(map_ice_state(RTCIceConnectionState::Failed), Some(IceState::Failed));
    }

    #[test]
    fn sender_tags_events_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = PeerEventSender::new(7, tx);
        assert!(sender.send(PeerEvent::Connection(PeerState::Connected)));
        assert_eq!(
            rx.try_recv().unwrap(),
            (7, PeerEvent::Connection(PeerState::Connected))
        );
        drop(rx);
        assert!(!sender.send(PeerEvent::Ice(IceState::Failed)));
    }
}
