//! Wire types shared between the camlink audio, transport and video crates.
//!
//! Everything here mirrors what the camera device puts on the wire: Socket.IO event names and
//! JSON payloads for the `/audio` namespace, the WebRTC negotiation bodies, and the PCM chunk
//! format used for talk/listen audio.

use serde::{Deserialize, Serialize};

/// Sample rate of all audio sent to or received from the device (Hz).
pub const WIRE_SAMPLE_RATE: u32 = 16_000;

/// Socket.IO namespaces exposed by the device.
pub mod namespace {
    pub const AUDIO: &str = "/audio";
}

/// Event names used on the `/audio` namespace.
pub mod audio_event {
    /// Client -> device: begin streaming microphone audio to this client.
    pub const LISTEN_START: &str = "audio_listen_start";
    /// Client -> device: stop streaming microphone audio.
    pub const LISTEN_STOP: &str = "audio_listen_stop";
    /// Client -> device: claim the speaker.
    pub const TALK_START: &str = "audio_talk_start";
    /// Client -> device: release the speaker.
    pub const TALK_STOP: &str = "audio_talk_stop";
    /// Client -> device: one binary PCM chunk for the speaker.
    pub const TALK: &str = "audio_talk";
    /// Device -> client: one binary PCM chunk from the microphone.
    pub const STREAM: &str = "audio_stream";
    /// Device -> client: [`AudioStatus`](crate::AudioStatus).
    pub const STATUS: &str = "audio_status";
    /// Device -> client: [`ExclusiveStatus`](crate::ExclusiveStatus).
    pub const EXCLUSIVE: &str = "exclusive_status";
    /// Device -> client: [`ErrorPayload`](crate::ErrorPayload).
    pub const ERROR: &str = "audio_error";
}

/// Status reply sent by the device after listen/talk requests.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioStatus {
    /// Whether the device is streaming microphone audio to this client.
    pub listening: bool,
    /// Whether this client holds the speaker.
    #[serde(default)]
    pub talking: Option<bool>,
    /// Number of clients currently talking.
    #[serde(default)]
    pub talking_clients: Option<u32>,
    /// Short machine-readable rejection reason (for example `talk_slot_busy`).
    #[serde(default)]
    pub error: Option<String>,
}

impl AudioStatus {
    /// `true` when the device refused a talk request because another client holds the speaker.
    pub fn is_talk_rejected(&self) -> bool {
        self.error.as_deref() == Some("talk_slot_busy")
    }
}

/// Exclusive control notification: only one client may drive interactive audio/video.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExclusiveStatus {
    pub blocked: bool,
}

/// Machine-readable error codes reported by the device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TalkSlotBusy,
    SenderBusy,
    ExclusiveBlocked,
    AuthRequired,
    AuthInvalid,
    InvalidParameter,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Codes that mean another client won exclusive control.
    pub fn is_arbitration_rejection(self) -> bool {
        matches!(
            self,
            ErrorCode::TalkSlotBusy | ErrorCode::SenderBusy | ErrorCode::ExclusiveBlocked
        )
    }
}

/// Error event payload (`{"code": "...", "message": "..."}`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: Option<String>,
}

/// SDP type tag used by the negotiation endpoint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Body of `POST /api/webrtc/offer`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

/// Reply of `POST /api/webrtc/offer`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OfferAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Server-side peer id, used later to release the session.
    pub pc_id: String,
}

/// One block of wire audio: mono signed 16-bit PCM at [`WIRE_SAMPLE_RATE`].
///
/// Chunks are immutable once built. On the wire they travel as little-endian bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioChunk {
    samples: Vec<i16>,
}

impl AudioChunk {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Decode little-endian PCM bytes. A trailing odd byte is ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self { samples }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
