//! Resilient video transport for the camera.
//!
//! [`controller::VideoTransport`] drives a receive-only WebRTC session with bounded retry and
//! falls back to polling still frames ([`fallback`]) when the peer connection cannot be kept up.

pub mod config;
pub mod controller;
pub mod error;
pub mod fallback;
pub mod peer;
pub mod signaling;
pub mod state;

pub use config::{FallbackConfig, VideoConfig};
pub use controller::{VideoDeps, VideoObserver, VideoTransport};
pub use error::VideoError;
pub use fallback::{FallbackStream, FrameSource, HttpFrameSource};
pub use peer::{NullSink, PeerFactory, PeerSession, VideoSink, WebRtcPeerFactory};
pub use signaling::{HttpSignaling, Signaling};
pub use state::VideoState;
