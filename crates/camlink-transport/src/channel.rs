//! Transport-agnostic event channel interface.
//!
//! Sessions talk to the device through an [`EventChannel`] obtained from a [`ChannelFactory`].
//! Lifecycle and application events arrive on the paired [`ChannelEvents`] receiver.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Event argument carried by a channel message.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Empty,
    Json(serde_json::Value),
    Binary(Bytes),
}

impl Payload {
    /// Deserialize a JSON payload into `T`; `None` for non-JSON or mismatched payloads.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }

    pub fn binary(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Lifecycle and application events delivered by a channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    /// Namespace handshake completed (initial connect or reconnect).
    Connected,
    /// Transport lost; `reason` follows Socket.IO naming (`transport close`, `ping timeout`, ...).
    Disconnected { reason: String },
    /// A connect attempt failed before the namespace handshake completed.
    ConnectError { message: String },
    /// About to start reconnect attempt number `attempt` (1-based).
    ReconnectAttempt { attempt: u32 },
    /// Reconnection gave up (attempt limit reached or disabled).
    ReconnectFailed,
    /// Named application event.
    Message { name: String, payload: Payload },
}

/// Receiving half of a channel.
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("invalid url: {0}")]
    Url(String),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("connect rejected: {0}")]
    Rejected(String),
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

/// Bidirectional, namespaced event channel with automatic reconnection.
///
/// All methods are non-blocking; sends are queued to the channel's I/O task.
pub trait EventChannel: Send + Sync {
    /// Queue an event. Events emitted while disconnected are buffered and flushed on connect.
    fn emit(&self, event: &str, payload: Payload) -> Result<(), ChannelError>;

    /// Queue an event that is silently dropped if the channel is not connected.
    fn emit_volatile(&self, event: &str, payload: Payload) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;

    /// Skip any pending reconnect delay and try to connect right away.
    fn reconnect_now(&self);

    /// Disconnect and stop reconnecting. Idempotent.
    fn close(&self);
}

/// Opens channels to a namespace on the device.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, namespace: &str) -> Result<(Arc<dyn EventChannel>, ChannelEvents), ChannelError>;
}
