//! Event transport for talking to the camera device.
//!
//! [`channel`] defines the transport-agnostic interface the sessions depend on; [`socketio`]
//! implements it with a Socket.IO client over websockets.

pub mod backoff;
pub mod channel;
pub mod packet;
pub mod socketio;

pub use backoff::ReconnectPolicy;
pub use channel::{ChannelError, ChannelEvent, ChannelEvents, ChannelFactory, EventChannel, Payload};
pub use socketio::{SocketIoChannel, SocketIoConfig, SocketIoFactory};
