//! Engine.IO v4 / Socket.IO v5 text packet codec.
//!
//! Engine.IO frames over a websocket are a single type digit followed by an optional body.
//! Socket.IO packets ride inside Engine.IO `message` frames:
//!
//! ```text
//! <type>[<attachments>-][<namespace>,][<ack id>][<json>]
//! ```
//!
//! Binary attachments follow a `BINARY_EVENT` as raw websocket binary frames and are referenced
//! from the JSON by `{"_placeholder":true,"num":N}`.

use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::channel::{ChannelError, Payload};

/// Handshake data sent by the server in the Engine.IO `open` packet.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

impl OpenInfo {
    /// Silence tolerated before the transport is considered dead.
    pub fn liveness_window(&self) -> Duration {
        let ms = self.ping_interval.saturating_add(self.ping_timeout);
        if ms == 0 {
            Duration::from_secs(45)
        } else {
            Duration::from_millis(ms)
        }
    }
}

/// Engine.IO packet carried in a websocket text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Message(String),
    Upgrade,
    Noop,
}

pub fn decode_engine(text: &str) -> Result<EnginePacket, ChannelError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| ChannelError::Protocol("empty engine packet".to_string()))?;
    let body = chars.as_str();
    match kind {
        '0' => serde_json::from_str(body)
            .map(EnginePacket::Open)
            .map_err(|e| ChannelError::Protocol(format!("bad open packet: {e}"))),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping),
        '3' => Ok(EnginePacket::Pong),
        '4' => Ok(EnginePacket::Message(body.to_string())),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(ChannelError::Protocol(format!("unknown engine packet type {other:?}"))),
    }
}

pub const ENGINE_PONG: &str = "3";

/// Socket.IO packet types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    fn from_digit(c: char) -> Option<Self> {
        Some(match c {
            '0' => PacketKind::Connect,
            '1' => PacketKind::Disconnect,
            '2' => PacketKind::Event,
            '3' => PacketKind::Ack,
            '4' => PacketKind::ConnectError,
            '5' => PacketKind::BinaryEvent,
            '6' => PacketKind::BinaryAck,
            _ => return None,
        })
    }

    fn digit(self) -> char {
        match self {
            PacketKind::Connect => '0',
            PacketKind::Disconnect => '1',
            PacketKind::Event => '2',
            PacketKind::Ack => '3',
            PacketKind::ConnectError => '4',
            PacketKind::BinaryEvent => '5',
            PacketKind::BinaryAck => '6',
        }
    }

    fn is_binary(self) -> bool {
        matches!(self, PacketKind::BinaryEvent | PacketKind::BinaryAck)
    }
}

/// Decoded Socket.IO packet.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub namespace: String,
    pub attachments: usize,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

impl Packet {
    pub fn connect(namespace: &str, auth: Option<Value>) -> Self {
        Self {
            kind: PacketKind::Connect,
            namespace: namespace.to_string(),
            attachments: 0,
            ack_id: None,
            data: auth,
        }
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self {
            kind: PacketKind::Disconnect,
            namespace: namespace.to_string(),
            attachments: 0,
            ack_id: None,
            data: None,
        }
    }

    /// Build an event packet plus the binary frames that must follow it.
    pub fn event(namespace: &str, name: &str, payload: Payload) -> (Self, Vec<Bytes>) {
        let (kind, data, binaries) = match payload {
            Payload::Empty => (PacketKind::Event, json!([name]), Vec::new()),
            Payload::Json(value) => (PacketKind::Event, json!([name, value]), Vec::new()),
            Payload::Binary(bytes) => (
                PacketKind::BinaryEvent,
                json!([name, {"_placeholder": true, "num": 0}]),
                vec![bytes],
            ),
        };
        let packet = Self {
            kind,
            namespace: namespace.to_string(),
            attachments: binaries.len(),
            ack_id: None,
            data: Some(data),
        };
        (packet, binaries)
    }

    /// Encode as an Engine.IO message frame (leading `4`).
    pub fn encode(&self) -> String {
        let mut out = String::from("4");
        out.push(self.kind.digit());
        if self.kind.is_binary() {
            out.push_str(&self.attachments.to_string());
            out.push('-');
        }
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Decode the body of an Engine.IO message frame (without the leading `4`).
    pub fn decode(body: &str) -> Result<Self, ChannelError> {
        let mut rest = body;
        let kind = rest
            .chars()
            .next()
            .and_then(PacketKind::from_digit)
            .ok_or_else(|| ChannelError::Protocol(format!("bad socket.io packet {body:?}")))?;
        rest = &rest[1..];

        let mut attachments = 0;
        if kind.is_binary() {
            let dash = rest
                .find('-')
                .ok_or_else(|| ChannelError::Protocol("missing attachment count".to_string()))?;
            attachments = rest[..dash]
                .parse()
                .map_err(|_| ChannelError::Protocol("bad attachment count".to_string()))?;
            rest = &rest[dash + 1..];
        }

        let mut namespace = "/".to_string();
        if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            namespace = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
        }

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse()
                .map_err(|_| ChannelError::Protocol("bad ack id".to_string()))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| ChannelError::Protocol(format!("bad packet json: {e}")))?,
            )
        };

        Ok(Self {
            kind,
            namespace,
            attachments,
            ack_id,
            data,
        })
    }

    /// Split an event packet into its name and first argument, resolving binary placeholders.
    pub fn into_event(self, attachments: Vec<Bytes>) -> Option<(String, Payload)> {
        let Some(Value::Array(mut args)) = self.data else {
            return None;
        };
        if args.is_empty() {
            return None;
        }
        let name = match args.remove(0) {
            Value::String(name) => name,
            _ => return None,
        };
        let payload = match args.into_iter().next() {
            None => Payload::Empty,
            Some(arg) => match placeholder_index(&arg) {
                Some(num) => Payload::Binary(attachments.get(num).cloned()?),
                None => Payload::Json(arg),
            },
        };
        Some((name, payload))
    }
}

fn placeholder_index(value: &Value) -> Option<usize> {
    let obj = value.as_object()?;
    if obj.get("_placeholder")?.as_bool()? {
        obj.get("num")?.as_u64().map(|n| n as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_engine_open() {
        let packet = decode_engine(
            r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        let EnginePacket::Open(info) = packet else {
            panic!("expected open");
        };
        assert_eq!(info.sid, "abc");
        assert_eq!(info.liveness_window(), Duration::from_millis(45_000));
    }

    #[test]
    fn decodes_engine_ping_and_message() {
        assert_eq!(decode_engine("2").unwrap(), EnginePacket::Ping);
        assert_eq!(
            decode_engine("42[\"x\"]").unwrap(),
            EnginePacket::Message("2[\"x\"]".to_string())
        );
        assert!(decode_engine("").is_err());
        assert!(decode_engine("9").is_err());
    }

    #[test]
    fn encodes_namespace_connect_with_auth() {
        let packet = Packet::connect("/audio", Some(json!({"token": "t"})));
        assert_eq!(packet.encode(), r#"40/audio,{"token":"t"}"#);
        assert_eq!(Packet::connect("/", None).encode(), "40");
    }

    #[test]
    fn encodes_binary_event_with_placeholder() {
        let (packet, binaries) =
            Packet::event("/audio", "audio_talk", Payload::Binary(Bytes::from_static(&[1, 2])));
        assert_eq!(
            packet.encode(),
            r#"451-/audio,["audio_talk",{"_placeholder":true,"num":0}]"#
        );
        assert_eq!(binaries.len(), 1);
    }

    #[test]
    fn encodes_argumentless_event() {
        let (packet, binaries) = Packet::event("/audio", "audio_listen_start", Payload::Empty);
        assert_eq!(packet.encode(), r#"42/audio,["audio_listen_start"]"#);
        assert!(binaries.is_empty());
    }

    #[test]
    fn decodes_namespaced_json_event() {
        let packet = Packet::decode(r#"2/audio,["exclusive_status",{"blocked":true}]"#).unwrap();
        assert_eq!(packet.kind, PacketKind::Event);
        assert_eq!(packet.namespace, "/audio");
        let (name, payload) = packet.into_event(Vec::new()).unwrap();
        assert_eq!(name, "exclusive_status");
        assert_eq!(payload, Payload::Json(json!({"blocked": true})));
    }

    #[test]
    fn decodes_binary_event_and_resolves_attachment() {
        let packet =
            Packet::decode(r#"51-/audio,["audio_stream",{"_placeholder":true,"num":0}]"#).unwrap();
        assert_eq!(packet.kind, PacketKind::BinaryEvent);
        assert_eq!(packet.attachments, 1);
        let (name, payload) = packet
            .into_event(vec![Bytes::from_static(&[0, 1, 2, 3])])
            .unwrap();
        assert_eq!(name, "audio_stream");
        assert_eq!(payload.binary().unwrap().as_ref(), &[0, 1, 2, 3]);
    }

    #[test]
    fn decodes_ack_id_and_connect_error() {
        let packet = Packet::decode(r#"2/audio,12["ping"]"#).unwrap();
        assert_eq!(packet.ack_id, Some(12));

        let packet = Packet::decode(r#"4/audio,{"message":"unauthorized"}"#).unwrap();
        assert_eq!(packet.kind, PacketKind::ConnectError);
        assert_eq!(packet.data.unwrap()["message"], "unauthorized");
    }

    #[test]
    fn decodes_default_namespace_without_comma() {
        let packet = Packet::decode("0").unwrap();
        assert_eq!(packet.kind, PacketKind::Connect);
        assert_eq!(packet.namespace, "/");
        assert_eq!(packet.data, None);

        let packet = Packet::decode("1/audio,").unwrap();
        assert_eq!(packet.kind, PacketKind::Disconnect);
        assert_eq!(packet.namespace, "/audio");
    }
}
