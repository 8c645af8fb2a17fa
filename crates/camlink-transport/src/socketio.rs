//! Socket.IO client channel over a websocket.
//!
//! One background task per channel owns the websocket. It performs the Engine.IO handshake,
//! joins the namespace, answers pings, and reconnects with [`ReconnectPolicy`] delays when the
//! transport drops. Events emitted while disconnected stay queued and are flushed once the
//! namespace handshake completes; volatile events are dropped instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::channel::{ChannelError, ChannelEvent, ChannelEvents, ChannelFactory, EventChannel, Payload};
use crate::packet::{ENGINE_PONG, EnginePacket, Packet, PacketKind, decode_engine};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection settings shared by every namespace opened through a [`SocketIoFactory`].
#[derive(Clone, Debug)]
pub struct SocketIoConfig {
    /// Device base URL (`https://host:port`).
    pub base_url: Url,
    /// Optional access token sent as `{"token": ...}` in the namespace handshake.
    pub token: Option<String>,
    /// Budget for the websocket + Engine.IO + namespace handshake.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SocketIoConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            token: None,
            connect_timeout: Duration::from_secs(20),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Websocket endpoint derived from the base URL.
    pub fn websocket_url(&self) -> Result<Url, ChannelError> {
        let mut url = self.base_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ChannelError::Url(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::Url(format!("cannot use scheme {scheme}")))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));
        Ok(url)
    }

    fn auth(&self) -> Option<Value> {
        self.token.as_ref().map(|token| json!({ "token": token }))
    }
}

/// Opens [`SocketIoChannel`]s. Each namespace gets its own websocket, like a browser client
/// created with `forceNew`.
#[derive(Clone, Debug)]
pub struct SocketIoFactory {
    config: SocketIoConfig,
}

impl SocketIoFactory {
    pub fn new(config: SocketIoConfig) -> Self {
        Self { config }
    }
}

impl ChannelFactory for SocketIoFactory {
    fn open(&self, namespace: &str) -> Result<(Arc<dyn EventChannel>, ChannelEvents), ChannelError> {
        let (channel, events) = SocketIoChannel::spawn(self.config.clone(), namespace)?;
        Ok((Arc::new(channel), events))
    }
}

struct Outgoing {
    name: String,
    payload: Payload,
    volatile: bool,
}

enum Control {
    ReconnectNow,
    Close,
}

/// Handle to a running Socket.IO namespace connection.
pub struct SocketIoChannel {
    out_tx: mpsc::UnboundedSender<Outgoing>,
    control_tx: mpsc::UnboundedSender<Control>,
    connected: Arc<AtomicBool>,
}

impl SocketIoChannel {
    /// Start the I/O task for `namespace`. Must be called inside a tokio runtime.
    pub fn spawn(config: SocketIoConfig, namespace: &str) -> Result<(Self, ChannelEvents), ChannelError> {
        // Validate early so a bad URL is reported to the caller rather than looped on.
        config.websocket_url()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            config,
            namespace: namespace.to_string(),
            events: events_tx,
            out_rx,
            control_rx,
            connected: connected.clone(),
        };
        tokio::spawn(worker.run());

        Ok((
            Self {
                out_tx,
                control_tx,
                connected,
            },
            events_rx,
        ))
    }

    fn queue(&self, event: &str, payload: Payload, volatile: bool) -> Result<(), ChannelError> {
        self.out_tx
            .send(Outgoing {
                name: event.to_string(),
                payload,
                volatile,
            })
            .map_err(|_| ChannelError::Closed)
    }
}

impl EventChannel for SocketIoChannel {
    fn emit(&self, event: &str, payload: Payload) -> Result<(), ChannelError> {
        self.queue(event, payload, false)
    }

    fn emit_volatile(&self, event: &str, payload: Payload) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.queue(event, payload, true)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn reconnect_now(&self) {
        let _ = self.control_tx.send(Control::ReconnectNow);
    }

    fn close(&self) {
        let _ = self.control_tx.send(Control::Close);
    }
}

impl Drop for SocketIoChannel {
    fn drop(&mut self) {
        let _ = self.control_tx.send(Control::Close);
    }
}

/// How a connected session ended.
enum SessionEnd {
    /// Local close requested; stop for good.
    Closed,
    /// Transport lost; reconnect per policy.
    Lost(String),
    /// Server kicked us out of the namespace; wait for an explicit reconnect.
    ServerDisconnect,
}

struct Worker {
    config: SocketIoConfig,
    namespace: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    out_rx: mpsc::UnboundedReceiver<Outgoing>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    connected: Arc<AtomicBool>,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            let outcome = {
                let connecting = tokio::time::timeout(
                    self.config.connect_timeout,
                    handshake(&self.config, &self.namespace),
                );
                tokio::pin!(connecting);
                loop {
                    tokio::select! {
                        result = &mut connecting => break result,
                        ctrl = self.control_rx.recv() => match ctrl {
                            Some(Control::ReconnectNow) => continue,
                            Some(Control::Close) | None => {
                                tracing::debug!(namespace = %self.namespace, "closed during handshake");
                                return;
                            }
                        },
                    }
                }
            };
            let wait_for_manual = match outcome {
                Ok(Ok((sink, source, window))) => {
                    attempt = 0;
                    self.set_connected(true);
                    tracing::info!(namespace = %self.namespace, "event channel connected");
                    self.emit_event(ChannelEvent::Connected);
                    let end = self.serve(sink, source, window).await;
                    self.set_connected(false);
                    match end {
                        SessionEnd::Closed => {
                            self.emit_event(ChannelEvent::Disconnected {
                                reason: "io client disconnect".to_string(),
                            });
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(namespace = %self.namespace, reason = %reason, "event channel lost");
                            self.emit_event(ChannelEvent::Disconnected { reason });
                            false
                        }
                        SessionEnd::ServerDisconnect => {
                            tracing::warn!(namespace = %self.namespace, "event channel closed by server");
                            self.emit_event(ChannelEvent::Disconnected {
                                reason: "io server disconnect".to_string(),
                            });
                            true
                        }
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(namespace = %self.namespace, error = %err, "event channel connect error");
                    self.emit_event(ChannelEvent::ConnectError {
                        message: err.to_string(),
                    });
                    false
                }
                Err(_) => {
                    tracing::warn!(namespace = %self.namespace, "event channel connect timeout");
                    self.emit_event(ChannelEvent::ConnectError {
                        message: "timeout".to_string(),
                    });
                    false
                }
            };

            if wait_for_manual {
                match self.control_rx.recv().await {
                    Some(Control::ReconnectNow) => continue,
                    Some(Control::Close) | None => return,
                }
            }

            attempt += 1;
            if self.config.reconnect.exhausted(attempt) {
                self.emit_event(ChannelEvent::ReconnectFailed);
                return;
            }
            let delay = self.config.reconnect.delay(attempt - 1, &mut rand::rng());
            tracing::debug!(
                namespace = %self.namespace,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "event channel reconnect scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::ReconnectNow) => {}
                    Some(Control::Close) | None => return,
                },
            }
            self.emit_event(ChannelEvent::ReconnectAttempt { attempt });
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn emit_event(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    async fn serve(&mut self, mut sink: WsSink, mut source: WsSource, window: Duration) -> SessionEnd {
        if let Err(err) = self.flush_backlog(&mut sink).await {
            return SessionEnd::Lost(format!("transport error: {err}"));
        }

        let mut deadline = tokio::time::Instant::now() + window;
        let mut pending: Option<(Packet, Vec<Bytes>)> = None;

        loop {
            tokio::select! {
                frame = source.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(err)) => return SessionEnd::Lost(format!("transport error: {err}")),
                        None => return SessionEnd::Lost("transport close".to_string()),
                    };
                    match frame {
                        Message::Text(text) => {
                            let packet = match decode_engine(text.as_str()) {
                                Ok(packet) => packet,
                                Err(err) => {
                                    tracing::warn!(error = %err, "dropping malformed frame");
                                    continue;
                                }
                            };
                            match packet {
                                EnginePacket::Ping => {
                                    deadline = tokio::time::Instant::now() + window;
                                    if send_text(&mut sink, ENGINE_PONG.to_string()).await.is_err() {
                                        return SessionEnd::Lost("transport error".to_string());
                                    }
                                }
                                EnginePacket::Close => return SessionEnd::Lost("transport close".to_string()),
                                EnginePacket::Message(body) => match Packet::decode(&body) {
                                    Ok(packet) if packet.namespace == self.namespace => {
                                        match packet.kind {
                                            PacketKind::Disconnect => return SessionEnd::ServerDisconnect,
                                            PacketKind::BinaryEvent if packet.attachments > 0 => {
                                                pending = Some((packet, Vec::new()));
                                            }
                                            PacketKind::Event | PacketKind::BinaryEvent => {
                                                self.deliver(packet, Vec::new());
                                            }
                                            _ => {}
                                        }
                                    }
                                    Ok(_) => {}
                                    Err(err) => tracing::warn!(error = %err, "dropping malformed packet"),
                                },
                                _ => {}
                            }
                        }
                        Message::Binary(data) => {
                            let complete = match pending.as_mut() {
                                Some((packet, buffers)) => {
                                    buffers.push(data);
                                    buffers.len() >= packet.attachments
                                }
                                None => {
                                    tracing::debug!("binary frame without pending packet");
                                    false
                                }
                            };
                            if complete {
                                if let Some((packet, buffers)) = pending.take() {
                                    self.deliver(packet, buffers);
                                }
                            }
                        }
                        Message::Close(_) => return SessionEnd::Lost("transport close".to_string()),
                        _ => {}
                    }
                }
                out = self.out_rx.recv() => {
                    let Some(out) = out else {
                        self.close_session(&mut sink).await;
                        return SessionEnd::Closed;
                    };
                    if let Err(err) = send_event(&mut sink, &self.namespace, out).await {
                        return SessionEnd::Lost(format!("transport error: {err}"));
                    }
                }
                ctrl = self.control_rx.recv() => match ctrl {
                    Some(Control::ReconnectNow) => {}
                    Some(Control::Close) | None => {
                        self.close_session(&mut sink).await;
                        return SessionEnd::Closed;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return SessionEnd::Lost("ping timeout".to_string());
                }
            }
        }
    }

    /// Send events queued while disconnected; stale volatile events are discarded.
    async fn flush_backlog(&mut self, sink: &mut WsSink) -> Result<(), ChannelError> {
        let mut backlog = Vec::new();
        while let Ok(out) = self.out_rx.try_recv() {
            if !out.volatile {
                backlog.push(out);
            }
        }
        if !backlog.is_empty() {
            tracing::debug!(count = backlog.len(), "flushing buffered events");
        }
        for out in backlog {
            send_event(sink, &self.namespace, out).await?;
        }
        Ok(())
    }

    /// Send whatever was emitted before the close request, then leave the namespace.
    async fn close_session(&mut self, sink: &mut WsSink) {
        while let Ok(out) = self.out_rx.try_recv() {
            if send_event(sink, &self.namespace, out).await.is_err() {
                break;
            }
        }
        let _ = send_text(sink, Packet::disconnect(&self.namespace).encode()).await;
        let _ = sink.close().await;
    }

    fn deliver(&self, packet: Packet, attachments: Vec<Bytes>) {
        match packet.into_event(attachments) {
            Some((name, payload)) => self.emit_event(ChannelEvent::Message { name, payload }),
            None => tracing::debug!("ignoring event without a name"),
        }
    }
}

/// Websocket connect, Engine.IO open, namespace connect.
async fn handshake(
    config: &SocketIoConfig,
    namespace: &str,
) -> Result<(WsSink, WsSource, Duration), ChannelError> {
    let url = config.websocket_url()?;
    let request = url.as_str().into_client_request()?;
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    let (mut sink, mut source) = ws.split();

    let open = loop {
        match next_text(&mut source).await? {
            EnginePacket::Open(info) => break info,
            EnginePacket::Noop => continue,
            other => {
                return Err(ChannelError::Protocol(format!(
                    "expected open packet, got {other:?}"
                )));
            }
        }
    };
    tracing::debug!(sid = %open.sid, "engine.io session opened");

    send_text(&mut sink, Packet::connect(namespace, config.auth()).encode()).await?;

    loop {
        match next_text(&mut source).await? {
            EnginePacket::Ping => send_text(&mut sink, ENGINE_PONG.to_string()).await?,
            EnginePacket::Message(body) => {
                let packet = Packet::decode(&body)?;
                if packet.namespace != namespace {
                    continue;
                }
                match packet.kind {
                    PacketKind::Connect => break,
                    PacketKind::ConnectError => {
                        let message = packet
                            .data
                            .as_ref()
                            .and_then(|d| d.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or("rejected")
                            .to_string();
                        return Err(ChannelError::Rejected(message));
                    }
                    _ => continue,
                }
            }
            EnginePacket::Close => return Err(ChannelError::Closed),
            _ => continue,
        }
    }

    Ok((sink, source, open.liveness_window()))
}

async fn next_text(source: &mut WsSource) -> Result<EnginePacket, ChannelError> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return decode_engine(text.as_str()),
            Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

async fn send_text(sink: &mut WsSink, text: String) -> Result<(), ChannelError> {
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn send_event(sink: &mut WsSink, namespace: &str, out: Outgoing) -> Result<(), ChannelError> {
    let (packet, binaries) = Packet::event(namespace, &out.name, out.payload);
    send_text(sink, packet.encode()).await?;
    for data in binaries {
        sink.send(Message::Binary(data)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn websocket_url_maps_scheme_and_path() {
        let config = SocketIoConfig::new(Url::parse("https://cam.local:5555/app").unwrap());
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://cam.local:5555/socket.io/?EIO=4&transport=websocket"
        );

        let config = SocketIoConfig::new(Url::parse("http://127.0.0.1:8080").unwrap());
        assert_eq!(config.websocket_url().unwrap().scheme(), "ws");

        let config = SocketIoConfig::new(Url::parse("ftp://cam.local").unwrap());
        assert!(config.websocket_url().is_err());
    }

    async fn recv_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text.as_str().to_string(),
                _ => continue,
            }
        }
    }

    async fn next_event(events: &mut ChannelEvents) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel alive")
    }

    #[tokio::test]
    async fn joins_namespace_and_exchanges_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#.into(),
            ))
            .await
            .unwrap();
            let connect = recv_text(&mut ws).await;
            assert_eq!(connect, r#"40/audio,{"token":"secret"}"#);
            ws.send(Message::Text(r#"40/audio,{"sid":"n1"}"#.into())).await.unwrap();

            ws.send(Message::Text(r#"42/audio,["exclusive_status",{"blocked":true}]"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"451-/audio,["audio_stream",{"_placeholder":true,"num":0}]"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Binary(Bytes::from_static(&[1, 0, 2, 0]))).await.unwrap();

            let listen = recv_text(&mut ws).await;
            assert_eq!(listen, r#"42/audio,["audio_listen_start"]"#);
            let talk = recv_text(&mut ws).await;
            assert_eq!(talk, r#"451-/audio,["audio_talk",{"_placeholder":true,"num":0}]"#);
            match ws.next().await.unwrap().unwrap() {
                Message::Binary(data) => assert_eq!(data.as_ref(), &[9, 9]),
                other => panic!("expected binary, got {other:?}"),
            }
        });

        let mut config = SocketIoConfig::new(Url::parse(&format!("http://{addr}")).unwrap());
        config.token = Some("secret".to_string());
        let (channel, mut events) = SocketIoChannel::spawn(config, "/audio").unwrap();

        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);
        assert!(channel.is_connected());
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Message {
                name: "exclusive_status".to_string(),
                payload: Payload::Json(json!({"blocked": true})),
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Message {
                name: "audio_stream".to_string(),
                payload: Payload::Binary(Bytes::from_static(&[1, 0, 2, 0])),
            }
        );

        channel.emit("audio_listen_start", Payload::Empty).unwrap();
        channel
            .emit_volatile("audio_talk", Payload::Binary(Bytes::from_static(&[9, 9])))
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_sends_pending_events_before_leaving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#.into(),
            ))
            .await
            .unwrap();
            let _connect = recv_text(&mut ws).await;
            ws.send(Message::Text(r#"40/audio,{"sid":"n1"}"#.into())).await.unwrap();
            let mut seen = Vec::new();
            for _ in 0..3 {
                seen.push(recv_text(&mut ws).await);
            }
            seen
        });

        let config = SocketIoConfig::new(Url::parse(&format!("http://{addr}")).unwrap());
        let (channel, mut events) = SocketIoChannel::spawn(config, "/audio").unwrap();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        channel.emit("audio_listen_stop", Payload::Empty).unwrap();
        channel.emit("audio_talk_stop", Payload::Empty).unwrap();
        channel.close();

        let seen = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                r#"42/audio,["audio_listen_stop"]"#.to_string(),
                r#"42/audio,["audio_talk_stop"]"#.to_string(),
                "41/audio,".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn close_interrupts_a_stalled_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept the websocket but never send the Engine.IO open packet.
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let config = SocketIoConfig::new(Url::parse(&format!("http://{addr}")).unwrap());
        let (channel, mut events) = SocketIoChannel::spawn(config, "/audio").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.close();

        let ended = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("worker stops well before the connect timeout");
        assert_eq!(ended, None);
        assert!(!channel.is_connected());
        server.abort();
    }

    #[tokio::test]
    async fn buffers_emits_until_connected_and_reports_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#.into(),
            ))
            .await
            .unwrap();
            let _connect = recv_text(&mut ws).await;
            ws.send(Message::Text(r#"44/audio,{"message":"unauthorized"}"#.into()))
                .await
                .unwrap();
            let _ = ws.close(None).await;

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text(
                r#"0{"sid":"s2","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#.into(),
            ))
            .await
            .unwrap();
            let _connect = recv_text(&mut ws).await;
            ws.send(Message::Text(r#"40/audio,{"sid":"n2"}"#.into())).await.unwrap();
            recv_text(&mut ws).await
        });

        let mut config = SocketIoConfig::new(Url::parse(&format!("http://{addr}")).unwrap());
        config.reconnect.initial = Duration::from_millis(10);
        config.reconnect.randomization = 0.0;
        let (channel, mut events) = SocketIoChannel::spawn(config, "/audio").unwrap();

        channel.emit("audio_listen_start", Payload::Empty).unwrap();
        channel
            .emit_volatile("audio_talk", Payload::Binary(Bytes::from_static(&[1, 2])))
            .unwrap();

        match next_event(&mut events).await {
            ChannelEvent::ConnectError { message } => assert!(message.contains("unauthorized")),
            other => panic!("expected connect error, got {other:?}"),
        }
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::ReconnectAttempt { attempt: 1 }
        );
        assert_eq!(next_event(&mut events).await, ChannelEvent::Connected);

        let first = server.await.unwrap();
        assert_eq!(first, r#"42/audio,["audio_listen_start"]"#);
    }
}
