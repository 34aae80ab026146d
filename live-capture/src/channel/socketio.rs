//! Socket.IO event transport
//!
//! Speaks Engine.IO protocol revision 3 over a WebSocket, the way the monitoring
//! service's Socket.IO endpoint expects it. Only the default namespace and text
//! events are supported.
//!
//! Engine.IO packets are a single type digit followed by a payload:
//! - `0` open, carrying the handshake JSON
//! - `1` close
//! - `2` ping, answered with `3` pong
//! - `4` message, carrying a Socket.IO packet
//!
//! Socket.IO packets again start with a type digit: `0` connect, `1` disconnect,
//! `2` event (`["name", data]`), `3` ack and `4` error.

use std::{collections::VecDeque, time::Duration};

use futures::{SinkExt, StreamExt, future::BoxFuture};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{net::TcpStream, time::Instant};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};
use tracing::{debug, trace, warn};

use super::{Connector, ControlChannel, Envelope};
use crate::LiveError;

/// Engine.IO protocol revision spoken by this client
pub const ENGINE_IO_VERSION: u8 = 3;
/// How long to wait for the handshake after the upgrade
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Handshake {
    sid: String,
    ping_interval: u64,
    ping_timeout: u64,
}

#[derive(Debug, PartialEq)]
enum EnginePacket<'a> {
    Open(&'a str),
    Close,
    Ping(&'a str),
    Pong,
    Message(&'a str),
    Upgrade,
    Noop,
}

#[derive(Debug, PartialEq)]
enum SocketPacket {
    Connect,
    Disconnect,
    Event(Envelope),
    Ack,
    Error(Value),
}

fn parse_engine_packet(text: &str) -> Result<EnginePacket<'_>, LiveError> {
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| LiveError::ProtocolDecode("empty engine packet".into()))?;
    let payload = chars.as_str();
    Ok(match kind {
        '0' => EnginePacket::Open(payload),
        '1' => EnginePacket::Close,
        '2' => EnginePacket::Ping(payload),
        '3' => EnginePacket::Pong,
        '4' => EnginePacket::Message(payload),
        '5' => EnginePacket::Upgrade,
        '6' => EnginePacket::Noop,
        k => {
            return Err(LiveError::ProtocolDecode(format!(
                "unknown engine packet type `{k}`"
            )));
        }
    })
}

fn parse_socket_packet(payload: &str) -> Result<SocketPacket, LiveError> {
    let mut chars = payload.chars();
    let kind = chars
        .next()
        .ok_or_else(|| LiveError::ProtocolDecode("empty socket packet".into()))?;
    let mut rest = chars.as_str();

    // Optional namespace, terminated by a comma
    if rest.starts_with('/') {
        rest = match rest.split_once(',') {
            Some((_, r)) => r,
            None => "",
        };
    }
    // Optional ack id
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    Ok(match kind {
        '0' => SocketPacket::Connect,
        '1' => SocketPacket::Disconnect,
        '2' => {
            let args: Vec<Value> = serde_json::from_str(rest)
                .map_err(|e| LiveError::ProtocolDecode(format!("bad event payload: {e}")))?;
            let mut args = args.into_iter();
            let event = match args.next() {
                Some(Value::String(e)) => e,
                _ => {
                    return Err(LiveError::ProtocolDecode(
                        "event without a name".into(),
                    ));
                }
            };
            SocketPacket::Event(Envelope {
                event,
                data: args.next().unwrap_or(Value::Null),
            })
        }
        '3' => SocketPacket::Ack,
        '4' => SocketPacket::Error(
            serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string())),
        ),
        k => {
            return Err(LiveError::ProtocolDecode(format!(
                "unsupported socket packet type `{k}`"
            )));
        }
    })
}

fn encode_event(envelope: &Envelope) -> Result<String, LiveError> {
    let args = match &envelope.data {
        Value::Null => json!([envelope.event]),
        data => json!([envelope.event, data]),
    };
    Ok(format!("42{}", serde_json::to_string(&args)?))
}

/// Opens [`SocketIoChannel`]s to a fixed monitor URL
#[derive(Debug, Clone)]
pub struct SocketIoConnector {
    url: String,
}

impl SocketIoConnector {
    /// `monitor_url` is the WebSocket URL of the Socket.IO path, without a query
    pub fn new(monitor_url: impl Into<String>) -> Self {
        let monitor_url = monitor_url.into();
        let url = format!(
            "{}/?EIO={ENGINE_IO_VERSION}&transport=websocket",
            monitor_url.trim_end_matches('/')
        );
        Self { url }
    }

}

impl Connector for SocketIoConnector {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ControlChannel>, LiveError>> {
        Box::pin(async move {
            let channel = SocketIoChannel::connect(&self.url).await?;
            Ok(Box::new(channel) as Box<dyn ControlChannel>)
        })
    }
}

/// A single Socket.IO connection on the default namespace
pub struct SocketIoChannel {
    ws: WsStream,
    sid: String,
    closed: bool,
    ping_interval: Duration,
    ping_timeout: Duration,
    next_ping: Instant,
    /// Set while a ping is unanswered, moved forward by every inbound packet
    awaiting_pong: Option<Instant>,
    pending: VecDeque<Envelope>,
}

impl std::fmt::Debug for SocketIoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketIoChannel")
            .field("sid", &self.sid)
            .field("closed", &self.closed)
            .field("ping_interval", &self.ping_interval)
            .finish()
    }
}

impl SocketIoChannel {
    /// Connects, waits for the Engine.IO handshake and for the namespace connect
    ///
    /// An error packet received instead of the namespace connect is kept and handed
    /// out by the first [`ControlChannel::recv`], so the caller can react to it.
    ///
    /// # Errors
    /// `Transport` if the upgrade fails, `UnexpectedResponse` if the service does not
    /// complete the handshake
    pub async fn connect(url: &str) -> Result<Self, LiveError> {
        debug!("Connecting to {url}");
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;

        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut ws))
            .await
            .map_err(|_| LiveError::UnexpectedResponse)??;
        debug!(
            "Engine.IO session {} (ping every {} ms)",
            handshake.sid, handshake.ping_interval
        );

        let ping_interval = Duration::from_millis(handshake.ping_interval);
        let mut channel = Self {
            ws,
            sid: handshake.sid,
            closed: false,
            ping_interval,
            ping_timeout: Duration::from_millis(handshake.ping_timeout),
            next_ping: Instant::now() + ping_interval,
            awaiting_pong: None,
            pending: VecDeque::new(),
        };

        tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.await_namespace())
            .await
            .map_err(|_| LiveError::UnexpectedResponse)??;
        Ok(channel)
    }

    async fn await_namespace(&mut self) -> Result<(), LiveError> {
        loop {
            let text = match self.ws.next().await {
                Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                Some(Ok(Message::Close(_))) | None => return Err(LiveError::UnexpectedResponse),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            match parse_engine_packet(&text)? {
                EnginePacket::Ping(probe) => self.write_raw(format!("3{probe}")).await?,
                EnginePacket::Message(payload) => match parse_socket_packet(payload)? {
                    SocketPacket::Connect => return Ok(()),
                    SocketPacket::Error(data) => {
                        self.pending.push_back(Envelope::new("error", data));
                        return Ok(());
                    }
                    SocketPacket::Event(envelope) => self.pending.push_back(envelope),
                    SocketPacket::Disconnect => return Err(LiveError::UnexpectedResponse),
                    SocketPacket::Ack => {}
                },
                EnginePacket::Close => return Err(LiveError::UnexpectedResponse),
                _ => {}
            }
        }
    }

    async fn write_raw(&mut self, text: String) -> Result<(), LiveError> {
        if self.closed {
            return Err(LiveError::NoEstablishedConnection);
        }
        trace!("Sending {text}");
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    async fn send_envelope(&mut self, envelope: Envelope) -> Result<(), LiveError> {
        let text = encode_event(&envelope)?;
        self.write_raw(text).await
    }

    async fn next_envelope(&mut self) -> Option<Result<Envelope, LiveError>> {
        if let Some(envelope) = self.pending.pop_front() {
            return Some(Ok(envelope));
        }

        loop {
            if self.closed {
                return None;
            }

            let next_ping = self.next_ping;
            let pong_deadline = self
                .awaiting_pong
                .map(|since| since + self.ping_interval + self.ping_timeout);

            let message = tokio::select! {
                message = self.ws.next() => message,
                _ = tokio::time::sleep_until(next_ping), if pong_deadline.is_none() => {
                    if let Err(e) = self.write_raw("2".to_string()).await {
                        self.closed = true;
                        return Some(Err(e));
                    }
                    let now = Instant::now();
                    self.awaiting_pong = Some(now);
                    self.next_ping = now + self.ping_interval;
                    continue;
                }
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or(next_ping)), if pong_deadline.is_some() => {
                    warn!(
                        "No pong received within {:?}",
                        self.ping_interval + self.ping_timeout
                    );
                    self.shutdown().await;
                    return Some(Err(LiveError::HeartbeatTimeout));
                }
            };

            let text = match message {
                Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                Some(Ok(Message::Close(frame))) => {
                    debug!("Peer closed the channel: {frame:?}");
                    self.closed = true;
                    return None;
                }
                Some(Ok(Message::Binary(_))) => {
                    trace!("Ignoring binary frame");
                    continue;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            };

            let packet = match parse_engine_packet(&text) {
                Ok(p) => p,
                Err(e) => return Some(Err(e)),
            };
            // Any traffic proves the peer is alive
            if self.awaiting_pong.is_some() {
                self.awaiting_pong = Some(Instant::now());
            }
            match packet {
                EnginePacket::Ping(probe) => {
                    if let Err(e) = self.write_raw(format!("3{probe}")).await {
                        return Some(Err(e));
                    }
                }
                EnginePacket::Pong => self.awaiting_pong = None,
                EnginePacket::Close => {
                    debug!("Engine.IO close received");
                    self.shutdown().await;
                    return None;
                }
                EnginePacket::Message(payload) => match parse_socket_packet(payload) {
                    Ok(SocketPacket::Event(envelope)) => {
                        trace!("Received {envelope:?}");
                        return Some(Ok(envelope));
                    }
                    Ok(SocketPacket::Error(data)) => {
                        return Some(Ok(Envelope::new("error", data)));
                    }
                    Ok(SocketPacket::Disconnect) => {
                        debug!("Server disconnected the namespace");
                        self.shutdown().await;
                        return None;
                    }
                    Ok(SocketPacket::Connect) | Ok(SocketPacket::Ack) => {}
                    Err(e) => return Some(Err(e)),
                },
                EnginePacket::Open(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        // Leave the namespace politely before dropping the socket
        if let Err(e) = self.write_raw("41".to_string()).await {
            debug!("Unable to send disconnect: {e}");
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None).await {
            debug!("Error closing channel: {e}");
        }
    }
}

async fn read_handshake(ws: &mut WsStream) -> Result<Handshake, LiveError> {
    loop {
        let text = match ws.next().await {
            Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
            Some(Ok(Message::Close(_))) | None => return Err(LiveError::UnexpectedResponse),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        if let EnginePacket::Open(payload) = parse_engine_packet(&text)? {
            return Ok(serde_json::from_str(payload)?);
        }
        trace!("Ignoring packet before handshake: {text}");
    }
}

impl ControlChannel for SocketIoChannel {
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<(), LiveError>> {
        Box::pin(self.send_envelope(envelope))
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Envelope, LiveError>>> {
        Box::pin(self.next_envelope())
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}
