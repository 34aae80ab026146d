//! JSON envelope transport
//!
//! Every WebSocket text frame carries one `{"event": .., "data": ..}` object. Anything
//! else is answered with an `error` event and the channel is torn down shortly after,
//! so the peer gets a chance to read why.

use std::time::Duration;

use futures::{SinkExt, StreamExt, future::BoxFuture};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::COOKIE},
    },
};
use tracing::{debug, trace, warn};

use super::{Connector, ControlChannel, Envelope};
use crate::LiveError;

/// Reason sent back when an inbound frame is not a JSON envelope
pub const ONLY_JSON: &str = "Only JSON allowed";
/// How long a rejected channel stays open after sending its `error` event
pub const REJECT_GRACE: Duration = Duration::from_millis(500);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens [`EnvelopeChannel`]s to a fixed URL
#[derive(Clone)]
pub struct EnvelopeConnector {
    url: String,
    cookie: Option<(String, String)>,
}

impl std::fmt::Debug for EnvelopeConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeConnector")
            .field("url", &self.url)
            .field("cookie", &self.cookie.as_ref().map(|(name, _)| name))
            .finish()
    }
}

impl EnvelopeConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cookie: None,
        }
    }

    /// Sends `name=value` as a session cookie with the upgrade request
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookie = Some((name.into(), value.into()));
        self
    }
}

impl Connector for EnvelopeConnector {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ControlChannel>, LiveError>> {
        Box::pin(async move {
            let channel = EnvelopeChannel::connect(self).await?;
            Ok(Box::new(channel) as Box<dyn ControlChannel>)
        })
    }
}

/// A single envelope WebSocket connection
pub struct EnvelopeChannel {
    ws: WsStream,
    closed: bool,
}

impl std::fmt::Debug for EnvelopeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeChannel")
            .field("closed", &self.closed)
            .finish()
    }
}

impl EnvelopeChannel {
    /// Connects and completes the WebSocket upgrade
    ///
    /// # Errors
    /// `Transport` if the connection or upgrade fails
    pub async fn connect(connector: &EnvelopeConnector) -> Result<Self, LiveError> {
        let mut request = connector.url.as_str().into_client_request()?;
        if let Some((name, value)) = &connector.cookie {
            let cookie = HeaderValue::from_str(&format!("{name}={value}"))
                .map_err(|e| LiveError::InvalidConfig(format!("bad cookie: {e}")))?;
            request.headers_mut().insert(COOKIE, cookie);
        }

        debug!("Connecting to {}", connector.url);
        let (ws, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self { ws, closed: false })
    }

    async fn send_envelope(&mut self, envelope: Envelope) -> Result<(), LiveError> {
        if self.closed {
            return Err(LiveError::NoEstablishedConnection);
        }
        let text = serde_json::to_string(&envelope)?;
        trace!("Sending {text}");
        self.ws.send(Message::text(text)).await?;
        Ok(())
    }

    async fn next_envelope(&mut self) -> Option<Result<Envelope, LiveError>> {
        if self.closed {
            return None;
        }

        loop {
            let message = match self.ws.next().await {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    self.closed = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.closed = true;
                    return None;
                }
            };

            let parsed = match &message {
                Message::Text(text) => serde_json::from_str::<Envelope>(text),
                Message::Binary(bytes) => serde_json::from_slice::<Envelope>(bytes),
                Message::Close(frame) => {
                    debug!("Peer closed the channel: {frame:?}");
                    self.closed = true;
                    return None;
                }
                _ => continue,
            };

            return Some(match parsed {
                Ok(envelope) => {
                    trace!("Received {envelope:?}");
                    Ok(envelope)
                }
                Err(e) => {
                    self.reject(ONLY_JSON).await;
                    Err(LiveError::ProtocolDecode(e.to_string()))
                }
            });
        }
    }

    /// Tells the peer why the channel is going away, then closes it
    async fn reject(&mut self, reason: &str) {
        warn!("Rejecting control channel message: {reason}");
        if let Err(e) = self.send_envelope(Envelope::new("error", reason)).await {
            debug!("Unable to send rejection: {e}");
        }
        tokio::time::sleep(REJECT_GRACE).await;
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None).await {
            debug!("Error closing channel: {e}");
        }
    }
}

impl ControlChannel for EnvelopeChannel {
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
