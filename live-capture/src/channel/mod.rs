//! Named-event control channel
//!
//! A channel is a single connection to the monitoring service. It is never reused:
//! every reconnect asks the [`Connector`] for a fresh one. Channels know nothing about
//! authentication or subscriptions, they only move `(event, data)` pairs.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    LiveError,
    config::{CaptureConfig, TransportKind},
};

pub mod envelope;
pub mod socketio;

pub use envelope::{EnvelopeChannel, EnvelopeConnector};
pub use socketio::{SocketIoChannel, SocketIoConnector};

/// One named event with its payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// A connected, bidirectional named-event channel
///
/// This is an ugly trait until async traits are dyn compatible
pub trait ControlChannel: Send + std::fmt::Debug {
    /// Transmits an event. There is no delivery acknowledgment.
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<(), LiveError>>;

    /// Waits for the next inbound event
    ///
    /// Returns `None` once the channel is closed. A `ProtocolDecode` error means a
    /// single message could not be understood and the channel may still be usable.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Envelope, LiveError>>>;

    /// Terminates the underlying transport. Calling it more than once is harmless.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Opens new control channels to the monitoring service
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ControlChannel>, LiveError>>;
}

/// Builds the connector for the transport selected in `config`
///
/// # Errors
/// `InvalidUrl` if the service URL cannot be turned into a WebSocket URL
pub fn connector_for(config: &CaptureConfig) -> Result<Box<dyn Connector>, LiveError> {
    let url = config.monitor_url()?;
    Ok(match config.transport {
        TransportKind::SocketIo => Box::new(SocketIoConnector::new(url)),
        TransportKind::Envelope => {
            let mut connector = EnvelopeConnector::new(url);
            if let Some(name) = &config.session_cookie {
                connector = connector.with_cookie(name, &config.credential);
            }
            Box::new(connector)
        }
    })
}
