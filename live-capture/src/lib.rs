//! Live traffic capture from a remote SIM monitoring service
//!
//! The crate keeps a control channel open to the monitoring service, authenticates,
//! subscribes to one or more SIM ids and writes every intercepted packet into a classic
//! PCAP container, either to a file or to a continuous output stream such as stdout.
//!
//! - [`pcap`] owns the capture file format.
//! - [`channel`] abstracts the named-event control channel and its transports.
//! - [`session`] drives a single connection through authenticate and subscribe.
//! - [`capture`] is the reconnect-forever loop that owns one session per attempt.

pub mod capture;
pub mod channel;
pub mod config;
pub mod pcap;
pub mod session;

#[cfg(test)]
mod testing;

pub use capture::{CaptureReporter, CaptureStats, LiveCapture, Recorder, Shutdown};
pub use channel::{Connector, ControlChannel, Envelope};
pub use config::{CaptureConfig, OutputTarget, SubscriptionProtocol, TransportKind};
pub use pcap::{CaptureSink, Frame};
pub use session::{ConnectionState, Session, SessionEnd, Subscription};

use std::{io, path::PathBuf};
use thiserror::Error;

/// Error payload the service sends when the credential is rejected
pub const NOT_AUTHENTICATED: &str = "Not authenticated";

/// Comprehensive error type for every capture failure
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LiveError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("control channel transport failed")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("control channel socket io failed")]
    Socket(#[from] io::Error),
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("unexpected response from service")]
    UnexpectedResponse,
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
    #[error("unable to decode inbound message: {0}")]
    ProtocolDecode(String),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error("invalid service url `{0}`")]
    InvalidUrl(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unable to open capture file {path}")]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("capture file write failed")]
    SinkWrite(#[source] io::Error),
    #[error("capture header has not been written to this output")]
    HeaderNotWritten,
    #[error("output stream closed by its consumer")]
    OutputClosed,
}

impl LiveError {
    /// Whether this failure must end the process instead of being absorbed by the
    /// reconnect loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LiveError::Authentication(_)
                | LiveError::SinkOpen { .. }
                | LiveError::SinkWrite(_)
                | LiveError::HeaderNotWritten
                | LiveError::InvalidUrl(_)
                | LiveError::InvalidConfig(_)
        )
    }
}
