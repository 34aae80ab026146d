//! One authenticated connection to the monitoring service
//!
//! A [`Session`] lives exactly as long as its control channel. It authenticates,
//! subscribes to every configured SIM id once and then turns packet events into
//! capture records until the channel goes away.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::{
    LiveError, NOT_AUTHENTICATED,
    capture::Recorder,
    channel::{ControlChannel, Envelope},
    config::{CaptureConfig, SubscriptionProtocol},
    pcap::Frame,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Subscribing,
    Streaming,
}

/// Per-target subscription progress within one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub confirmed: bool,
    pub remote_address: Option<String>,
}

/// How a session ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEnd {
    /// The service accepted the credential before the channel went away
    pub authenticated: bool,
    /// Frames recorded during this session
    pub frames: u64,
}

/// SIM ids arrive as strings from some deployments and as numbers from others
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TargetId {
    Text(String),
    Number(u64),
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetId::Text(s) => f.write_str(s),
            TargetId::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    #[serde(rename = "simId", alias = "targetId")]
    target_id: Option<TargetId>,
    #[serde(rename = "ip", alias = "remoteAddress")]
    remote_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaggedPacket {
    #[serde(rename = "simId", alias = "targetId")]
    target_id: Option<TargetId>,
    packet: String,
}

/// Protocol state machine for a single control channel
#[derive(Debug)]
pub struct Session {
    credential: String,
    targets: IndexSet<String>,
    protocol: SubscriptionProtocol,
    state: ConnectionState,
    subscriptions: IndexMap<String, Subscription>,
    authenticated: bool,
    frames: u64,
}

impl Session {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            credential: config.credential.clone(),
            targets: config.targets.clone(),
            protocol: config.protocol,
            state: ConnectionState::Connecting,
            subscriptions: IndexMap::new(),
            authenticated: false,
            frames: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscriptions(&self) -> &IndexMap<String, Subscription> {
        &self.subscriptions
    }

    /// Drives the channel until it closes
    ///
    /// Malformed inbound messages are logged and dropped. Transport failures end the
    /// session normally so the caller can reconnect.
    ///
    /// # Errors
    /// `Authentication` when the service rejects the credential, and any sink error
    /// raised while recording a frame
    pub async fn run(
        &mut self,
        channel: &mut dyn ControlChannel,
        recorder: &mut Recorder,
    ) -> Result<SessionEnd, LiveError> {
        let res = self.drive(channel, recorder).await;
        self.state = ConnectionState::Disconnected;
        res.map(|_| SessionEnd {
            authenticated: self.authenticated,
            frames: self.frames,
        })
    }

    async fn drive(
        &mut self,
        channel: &mut dyn ControlChannel,
        recorder: &mut Recorder,
    ) -> Result<(), LiveError> {
        self.state = ConnectionState::Connected;
        info!("Connected");

        self.state = ConnectionState::Authenticating;
        if let Err(e) = channel
            .send(Envelope::new("authenticate", self.credential.as_str()))
            .await
        {
            warn!("Unable to send credential: {e}");
            return Ok(());
        }

        while let Some(message) = channel.recv().await {
            let envelope = match message {
                Ok(e) => e,
                Err(LiveError::ProtocolDecode(reason)) => {
                    warn!("Dropping malformed message: {reason}");
                    continue;
                }
                Err(e) => {
                    warn!("Control channel failed: {e}");
                    return Ok(());
                }
            };

            match self.handle(envelope, channel, recorder).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() || matches!(e, LiveError::OutputClosed) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("Control channel failed: {e}");
                    return Ok(());
                }
            }
        }

        debug!("Control channel closed");
        Ok(())
    }

    async fn handle(
        &mut self,
        envelope: Envelope,
        channel: &mut dyn ControlChannel,
        recorder: &mut Recorder,
    ) -> Result<(), LiveError> {
        let Envelope { event, data } = envelope;
        match event.as_str() {
            "authenticated" => self.on_authenticated(channel).await,
            "error" => self.on_error(data),
            e if self.protocol.is_confirmation(e) => {
                self.on_confirmation(data);
                Ok(())
            }
            e if e == self.protocol.packet_event() => self.on_packet(data, recorder).await,
            other => {
                trace!("Ignoring event {other}");
                Ok(())
            }
        }
    }

    async fn on_authenticated(
        &mut self,
        channel: &mut dyn ControlChannel,
    ) -> Result<(), LiveError> {
        if self.state != ConnectionState::Authenticating {
            debug!("Ignoring repeated authentication in state {:?}", self.state);
            return Ok(());
        }
        info!("Authenticated");
        self.authenticated = true;
        self.state = ConnectionState::Authenticated;

        self.state = ConnectionState::Subscribing;
        let subscribe = self.protocol.subscribe_event();
        for target in &self.targets {
            if self.subscriptions.contains_key(target) {
                continue;
            }
            debug!("Subscribing to {target}");
            channel.send(Envelope::new(subscribe, target.as_str())).await?;
            self.subscriptions.insert(target.clone(), Subscription::default());
        }
        Ok(())
    }

    fn on_error(&mut self, data: Value) -> Result<(), LiveError> {
        let reason = match data {
            Value::String(s) => s,
            other => other.to_string(),
        };
        if reason == NOT_AUTHENTICATED {
            return Err(LiveError::Authentication(reason));
        }
        warn!("Error: {reason}");
        Ok(())
    }

    fn on_confirmation(&mut self, data: Value) {
        let confirmation = match data {
            // Older deployments confirm with a bare id, or nothing at all
            Value::String(s) => Confirmation {
                target_id: Some(TargetId::Text(s)),
                remote_address: None,
            },
            Value::Null => Confirmation {
                target_id: None,
                remote_address: None,
            },
            other => match serde_json::from_value::<Confirmation>(other) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Dropping malformed subscription confirmation: {e}");
                    return;
                }
            },
        };

        let id = match confirmation.target_id {
            Some(id) => id.to_string(),
            // Without an id the confirmation can only belong to a lone subscription
            None if self.subscriptions.len() == 1 => match self.subscriptions.keys().next() {
                Some(id) => id.clone(),
                None => return,
            },
            None => {
                warn!("Subscription confirmation without a SIM id");
                return;
            }
        };

        let Some(subscription) = self.subscriptions.get_mut(&id) else {
            debug!("Confirmation for unknown SIM {id}");
            return;
        };
        subscription.confirmed = true;
        subscription.remote_address = confirmation.remote_address;
        info!(
            "Attached. SIM id={id}. ip={}",
            subscription.remote_address.as_deref().unwrap_or("unknown")
        );
        self.state = ConnectionState::Streaming;
    }

    async fn on_packet(&mut self, data: Value, recorder: &mut Recorder) -> Result<(), LiveError> {
        if self.state != ConnectionState::Streaming {
            debug!("Dropping packet received in state {:?}", self.state);
            return Ok(());
        }

        // Either a bare hex string or a packet tagged with its SIM id
        let hex_payload = match data {
            Value::String(s) => s,
            other => match serde_json::from_value::<TaggedPacket>(other) {
                Ok(tagged) => {
                    if let Some(id) = tagged.target_id {
                        let id = id.to_string();
                        if !self.subscriptions.get(&id).is_some_and(|s| s.confirmed) {
                            debug!("Dropping packet for SIM {id}, not a confirmed subscription");
                            return Ok(());
                        }
                        trace!("Packet for SIM {id}");
                    }
                    tagged.packet
                }
                Err(e) => {
                    warn!("Dropping malformed packet event: {e}");
                    return Ok(());
                }
            },
        };

        let frame = match Frame::from_hex(&hex_payload) {
            Ok(f) => f,
            Err(e) => {
                warn!("Dropping packet: {e}");
                return Ok(());
            }
        };
        recorder.record(&frame).await?;
        self.frames += 1;
        Ok(())
    }
}
