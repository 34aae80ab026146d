//! Capture configuration
//!
//! Built once by the caller and shared by every reconnect attempt.

use std::{path::PathBuf, str::FromStr, time::Duration};

use indexmap::IndexSet;

use crate::LiveError;

/// Default monitoring service
pub const DEFAULT_API_URL: &str = "https://api.onomondo.com";
/// Path of the monitor endpoint below the service base URL
pub const MONITOR_PATH: &str = "/monitor";
/// Fixed delay before reconnecting after any disconnect
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Where the capture container is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// A file, created or truncated on start
    File(PathBuf),
    /// The process stdout, usually piped into an analyzer
    Stdout,
}

/// Which control channel transport to speak
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Socket.IO events over an Engine.IO WebSocket
    #[default]
    SocketIo,
    /// `{event, data}` JSON envelopes over a plain WebSocket
    Envelope,
}

impl FromStr for TransportKind {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socketio" | "socket.io" => Ok(Self::SocketIo),
            "envelope" | "sockjs" => Ok(Self::Envelope),
            _ => Err(LiveError::InvalidConfig(format!("unknown transport `{s}`"))),
        }
    }
}

/// Event names used to subscribe and to receive packets
///
/// The service speaks two dialects: one where packets carry the SIM id they belong
/// to, and an older one where every packet is a bare hex string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionProtocol {
    /// `subscribe:packets` / `subscribed:packets` / `packets {simId, packet}`
    #[default]
    Multi,
    /// `subscribe` / `subscribed` or `attached` / `packet "<hex>"`
    Single,
}

impl SubscriptionProtocol {
    pub fn subscribe_event(&self) -> &'static str {
        match self {
            Self::Multi => "subscribe:packets",
            Self::Single => "subscribe",
        }
    }

    pub fn is_confirmation(&self, event: &str) -> bool {
        match self {
            Self::Multi => event == "subscribed:packets",
            Self::Single => event == "subscribed" || event == "attached",
        }
    }

    pub fn packet_event(&self) -> &'static str {
        match self {
            Self::Multi => "packets",
            Self::Single => "packet",
        }
    }
}

impl FromStr for SubscriptionProtocol {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multi" => Ok(Self::Multi),
            "single" => Ok(Self::Single),
            _ => Err(LiveError::InvalidConfig(format!("unknown protocol `{s}`"))),
        }
    }
}

/// Everything a capture needs to run
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub api_url: String,
    pub credential: String,
    pub targets: IndexSet<String>,
    pub output: OutputTarget,
    pub transport: TransportKind,
    pub protocol: SubscriptionProtocol,
    pub reconnect_delay: Duration,
    /// Name of a cookie that also carries the credential, for transports that support it
    pub session_cookie: Option<String>,
}

impl CaptureConfig {
    /// Creates a configuration with defaults for everything but the required values
    ///
    /// Duplicate target ids are collapsed, keeping the order they were first given in.
    ///
    /// # Errors
    /// `InvalidConfig` if the credential is empty or no target id was given
    pub fn new(
        credential: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<String>>,
        output: OutputTarget,
    ) -> Result<Self, LiveError> {
        let credential = credential.into();
        if credential.is_empty() {
            return Err(LiveError::InvalidConfig("credential is empty".into()));
        }

        let targets: IndexSet<String> = targets
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();
        if targets.is_empty() {
            return Err(LiveError::InvalidConfig(
                "at least one target id is required".into(),
            ));
        }

        Ok(Self {
            api_url: DEFAULT_API_URL.to_string(),
            credential,
            targets,
            output,
            transport: TransportKind::default(),
            protocol: SubscriptionProtocol::default(),
            reconnect_delay: RECONNECT_DELAY,
            session_cookie: None,
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_protocol(mut self, protocol: SubscriptionProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = Some(name.into());
        self
    }

    /// WebSocket URL of the monitor endpoint
    ///
    /// # Errors
    /// `InvalidUrl` if the base URL has no http(s) or ws(s) scheme
    pub fn monitor_url(&self) -> Result<String, LiveError> {
        let base = self.api_url.trim().trim_end_matches('/');
        let (scheme, rest) = base
            .split_once("://")
            .ok_or_else(|| LiveError::InvalidUrl(self.api_url.clone()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(LiveError::InvalidUrl(self.api_url.clone())),
        };
        if rest.is_empty() {
            return Err(LiveError::InvalidUrl(self.api_url.clone()));
        }
        Ok(format!("{scheme}://{rest}{MONITOR_PATH}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_keep_order_without_duplicates() {
        let config = CaptureConfig::new(
            "abc",
            ["222222222", "111111111", "222222222", ""],
            OutputTarget::Stdout,
        )
        .unwrap();
        let targets: Vec<&str> = config.targets.iter().map(String::as_str).collect();
        assert_eq!(targets, ["222222222", "111111111"]);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
    }

    #[test]
    fn required_values() {
        assert!(CaptureConfig::new("", ["1"], OutputTarget::Stdout).is_err());
        assert!(CaptureConfig::new("abc", Vec::<String>::new(), OutputTarget::Stdout).is_err());
    }

    #[test]
    fn monitor_urls() {
        let config = CaptureConfig::new("abc", ["1"], OutputTarget::Stdout).unwrap();
        assert_eq!(
            config.monitor_url().unwrap(),
            "wss://api.onomondo.com/monitor"
        );

        let config = config.with_api_url("http://127.0.0.1:8080/");
        assert_eq!(config.monitor_url().unwrap(), "ws://127.0.0.1:8080/monitor");

        let config = config.with_api_url("ftp://example.com");
        assert!(matches!(config.monitor_url(), Err(LiveError::InvalidUrl(_))));

        let config = config.with_api_url("example.com");
        assert!(matches!(config.monitor_url(), Err(LiveError::InvalidUrl(_))));
    }

    #[test]
    fn parse_choices() {
        assert_eq!(
            "socket.io".parse::<TransportKind>().unwrap(),
            TransportKind::SocketIo
        );
        assert_eq!(
            "envelope".parse::<TransportKind>().unwrap(),
            TransportKind::Envelope
        );
        assert_eq!(
            "single".parse::<SubscriptionProtocol>().unwrap(),
            SubscriptionProtocol::Single
        );
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn protocol_event_names() {
        let multi = SubscriptionProtocol::Multi;
        assert_eq!(multi.subscribe_event(), "subscribe:packets");
        assert!(multi.is_confirmation("subscribed:packets"));
        assert!(!multi.is_confirmation("attached"));

        let single = SubscriptionProtocol::Single;
        assert_eq!(single.packet_event(), "packet");
        assert!(single.is_confirmation("attached"));
        assert!(single.is_confirmation("subscribed"));
    }
}
