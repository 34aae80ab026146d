//! Reconnect-forever capture loop
//!
//! [`LiveCapture`] writes the capture header once, then keeps opening control channels
//! and running a fresh [`Session`] on each of them. Only a rejected credential, a
//! broken capture file or the caller's cancellation token stops it.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    LiveError,
    channel::{Connector, connector_for},
    config::{CaptureConfig, OutputTarget},
    pcap::{CaptureSink, Frame},
    session::Session,
};

/// Running totals over every session of a capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub bytes: u64,
}

/// Receives updated totals after every recorded frame
pub trait CaptureReporter: Send {
    fn update(&mut self, stats: &CaptureStats);
}

impl<F> CaptureReporter for F
where
    F: FnMut(&CaptureStats) + Send,
{
    fn update(&mut self, stats: &CaptureStats) {
        self(stats)
    }
}

/// Why a capture stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The cancellation token fired
    Cancelled,
    /// The consumer of the output stream went away
    OutputClosed,
}

/// Capture sink plus the totals that outlive individual sessions
pub struct Recorder {
    sink: CaptureSink,
    stats: CaptureStats,
    reporter: Option<Box<dyn CaptureReporter>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("sink", &self.sink)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    pub fn new(sink: CaptureSink) -> Self {
        Self {
            sink,
            stats: CaptureStats::default(),
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: impl CaptureReporter + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub async fn write_header(&mut self) -> Result<(), LiveError> {
        self.sink.write_header().await
    }

    /// Appends one frame to every output and updates the totals
    pub async fn record(&mut self, frame: &Frame) -> Result<(), LiveError> {
        self.sink.append_frame(frame).await?;
        self.stats.frames += 1;
        self.stats.bytes += frame.len() as u64;
        if let Some(reporter) = self.reporter.as_mut() {
            reporter.update(&self.stats);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct LiveCapture {
    config: CaptureConfig,
    connector: Box<dyn Connector>,
    recorder: Recorder,
    attempts: u64,
}

impl LiveCapture {
    pub fn new(config: CaptureConfig, connector: Box<dyn Connector>, sink: CaptureSink) -> Self {
        Self {
            config,
            connector,
            recorder: Recorder::new(sink),
            attempts: 0,
        }
    }

    /// Builds the connector and opens the output named in `config`
    ///
    /// # Errors
    /// `InvalidUrl` for a bad service URL, `SinkOpen` if the output file can't be created
    pub async fn from_config(config: CaptureConfig) -> Result<Self, LiveError> {
        let connector = connector_for(&config)?;
        let sink = match &config.output {
            OutputTarget::File(path) => CaptureSink::new().with_file(path).await?,
            OutputTarget::Stdout => CaptureSink::new().with_stdout(),
        };
        Ok(Self::new(config, connector, sink))
    }

    pub fn with_reporter(mut self, reporter: impl CaptureReporter + 'static) -> Self {
        self.recorder = self.recorder.with_reporter(reporter);
        self
    }

    pub fn stats(&self) -> CaptureStats {
        self.recorder.stats()
    }

    /// Number of connection attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Captures until cancelled, the output consumer leaves, or a fatal error occurs
    ///
    /// # Errors
    /// Any error for which [`LiveError::is_fatal`] holds
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<Shutdown, LiveError> {
        match self.recorder.write_header().await {
            Err(LiveError::OutputClosed) => return Ok(Shutdown::OutputClosed),
            res => res?,
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(Shutdown::Cancelled);
            }

            self.attempts += 1;
            debug!(
                "Connecting to {} (attempt {})",
                self.config.api_url, self.attempts
            );
            let opened = tokio::select! {
                _ = cancel.cancelled() => return Ok(Shutdown::Cancelled),
                opened = self.connector.open() => opened,
            };

            match opened {
                Ok(mut channel) => {
                    let mut session = Session::new(&self.config);
                    let running = session.run(channel.as_mut(), &mut self.recorder);
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => None,
                        outcome = running => Some(outcome),
                    };
                    channel.close().await;

                    match outcome {
                        None => return Ok(Shutdown::Cancelled),
                        Some(Ok(end)) => {
                            debug!("Session ended after {} frame(s)", end.frames);
                            if !end.authenticated {
                                warn!("Disconnected before authenticating, is the token right?");
                            }
                        }
                        Some(Err(LiveError::OutputClosed)) => return Ok(Shutdown::OutputClosed),
                        Some(Err(e)) => return Err(e),
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Unable to connect: {e}"),
            }

            info!("Connection closed. Trying to re-establish");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(Shutdown::Cancelled),
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }
}
