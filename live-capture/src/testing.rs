// In-memory stand-ins for the transport and the output, used by the unit tests

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::{
    LiveError,
    channel::{Connector, ControlChannel, Envelope},
};

pub(crate) type Script = Vec<Result<Envelope, LiveError>>;

pub(crate) fn event(name: &str, data: Value) -> Result<Envelope, LiveError> {
    Ok(Envelope::new(name, data))
}

/// Everything one scripted connection saw
#[derive(Debug, Default)]
pub(crate) struct ConnectionLog {
    pub sent: Vec<Envelope>,
    pub closed: bool,
}

/// Replays a fixed list of inbound events, then reports the channel as closed
#[derive(Debug)]
pub(crate) struct ScriptedChannel {
    inbound: VecDeque<Result<Envelope, LiveError>>,
    log: Arc<Mutex<ConnectionLog>>,
}

impl ScriptedChannel {
    pub fn new(script: Script) -> (Self, Arc<Mutex<ConnectionLog>>) {
        let log = Arc::new(Mutex::new(ConnectionLog::default()));
        let channel = Self {
            inbound: script.into_iter().collect(),
            log: log.clone(),
        };
        (channel, log)
    }
}

impl ControlChannel for ScriptedChannel {
    fn send(&mut self, envelope: Envelope) -> BoxFuture<'_, Result<(), LiveError>> {
        Box::pin(async move {
            let mut log = self.log.lock().unwrap();
            if log.closed {
                return Err(LiveError::NoEstablishedConnection);
            }
            log.sent.push(envelope);
            Ok(())
        })
    }

    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Envelope, LiveError>>> {
        Box::pin(async move { self.inbound.pop_front() })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.log.lock().unwrap().closed = true;
        })
    }
}

/// Hands out one scripted channel per `open`, and cancels `done` once it runs dry
#[derive(Debug)]
pub(crate) struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    pub logs: Mutex<Vec<Arc<Mutex<ConnectionLog>>>>,
    pub attempts: Mutex<usize>,
    done: CancellationToken,
}

impl ScriptedConnector {
    pub fn new(scripts: Vec<Script>, done: CancellationToken) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            logs: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            done,
        }
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    pub fn sent(&self, connection: usize) -> Vec<Envelope> {
        self.logs.lock().unwrap()[connection]
            .lock()
            .unwrap()
            .sent
            .clone()
    }

    pub fn closed(&self, connection: usize) -> bool {
        self.logs.lock().unwrap()[connection].lock().unwrap().closed
    }
}

impl Connector for ScriptedConnector {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ControlChannel>, LiveError>> {
        Box::pin(async move {
            *self.attempts.lock().unwrap() += 1;
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(script) => {
                    let (channel, log) = ScriptedChannel::new(script);
                    self.logs.lock().unwrap().push(log);
                    Ok(Box::new(channel) as Box<dyn ControlChannel>)
                }
                None => {
                    self.done.cancel();
                    Err(LiveError::NoEstablishedConnection)
                }
            }
        })
    }
}

impl Connector for Arc<ScriptedConnector> {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn ControlChannel>, LiveError>> {
        self.as_ref().open()
    }
}

/// An output whose bytes stay readable after the sink took ownership of it
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// An output whose reader has gone away
#[derive(Debug, Default)]
pub(crate) struct ClosedPipe;

impl AsyncWrite for ClosedPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Takes `limit` bytes, fails a single write, then accepts everything again
#[derive(Debug)]
pub(crate) struct ShortWriter {
    buffer: SharedBuffer,
    remaining: usize,
    failed: bool,
}

impl ShortWriter {
    pub fn new(buffer: SharedBuffer, limit: usize) -> Self {
        Self {
            buffer,
            remaining: limit,
            failed: false,
        }
    }
}

impl AsyncWrite for ShortWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.failed && self.remaining == 0 {
            self.failed = true;
            return Poll::Ready(Err(io::Error::other("device went away")));
        }
        let n = if self.failed {
            buf.len()
        } else {
            buf.len().min(self.remaining)
        };
        if !self.failed {
            self.remaining -= n;
        }
        self.buffer.0.lock().unwrap().extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
