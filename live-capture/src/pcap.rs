//! Classic PCAP container writer
//!
//! Every output receives the 24 byte global header exactly once, followed by one
//! 16 byte record header plus the raw payload per captured frame. All fields are
//! big-endian so readers pick the byte order up from the magic number.

use std::{
    io,
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::LiveError;

/// Link-layer type for raw IP packets without any framing
pub const LINKTYPE_RAW: u32 = 101;
/// Largest frame a reader should expect
pub const SNAPSHOT_LENGTH: u32 = 65535;

// Classic PCAP (big-endian) global header for LINKTYPE_RAW (101)
const PCAP_GLOBAL_HEADER_BE: [u8; 24] = [
    0xA1, 0xB2, 0xC3, 0xD4, // magic (big-endian stream)
    0x00, 0x02, // version maj
    0x00, 0x04, // version min
    0x00, 0x00, 0x00, 0x00, // thiszone
    0x00, 0x00, 0x00, 0x00, // sigfigs
    0x00, 0x00, 0xFF, 0xFF, // snaplen = 65535
    0x00, 0x00, 0x00, 101, // network = 101 (RAW)
];

/// The global header every output starts with
pub fn global_header() -> [u8; 24] {
    PCAP_GLOBAL_HEADER_BE
}

/// A single intercepted packet, stamped when it arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
    captured_at_ms: u64,
}

impl Frame {
    /// Stamps the payload with the current wall clock time
    pub fn new(payload: Vec<u8>) -> Self {
        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::with_timestamp(payload, captured_at_ms)
    }

    /// Builds a frame captured at `captured_at_ms` milliseconds since the epoch
    pub fn with_timestamp(payload: Vec<u8>, captured_at_ms: u64) -> Self {
        Self {
            payload,
            captured_at_ms,
        }
    }

    /// Decodes a hex encoded packet as sent by the monitoring service
    pub fn from_hex(hex_payload: &str) -> Result<Self, LiveError> {
        let payload = hex::decode(hex_payload.trim())
            .map_err(|e| LiveError::ProtocolDecode(format!("invalid packet hex: {e}")))?;
        Ok(Self::new(payload))
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whole seconds since the epoch
    pub fn seconds(&self) -> u32 {
        (self.captured_at_ms / 1000) as u32
    }

    /// Sub-second part in microseconds.
    ///
    /// Computed on the fractional seconds as a float and truncated, so the value
    /// matches captures produced by the existing tooling bit for bit, including the
    /// occasional one microsecond undershoot of the float math.
    pub fn microseconds(&self) -> u32 {
        let seconds = self.captured_at_ms as f64 / 1000.0;
        ((seconds % 1.0) * 1_000_000.0).floor() as u32
    }

    /// The 16 byte record header preceding the payload
    pub fn record_header(&self) -> [u8; 16] {
        let len_bytes = (self.payload.len() as u32).to_be_bytes();

        // ts_sec, ts_usec, incl_len, orig_len
        let mut rec = [0u8; 16];
        rec[0..4].copy_from_slice(&self.seconds().to_be_bytes());
        rec[4..8].copy_from_slice(&self.microseconds().to_be_bytes());
        rec[8..12].copy_from_slice(&len_bytes);
        rec[12..16].copy_from_slice(&len_bytes);
        rec
    }
}

/// Where a sink backend writes to. The two kinds differ in how write failures are
/// treated: a file must never silently lose data, a stream may be closed by whoever
/// reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    File,
    Stream,
}

struct SinkBackend {
    kind: SinkKind,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    header_written: bool,
    /// A stream that failed mid-write may hold a partial record, nothing more goes to it
    disabled: bool,
}

impl std::fmt::Debug for SinkBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkBackend")
            .field("kind", &self.kind)
            .field("header_written", &self.header_written)
            .field("disabled", &self.disabled)
            .finish()
    }
}

impl SinkBackend {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), LiveError> {
        if self.disabled {
            return Ok(());
        }
        let res: io::Result<()> = async {
            self.writer.write_all(buf).await?;
            self.writer.flush().await
        }
        .await;

        match (res, self.kind) {
            (Ok(()), _) => Ok(()),
            (Err(e), SinkKind::File) => Err(LiveError::SinkWrite(e)),
            (Err(e), SinkKind::Stream) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("Output stream consumer went away");
                Err(LiveError::OutputClosed)
            }
            (Err(e), SinkKind::Stream) => {
                warn!("Failed to write to output stream, no further frames go to it: {e}");
                self.disabled = true;
                Ok(())
            }
        }
    }
}

/// Writes the capture container to one or more outputs, each tracking its own header
#[derive(Debug, Default)]
pub struct CaptureSink {
    backends: Vec<SinkBackend>,
}

impl CaptureSink {
    /// Creates a sink without any outputs
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an output backed by any async writer
    pub fn with_writer(
        mut self,
        kind: SinkKind,
        writer: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Self {
        self.backends.push(SinkBackend {
            kind,
            writer: Box::new(writer),
            header_written: false,
            disabled: false,
        });
        self
    }

    /// Creates or truncates `path` and adds it as a file output
    pub async fn with_file(self, path: impl AsRef<Path>) -> Result<Self, LiveError> {
        let path = path.as_ref();
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|source| LiveError::SinkOpen {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Opened capture file {}", path.display());
        Ok(self.with_writer(SinkKind::File, file))
    }

    /// Adds the process stdout as a continuous stream output
    pub fn with_stdout(self) -> Self {
        self.with_writer(SinkKind::Stream, tokio::io::stdout())
    }

    /// Writes the global header to every output that has not received it yet
    ///
    /// # Errors
    /// `SinkWrite` if a file output fails, `OutputClosed` if a stream consumer is gone
    pub async fn write_header(&mut self) -> Result<(), LiveError> {
        let header = global_header();
        for backend in self.backends.iter_mut().filter(|b| !b.header_written) {
            backend.write_all(&header).await?;
            backend.header_written = true;
        }
        Ok(())
    }

    /// Appends one record header and the raw payload to every output
    ///
    /// # Errors
    /// `HeaderNotWritten` if [`CaptureSink::write_header`] was not called first,
    /// otherwise the same failures as the header write
    pub async fn append_frame(&mut self, frame: &Frame) -> Result<(), LiveError> {
        if self.backends.iter().any(|b| !b.header_written) {
            return Err(LiveError::HeaderNotWritten);
        }

        let mut record = Vec::with_capacity(16 + frame.len());
        record.extend_from_slice(&frame.record_header());
        record.extend_from_slice(frame.payload());

        for backend in self.backends.iter_mut() {
            backend.write_all(&record).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ClosedPipe, ShortWriter, SharedBuffer};

    #[test]
    fn global_header_layout() {
        let h = global_header();
        assert_eq!(h.len(), 24);
        assert_eq!(u32::from_be_bytes(h[0..4].try_into().unwrap()), 0xA1B2C3D4);
        assert_eq!(u16::from_be_bytes(h[4..6].try_into().unwrap()), 2);
        assert_eq!(u16::from_be_bytes(h[6..8].try_into().unwrap()), 4);
        assert_eq!(i32::from_be_bytes(h[8..12].try_into().unwrap()), 0);
        assert_eq!(u32::from_be_bytes(h[12..16].try_into().unwrap()), 0);
        assert_eq!(
            u32::from_be_bytes(h[16..20].try_into().unwrap()),
            SNAPSHOT_LENGTH
        );
        assert_eq!(
            u32::from_be_bytes(h[20..24].try_into().unwrap()),
            LINKTYPE_RAW
        );
    }

    #[test]
    fn record_header_fields() {
        let frame = Frame::with_timestamp(vec![1, 2, 3, 4, 5], 1_600_000_000_500);
        let rec = frame.record_header();
        assert_eq!(u32::from_be_bytes(rec[0..4].try_into().unwrap()), 1_600_000_000);
        assert_eq!(u32::from_be_bytes(rec[4..8].try_into().unwrap()), 500_000);
        assert_eq!(u32::from_be_bytes(rec[8..12].try_into().unwrap()), 5);
        assert_eq!(u32::from_be_bytes(rec[12..16].try_into().unwrap()), 5);
    }

    #[test]
    fn microseconds_truncate() {
        for ms in [0u64, 999, 1_000, 1_250, 1_700_000_123_456, 1_234_567_890_123] {
            let frame = Frame::with_timestamp(Vec::new(), ms);
            let expected = (((ms as f64 / 1000.0) % 1.0) * 1_000_000.0).floor() as u32;
            assert_eq!(frame.seconds(), (ms / 1000) as u32);
            assert_eq!(frame.microseconds(), expected);
            assert!(frame.microseconds() < 1_000_000);
        }
        assert_eq!(Frame::with_timestamp(Vec::new(), 1_250).microseconds(), 250_000);
        assert_eq!(Frame::with_timestamp(Vec::new(), 7_000).microseconds(), 0);
    }

    #[test]
    fn hex_payload() {
        let frame = Frame::from_hex("aabbcc").unwrap();
        assert_eq!(frame.payload(), &[0xAA, 0xBB, 0xCC]);
        assert!(matches!(
            Frame::from_hex("not hex"),
            Err(LiveError::ProtocolDecode(_))
        ));
    }

    #[tokio::test]
    async fn file_output_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let mut sink = CaptureSink::new().with_file(&path).await.unwrap();
        sink.write_header().await.unwrap();
        // Second call must not duplicate the header
        sink.write_header().await.unwrap();

        let lens = [0usize, 3, 60, 1500];
        for (i, len) in lens.iter().enumerate() {
            let frame = Frame::with_timestamp(vec![i as u8; *len], 1_000 * i as u64);
            sink.append_frame(&frame).await.unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        let expected = 24 + lens.iter().map(|l| 16 + l).sum::<usize>();
        assert_eq!(bytes.len(), expected);
        assert_eq!(&bytes[..24], &global_header());
    }

    #[tokio::test]
    async fn file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.pcap");
        std::fs::write(&path, vec![0xFF; 100]).unwrap();

        let mut sink = CaptureSink::new().with_file(&path).await.unwrap();
        sink.write_header().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), global_header());
    }

    #[tokio::test]
    async fn append_requires_header() {
        let mut sink = CaptureSink::new().with_writer(SinkKind::Stream, tokio::io::sink());
        let frame = Frame::with_timestamp(vec![1], 0);
        assert!(matches!(
            sink.append_frame(&frame).await,
            Err(LiveError::HeaderNotWritten)
        ));
    }

    #[tokio::test]
    async fn unopenable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.pcap");
        assert!(matches!(
            CaptureSink::new().with_file(&path).await,
            Err(LiveError::SinkOpen { .. })
        ));
    }

    #[tokio::test]
    async fn closed_stream() {
        let mut sink = CaptureSink::new().with_writer(SinkKind::Stream, ClosedPipe);
        assert!(matches!(
            sink.write_header().await,
            Err(LiveError::OutputClosed)
        ));

        let mut sink = CaptureSink::new().with_writer(SinkKind::File, ClosedPipe);
        assert!(matches!(
            sink.write_header().await,
            Err(LiveError::SinkWrite(_))
        ));
    }

    #[tokio::test]
    async fn failed_stream_is_not_written_again() {
        let buffer = SharedBuffer::default();
        // Accepts the header and 10 bytes of the first record, then fails once
        let writer = ShortWriter::new(buffer.clone(), 24 + 10);
        let mut sink = CaptureSink::new().with_writer(SinkKind::Stream, writer);
        sink.write_header().await.unwrap();

        sink.append_frame(&Frame::with_timestamp(vec![1, 2, 3], 1_000))
            .await
            .unwrap();
        sink.append_frame(&Frame::with_timestamp(vec![4, 5, 6], 2_000))
            .await
            .unwrap();

        assert_eq!(buffer.bytes().len(), 24 + 10);
    }
}
