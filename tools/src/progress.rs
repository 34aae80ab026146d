// Single status line on stderr, shared with the log output

use std::io::{self, Write};

use indicatif::{DecimalBytes, ProgressBar, ProgressDrawTarget, ProgressStyle};
use live_capture::{CaptureReporter, CaptureStats};
use tracing_subscriber::fmt::MakeWriter;

/// Owns the status line. Clones share the same line.
#[derive(Clone)]
pub struct ProgressLine {
    bar: ProgressBar,
}

impl ProgressLine {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::with_template("{msg}") {
            bar.set_style(style);
        }
        Self { bar }
    }

    /// Leaves the last status visible and stops redrawing
    pub fn finish(&self) {
        self.bar.abandon();
    }
}

pub fn status(stats: &CaptureStats) -> String {
    format!(
        "Captured: {} packet{} ({})",
        stats.frames,
        if stats.frames == 1 { "" } else { "s" },
        DecimalBytes(stats.bytes)
    )
}

impl CaptureReporter for ProgressLine {
    fn update(&mut self, stats: &CaptureStats) {
        self.bar.set_message(status(stats));
    }
}

/// Log lines are printed above the status line instead of through it
pub struct SuspendingStderr {
    bar: ProgressBar,
}

impl Write for SuspendingStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bar.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for ProgressLine {
    type Writer = SuspendingStderr;

    fn make_writer(&'a self) -> Self::Writer {
        SuspendingStderr {
            bar: self.bar.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text() {
        assert_eq!(
            status(&CaptureStats {
                frames: 1,
                bytes: 3
            }),
            "Captured: 1 packet (3 B)"
        );
        assert_eq!(
            status(&CaptureStats {
                frames: 2,
                bytes: 1500
            }),
            "Captured: 2 packets (1.50 kB)"
        );
    }
}
