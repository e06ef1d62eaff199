//! Caller-supplied sink for human-readable progress output.
//!
//! Every pipeline phase writes free-form diagnostic lines (build output,
//! bracketed disk snapshots, phase banners) to one of these. The exact text
//! is not a contract. Writes are best-effort: a broken sink must never fail
//! the run it is narrating.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// Cloneable handle to a shared line-oriented output sink.
///
/// Parallel build workers hold clones of the same sink, so writes are
/// serialized through a mutex.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    /// Wrap any writer as a sink.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Sink that writes to the process stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Sink that discards everything.
    pub fn null() -> Self {
        Self::new(std::io::sink())
    }

    /// In-memory sink plus a handle for reading back what was written.
    pub fn capture() -> (Self, CapturedOutput) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let captured = CapturedOutput { buf: buf.clone() };
        (Self::new(SharedBuf(buf)), captured)
    }

    /// Write one line, appending a newline. Errors are swallowed.
    pub fn line(&self, line: impl AsRef<str>) {
        if let Ok(mut w) = self.inner.lock() {
            let _ = writeln!(w, "{}", line.as_ref());
        }
    }
}

/// Read side of [`Sink::capture`].
pub struct CapturedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    /// Everything written to the sink so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().expect("sink buffer poisoned");
        String::from_utf8_lossy(&buf).into_owned()
    }
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut buf = self.0.lock().expect("sink buffer poisoned");
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_sink_returns_written_lines() {
        let (sink, captured) = Sink::capture();
        sink.line("[build] disk: 10.0 GiB used");
        sink.line("second");
        assert_eq!(captured.contents(), "[build] disk: 10.0 GiB used\nsecond\n");
    }

    #[test]
    fn clones_share_the_same_buffer() {
        let (sink, captured) = Sink::capture();
        let clone = sink.clone();
        sink.line("from original");
        clone.line("from clone");
        let text = captured.contents();
        assert!(text.contains("from original"));
        assert!(text.contains("from clone"));
    }
}
