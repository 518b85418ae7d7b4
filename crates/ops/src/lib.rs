//! kfx ops: streaming plumbing around a deployment. Build log tailing,
//! byte-to-line pumps and the prefix demultiplexer used to untangle
//! interleaved command output.

#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

pub mod build_logs;
pub mod demux;
pub mod lines;

pub use build_logs::{BuildLogs, KubeBuildLogs};
pub use demux::{demux_stream, random_prefix, LineDemux};
pub use lines::{pump_lines, PumpStats};

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Cloneable writer handle shared by a foreground flow and its background
/// tasks. Each `write` call is atomic with respect to the other handles.
#[derive(Clone)]
pub struct SharedSink(Arc<Mutex<dyn Write + Send>>);

impl SharedSink {
    pub fn new(w: impl Write + Send + 'static) -> Self { Self(Arc::new(Mutex::new(w))) }

    /// Wrap a writer the caller keeps a handle to (e.g. a test buffer).
    pub fn from_shared<W: Write + Send + 'static>(w: Arc<Mutex<W>>) -> Self { Self(w) }

    pub fn stdout() -> Self { Self::new(io::stdout()) }

    /// Write `line` plus newline under a single lock so lines never interleave.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut w = self.lock()?;
        w.write_all(line.as_bytes())?;
        w.write_all(b"\n")
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, dyn Write + Send + 'static>> {
        self.0.lock().map_err(|_| io::Error::new(io::ErrorKind::Other, "output sink poisoned"))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.lock()?.write(buf) }

    fn flush(&mut self) -> io::Result<()> { self.lock()?.flush() }
}

impl std::fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("SharedSink") }
}
