//! Prefix demultiplexer: one interleaved text stream in, one writer per
//! tagged producer out.

use std::io::{self, Write};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Unique per-invocation tag of the form `[<hex>] `.
pub fn random_prefix() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("[{}] ", &id[..12])
}

type Dest = Box<dyn Write + Send>;

/// `io::Write` filter that routes complete lines by the first registered
/// prefix they contain. Lines without a known prefix go to the default
/// writer untouched.
pub struct LineDemux {
    routes: Vec<(Vec<u8>, Dest)>,
    default: Dest,
    pending: Vec<u8>,
}

impl LineDemux {
    pub fn new(default: impl Write + Send + 'static) -> Self {
        Self { routes: Vec::new(), default: Box::new(default), pending: Vec::new() }
    }

    /// Register `prefix`; earlier registrations win when several match a line.
    pub fn route(mut self, prefix: impl Into<String>, dest: impl Write + Send + 'static) -> Self {
        self.routes.push((prefix.into().into_bytes(), Box::new(dest)));
        self
    }

    /// Bytes of the trailing partial line still waiting for `\n`.
    pub fn pending(&self) -> &[u8] { &self.pending }

    fn dispatch(&mut self, line: &[u8]) -> io::Result<()> {
        for (prefix, dest) in self.routes.iter_mut() {
            if let Some(at) = find(line, prefix) {
                dest.write_all(&line[at + prefix.len()..])?;
                return dest.write_all(b"\n");
            }
        }
        self.default.write_all(line)?;
        self.default.write_all(b"\n")
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Write for LineDemux {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            self.dispatch(&line)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for (_, dest) in self.routes.iter_mut() {
            dest.flush()?;
        }
        self.default.flush()
    }
}

/// Feed `stream` into `demux` until it ends or `cancel` fires. Returns the
/// number of bytes consumed. A trailing partial line stays buffered.
pub async fn demux_stream<S, E>(stream: S, demux: &mut LineDemux, cancel: &CancellationToken) -> io::Result<u64>
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut total = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { debug!(bytes = total, "demux cancelled"); break; }
            next = stream.next() => match next {
                Some(Ok(chunk)) => {
                    demux.write_all(&chunk)?;
                    total += chunk.len() as u64;
                }
                Some(Err(e)) => { warn!(error = %e, "demux input error"); break; }
                None => break,
            }
        }
    }
    demux.flush()?;
    if !demux.pending().is_empty() {
        info!(bytes = demux.pending().len(), "demux input ended mid-line");
    }
    Ok(total)
}
