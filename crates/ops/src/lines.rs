//! Byte stream to line-framed writer pump.

use std::io::{self, Write};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Totals reported by [`pump_lines`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub lines: u64,
    pub bytes: u64,
}

/// Consume a stream of bytes, split it into lines and write each one to
/// `sink` behind `prefix`. The last partial line is flushed when the stream
/// ends; invalid UTF-8 is replaced rather than dropped.
pub async fn pump_lines<S, E, W>(stream: S, sink: &mut W, prefix: &str, cancel: &CancellationToken, ctx: Option<&str>) -> io::Result<PumpStats>
where
    S: Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
    W: Write + ?Sized,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let mut stats = PumpStats::default();
    let ctx = ctx.unwrap_or("-");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => { info!(ctx = %ctx, "log pump cancelled"); break; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        stats.bytes += chunk.len() as u64;
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            writeln!(sink, "{}{}", prefix, String::from_utf8_lossy(&line))?;
                            stats.lines += 1;
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "log stream error"); break; }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        writeln!(sink, "{}{}", prefix, String::from_utf8_lossy(&buf))?;
        stats.lines += 1;
    }
    sink.flush()?;
    info!(ctx = %ctx, lines = stats.lines, "log pump ended");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn splits_lines_across_chunks_and_flushes_tail() {
        let chunks = vec![
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"hello\nwor")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"ld\n")),
            Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"tail")),
        ];
        let mut out = Vec::new();
        let stats = pump_lines(stream::iter(chunks), &mut out, "[b/s] ", &CancellationToken::new(), Some("test")).await.expect("pump");
        assert_eq!(String::from_utf8(out).expect("utf8"), "[b/s] hello\n[b/s] world\n[b/s] tail\n");
        assert_eq!(stats, PumpStats { lines: 3, bytes: 16 });
    }

    #[tokio::test]
    async fn stream_error_ends_pump_without_failing() {
        let chunks = vec![
            Ok(bytes::Bytes::from_static(b"a\n")),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
            Ok(bytes::Bytes::from_static(b"never\n")),
        ];
        let mut out = Vec::new();
        let stats = pump_lines(stream::iter(chunks), &mut out, "", &CancellationToken::new(), None).await.expect("pump");
        assert_eq!(out, b"a\n");
        assert_eq!(stats.lines, 1);
    }

    #[tokio::test]
    async fn cancel_stops_pump_quickly() {
        let cancel = CancellationToken::new();
        // Slow stream: yields one line after a delay, forever
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                yield Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"line\n"));
            }
        };
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut out = Vec::new();
            pump_lines(s, &mut out, "", &c, Some("cancel-test")).await.map(|_| out)
        });
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        cancel.cancel();
        let out = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pump did not stop")
            .expect("join")
            .expect("pump");
        assert!(out.starts_with(b"line\n"));
    }
}
