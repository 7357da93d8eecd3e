//! Prelude buffering for SSE streams (spec §4.I).
//!
//! Holds emitted lines until the stream becomes "observably live" — a
//! user-visible delta, a terminal event, the prelude timeout, or the byte
//! cap — whichever comes first. Before that point a retryable upstream
//! failure can still fail over silently; after it, the stream is committed
//! to this account.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

const DELTA_MARKERS: &[&str] = &[
    "response.output_text.delta",
    "response.output_audio.delta",
    "response.output_audio_transcript.delta",
];

const TERMINAL_MARKERS: &[&str] = &["response.completed", "response.failed", "response.incomplete"];

#[derive(Debug, PartialEq, Eq)]
pub enum PreludeOutcome {
    /// The prelude observed a live event and flushed; bytes after this
    /// point must be forwarded immediately and failover is no longer silent.
    Flushed { buffered: Vec<u8> },
    /// The upstream ended (or errored) before anything observably live was
    /// seen; the caller is free to retry on another account.
    EndedBeforeFlush { buffered: Vec<u8> },
}

/// Reads from `body` until a flush condition is met, returning the bytes
/// read so far and which condition fired. Does not consume the rest of the
/// stream — the caller continues reading `body` directly afterward.
pub async fn buffer_prelude<R>(
    body: &mut R,
    timeout: Duration,
    max_bytes: usize,
) -> Result<PreludeOutcome, std::io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut buffered = Vec::new();
    let mut scan_from = 0usize;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut chunk = [0u8; 8192];
    loop {
        if buffered.len() >= max_bytes {
            return Ok(PreludeOutcome::Flushed { buffered });
        }
        if contains_marker(&buffered[scan_from..], TERMINAL_MARKERS)
            || contains_marker(&buffered[scan_from..], DELTA_MARKERS)
        {
            return Ok(PreludeOutcome::Flushed { buffered });
        }
        scan_from = buffered.len().saturating_sub(64);

        tokio::select! {
            _ = &mut deadline => {
                return Ok(PreludeOutcome::Flushed { buffered });
            }
            read = body.read(&mut chunk) => {
                match read? {
                    0 => return Ok(PreludeOutcome::EndedBeforeFlush { buffered }),
                    n => buffered.extend_from_slice(&chunk[..n]),
                }
            }
        }
    }
}

fn contains_marker(haystack: &[u8], markers: &[&str]) -> bool {
    markers.iter().any(|m| haystack.windows(m.len()).any(|w| w == m.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn flushes_on_delta_marker() {
        let mut body = Cursor::new(b"event: response.output_text.delta\ndata: {}\n\n".to_vec());
        let outcome = buffer_prelude(&mut body, Duration::from_secs(1), 65_536).await.unwrap();
        assert!(matches!(outcome, PreludeOutcome::Flushed { .. }));
    }

    #[tokio::test]
    async fn ends_before_flush_when_stream_closes_with_no_marker() {
        let mut body = Cursor::new(b"event: response.created\ndata: {}\n\n".to_vec());
        let outcome = buffer_prelude(&mut body, Duration::from_secs(1), 65_536).await.unwrap();
        assert!(matches!(outcome, PreludeOutcome::EndedBeforeFlush { .. }));
    }

    #[tokio::test]
    async fn flushes_on_timeout() {
        let (mut _writer, mut reader) = tokio::io::duplex(1024);
        let outcome = buffer_prelude(&mut reader, Duration::from_millis(20), 65_536).await.unwrap();
        assert!(matches!(outcome, PreludeOutcome::Flushed { .. }));
    }

    #[tokio::test]
    async fn flushes_on_byte_cap() {
        let mut body = Cursor::new(vec![b'x'; 200]);
        let outcome = buffer_prelude(&mut body, Duration::from_secs(5), 100).await.unwrap();
        match outcome {
            PreludeOutcome::Flushed { buffered } => assert!(buffered.len() >= 100),
            _ => panic!("expected flush"),
        }
    }
}
