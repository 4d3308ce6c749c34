use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::OverflowPolicy;

const CHUNK: usize = 8192;

#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

/// Output collected so far. Shared with the reader task so an abandoned
/// reader still leaves its bytes behind.
#[derive(Debug, Clone, Default)]
pub(crate) struct Sink(Arc<Mutex<Captured>>);

impl Sink {
    fn with<T>(&self, f: impl FnOnce(&mut Captured) -> T) -> T {
        f(&mut self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Takes what was captured; `cut_short` marks it truncated.
    pub(crate) fn take(&self, cut_short: bool) -> Captured {
        self.with(|c| {
            let mut out = std::mem::take(c);
            out.truncated |= cut_short;
            out
        })
    }
}

/// Reads `reader` to EOF keeping at most `limit` bytes in `sink`. Under `Kill`
/// the first overflow cancels `overflow` and reading stops; under `Drain` the
/// rest is consumed and discarded so the tool never blocks on a full pipe.
pub(crate) async fn read_bounded<R>(mut reader: R, limit: usize, policy: OverflowPolicy, overflow: CancellationToken, sink: Sink)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        };
        let overflowed = sink.with(|c| {
            let room = limit.saturating_sub(c.bytes.len());
            if n <= room {
                c.bytes.extend_from_slice(&buf[..n]);
                return false;
            }
            c.bytes.extend_from_slice(&buf[..room]);
            c.truncated = true;
            true
        });
        if overflowed && policy == OverflowPolicy::Kill {
            overflow.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_everything_under_the_limit() {
        let data: &[u8] = b"hello\nworld\n";
        let sink = Sink::default();
        read_bounded(data, 64, OverflowPolicy::Drain, CancellationToken::new(), sink.clone()).await;
        let c = sink.take(false);
        assert_eq!(c.bytes, data);
        assert!(!c.truncated);
    }

    #[tokio::test]
    async fn drain_truncates_without_signalling() {
        let data = vec![b'x'; 50_000];
        let token = CancellationToken::new();
        let sink = Sink::default();
        read_bounded(&data[..], 1000, OverflowPolicy::Drain, token.clone(), sink.clone()).await;
        let c = sink.take(false);
        assert_eq!(c.bytes.len(), 1000);
        assert!(c.truncated);
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn kill_policy_signals_overflow() {
        let data = vec![b'x'; 50_000];
        let token = CancellationToken::new();
        let sink = Sink::default();
        read_bounded(&data[..], 10, OverflowPolicy::Kill, token.clone(), sink.clone()).await;
        let c = sink.take(false);
        assert_eq!(c.bytes.len(), 10);
        assert!(c.truncated);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn abandoned_reader_keeps_what_it_read() {
        use tokio::io::AsyncWriteExt;
        let (mut writer, reader) = tokio::io::duplex(64);
        let sink = Sink::default();
        let task = tokio::spawn(read_bounded(reader, 1024, OverflowPolicy::Drain, CancellationToken::new(), sink.clone()));
        writer.write_all(b"93.184.216.34\n").await.unwrap();
        while sink.with(|c| c.bytes.len()) < 14 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let c = sink.take(true);
        assert_eq!(c.bytes, b"93.184.216.34\n");
        assert!(c.truncated);
        drop(writer);
    }
}
