//! Progress aggregation across concurrently running chunks.

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

use crate::types::ProgressFn;

/// Size of the pieces an upload body is handed to the HTTP client in.
const UPLOAD_PIECE_SIZE: usize = 64 * 1024;

/// Shared byte counter of one batch.
///
/// The total only grows and never exceeds the batch size. The sink is called
/// while the counter is locked, so it observes totals in increasing order.
pub struct ProgressAccumulator {
    total: Mutex<u64>,
    limit: u64,
    sink: Option<ProgressFn>,
}

impl ProgressAccumulator {
    pub fn new(limit: u64, sink: Option<ProgressFn>) -> Arc<Self> {
        Arc::new(Self {
            total: Mutex::new(0),
            limit,
            sink,
        })
    }

    /// Adds `delta` bytes and returns the new total.
    pub fn add(&self, delta: u64) -> u64 {
        let mut total = self.total.lock().unwrap_or_else(PoisonError::into_inner);
        *total = total.saturating_add(delta).min(self.limit);
        if let Some(sink) = &self.sink {
            sink(*total);
        }
        *total
    }

    pub fn total(&self) -> u64 {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the tracker for one chunk.
    pub fn chunk(self: &Arc<Self>) -> ChunkProgress {
        ChunkProgress {
            accumulator: Arc::clone(self),
            high_water: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Per-chunk view of a [`ProgressAccumulator`].
///
/// Chunk bodies report cumulative byte counts; only the growth past the
/// highest count seen so far is added to the batch total. A body rewound for
/// another try therefore does not count its bytes twice.
#[derive(Clone)]
pub struct ChunkProgress {
    accumulator: Arc<ProgressAccumulator>,
    high_water: Arc<AtomicU64>,
}

impl ChunkProgress {
    /// Records that `cumulative` bytes of this chunk have been transferred.
    pub fn update(&self, cumulative: u64) {
        let previous = self.high_water.fetch_max(cumulative, Ordering::SeqCst);
        if cumulative > previous {
            self.accumulator.add(cumulative - previous);
        }
    }

    pub fn transferred(&self) -> u64 {
        self.high_water.load(Ordering::SeqCst)
    }
}

/// Reader adapter reporting the cumulative bytes read to a [`ChunkProgress`].
pub struct ProgressReader<R> {
    inner: R,
    read: u64,
    progress: ChunkProgress,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, progress: ChunkProgress) -> Self {
        Self {
            inner,
            read: 0,
            progress,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let n = (buf.filled().len() - before) as u64;
            if n > 0 {
                self.read += n;
                let read = self.read;
                self.progress.update(read);
            }
        }
        result
    }
}

/// Splits an upload payload into pieces, reporting progress as each is handed out.
pub fn progress_stream(
    data: Bytes,
    progress: Option<ChunkProgress>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let len = data.len();
    let starts = (0..len).step_by(UPLOAD_PIECE_SIZE);
    stream::iter(starts.map(move |start| {
        let end = (start + UPLOAD_PIECE_SIZE).min(len);
        if let Some(progress) = &progress {
            progress.update(end as u64);
        }
        Ok(data.slice(start..end))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncReadExt;

    fn recording_sink() -> (ProgressFn, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: ProgressFn = Arc::new(move |total| sink_seen.lock().unwrap().push(total));
        (sink, seen)
    }

    #[test]
    fn rewound_chunk_is_not_double_counted() {
        let (sink, seen) = recording_sink();
        let acc = ProgressAccumulator::new(100, Some(sink));
        let chunk = acc.chunk();

        chunk.update(40);
        chunk.update(10); // body rewound for a retry
        chunk.update(40);
        chunk.update(50);

        assert_eq!(acc.total(), 50);
        assert_eq!(*seen.lock().unwrap(), vec![40, 50]);
    }

    #[test]
    fn total_never_exceeds_limit() {
        let acc = ProgressAccumulator::new(10, None);
        acc.chunk().update(8);
        acc.chunk().update(8);
        assert_eq!(acc.total(), 10);
    }

    #[tokio::test]
    async fn reader_reports_cumulative_bytes() {
        let (sink, seen) = recording_sink();
        let acc = ProgressAccumulator::new(6, Some(sink));
        let mut reader = ProgressReader::new(&b"abcdef"[..], acc.chunk());

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"abcdef");
        assert_eq!(acc.total(), 6);
        assert_eq!(seen.lock().unwrap().last(), Some(&6));
    }

    #[tokio::test]
    async fn upload_stream_splits_payload() {
        let acc = ProgressAccumulator::new(150_000, None);
        let data = Bytes::from(vec![7u8; 150_000]);
        let pieces: Vec<Bytes> = progress_stream(data, Some(acc.chunk()))
            .map(|piece| piece.unwrap())
            .collect()
            .await;

        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces.iter().map(Bytes::len).sum::<usize>(), 150_000);
        assert_eq!(acc.total(), 150_000);
    }
}
