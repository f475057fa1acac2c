//! Resilient range reader.
//!
//! [`ResilientReader`] presents a remote byte range as one uninterrupted
//! [`AsyncRead`] stream. When the underlying body breaks with a transient
//! error it is dropped, and a new ranged request is issued for exactly the
//! bytes not yet handed to the caller.

use futures_util::future::BoxFuture;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use crate::error::{is_transient_io, TransferError};
use crate::retry::BodyStream;
use crate::transport::RangeResponse;
use crate::types::{ByteRange, ETag};

/// Parameters for (re-)opening a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetInfo {
    /// First byte not yet consumed.
    pub offset: u64,
    /// Bytes left to read; `None` reads to the end of the object.
    pub count: Option<u64>,
    /// Version the stream is pinned to.
    pub etag: Option<ETag>,
}

impl GetInfo {
    pub fn new(offset: u64, count: Option<u64>, etag: Option<ETag>) -> Self {
        Self {
            offset,
            count,
            etag,
        }
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.count)
    }
}

/// Issues one ranged GET for the given parameters.
pub type Getter =
    Arc<dyn Fn(GetInfo) -> BoxFuture<'static, Result<RangeResponse, TransferError>> + Send + Sync>;

/// Options controlling how broken streams are healed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Extra requests allowed over the reader's lifetime. 0 disables healing.
    pub max_retry_requests: u32,
}

enum State {
    /// No open body; the next read opens one.
    Idle,
    Opening(BoxFuture<'static, Result<RangeResponse, TransferError>>),
    Reading(BodyStream),
    Closed,
}

/// Readable stream over a remote range that survives transient breaks.
///
/// The total number of requests made over the reader's lifetime is at most
/// `max_retry_requests + 1`. Only failures while reading an already open body
/// are healed; a failing getter is reported to the caller as-is.
pub struct ResilientReader {
    state: State,
    info: GetInfo,
    getter: Getter,
    options: ReaderOptions,
    tries_used: u32,
    opened: bool,
}

impl ResilientReader {
    /// Creates a reader from an already opened response, or `None` to open lazily.
    ///
    /// When `info.etag` is unset the first response's ETag is captured.
    pub fn new(
        initial: Option<RangeResponse>,
        info: GetInfo,
        getter: Getter,
        options: ReaderOptions,
    ) -> Self {
        let mut reader = Self {
            state: State::Idle,
            info,
            getter,
            options,
            tries_used: 0,
            opened: false,
        };
        if let Some(response) = initial {
            reader.capture_etag(&response);
            reader.opened = true;
            reader.state = State::Reading(response.body);
        }
        reader
    }

    pub fn offset(&self) -> u64 {
        self.info.offset
    }

    /// Bytes left in a bounded range, `None` when reading to the end.
    pub fn remaining(&self) -> Option<u64> {
        self.info.count
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.info.etag.as_ref()
    }

    /// Number of times a broken stream has been re-opened.
    pub fn tries_used(&self) -> u32 {
        self.tries_used
    }

    /// Closes the current body, if any. Idempotent.
    pub fn close(&mut self) -> Result<(), TransferError> {
        self.state = State::Closed;
        Ok(())
    }

    fn capture_etag(&mut self, response: &RangeResponse) {
        if self.info.etag.is_none() {
            self.info.etag = response.etag().cloned();
        }
    }

    /// Validates a freshly opened response against the pinned ETag.
    fn accept(&mut self, response: &RangeResponse) -> Result<(), TransferError> {
        if let (Some(expected), Some(actual)) = (&self.info.etag, response.etag()) {
            if expected != actual {
                return Err(TransferError::SourceChanged {
                    expected: expected.clone(),
                    actual: Some(actual.clone()),
                });
            }
        }
        if !self.opened {
            self.capture_etag(response);
            self.opened = true;
        }
        Ok(())
    }
}

impl fmt::Debug for ResilientReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientReader")
            .field("offset", &self.info.offset)
            .field("count", &self.info.count)
            .field("etag", &self.info.etag)
            .field("tries_used", &self.tries_used)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for ResilientReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.info.count == Some(0) {
                return Poll::Ready(Ok(()));
            }

            match &mut this.state {
                State::Closed => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "read from a closed range reader",
                    )));
                }
                State::Idle => {
                    debug!(
                        offset = this.info.offset,
                        count = ?this.info.count,
                        "Opening range stream"
                    );
                    this.state = State::Opening((this.getter)(this.info.clone()));
                }
                State::Opening(pending) => {
                    let opened = ready!(pending.as_mut().poll(cx));
                    this.state = State::Idle;
                    let response = match opened {
                        Ok(response) => response,
                        Err(e) => return Poll::Ready(Err(e.into_io())),
                    };
                    if let Err(e) = this.accept(&response) {
                        return Poll::Ready(Err(e.into_io()));
                    }
                    this.state = State::Reading(response.body);
                }
                State::Reading(body) => {
                    let before = buf.filled().len();
                    match ready!(body.as_mut().poll_read(cx, buf)) {
                        Ok(()) => {
                            let n = (buf.filled().len() - before) as u64;
                            this.info.offset += n;
                            if let Some(count) = this.info.count.as_mut() {
                                *count = count.saturating_sub(n);
                            }
                            return Poll::Ready(Ok(()));
                        }
                        Err(e) => {
                            // The stream is no longer usable.
                            this.state = State::Idle;

                            if this.tries_used >= this.options.max_retry_requests {
                                return Poll::Ready(Err(e));
                            }
                            if !is_transient_io(&e) {
                                return Poll::Ready(Err(e));
                            }
                            this.tries_used += 1;
                            warn!(
                                "Range stream broke at offset {} ({}/{}), resuming: {}",
                                this.info.offset,
                                this.tries_used,
                                this.options.max_retry_requests,
                                e
                            );
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    /// Serves `data` and fails with `kind` once `fail_at` bytes were read.
    struct BreakingBody {
        data: Vec<u8>,
        pos: usize,
        fail_at: Option<usize>,
        kind: io::ErrorKind,
    }

    impl AsyncRead for BreakingBody {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if Some(self.pos) == self.fail_at {
                return Poll::Ready(Err(io::Error::from(self.kind)));
            }
            let end = self.fail_at.unwrap_or(self.data.len()).min(self.data.len());
            let n = (end - self.pos).min(buf.remaining()).min(64);
            let pos = self.pos;
            buf.put_slice(&self.data[pos..pos + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    fn object(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn response(data: Vec<u8>, fail_at: Option<usize>, kind: io::ErrorKind, etag: &str) -> RangeResponse {
        let len = data.len() as u64;
        RangeResponse::new(Box::pin(BreakingBody {
            data,
            pos: 0,
            fail_at,
            kind,
        }))
        .with_content_length(len)
        .with_etag(ETag::new(etag))
    }

    /// Getter serving `source` from the requested offset, breaking the first `breaks` bodies.
    fn getter(
        source: Vec<u8>,
        breaks: usize,
        etag: &'static str,
        calls: Arc<Mutex<Vec<GetInfo>>>,
    ) -> Getter {
        let served = Arc::new(AtomicUsize::new(0));
        Arc::new(move |info: GetInfo| {
            calls.lock().unwrap().push(info.clone());
            let start = info.offset as usize;
            let end = info
                .count
                .map(|c| start + c as usize)
                .unwrap_or(source.len());
            let data = source[start..end].to_vec();
            let fail_at = if served.fetch_add(1, Ordering::SeqCst) < breaks {
                Some(0)
            } else {
                None
            };
            let response = response(data, fail_at, io::ErrorKind::ConnectionReset, etag);
            Box::pin(async move { Ok(response) })
        })
    }

    #[tokio::test]
    async fn resumes_from_last_consumed_byte() {
        let source = object(1000);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let initial = response(source.clone(), Some(300), io::ErrorKind::ConnectionReset, "\"v1\"");

        let mut reader = ResilientReader::new(
            Some(initial),
            GetInfo::new(0, Some(1000), None),
            getter(source.clone(), 0, "\"v1\"", calls.clone()),
            ReaderOptions {
                max_retry_requests: 2,
            },
        );

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, source);
        assert_eq!(reader.tries_used(), 1);
        assert_eq!(reader.offset(), 1000);
        assert_eq!(reader.remaining(), Some(0));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].offset, 300);
        assert_eq!(calls[0].count, Some(700));
        assert_eq!(calls[0].etag, Some(ETag::new("\"v1\"")));
    }

    #[tokio::test]
    async fn unbounded_reader_resumes_to_end() {
        let source = object(500);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let initial = response(source.clone(), Some(128), io::ErrorKind::TimedOut, "\"v1\"");

        let mut reader = ResilientReader::new(
            Some(initial),
            GetInfo::new(0, None, None),
            getter(source.clone(), 0, "\"v1\"", calls.clone()),
            ReaderOptions {
                max_retry_requests: 1,
            },
        );

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, source);
        assert_eq!(calls.lock().unwrap()[0].count, None);
        assert_eq!(calls.lock().unwrap()[0].offset, 128);
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let source = object(100);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let mut reader = ResilientReader::new(
            None,
            GetInfo::new(0, Some(100), None),
            getter(source, usize::MAX, "\"v1\"", calls.clone()),
            ReaderOptions {
                max_retry_requests: 3,
            },
        );

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert_eq!(reader.tries_used(), 3);
    }

    #[tokio::test]
    async fn etag_change_is_fatal() {
        let source = object(200);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let initial = response(source.clone(), Some(50), io::ErrorKind::ConnectionReset, "\"v1\"");

        let mut reader = ResilientReader::new(
            Some(initial),
            GetInfo::new(0, Some(200), None),
            getter(source, 0, "\"v2\"", calls.clone()),
            ReaderOptions {
                max_retry_requests: 5,
            },
        );

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();

        assert!(matches!(
            TransferError::from_io(err),
            TransferError::SourceChanged { .. }
        ));
        assert_eq!(out.len(), 50);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_transient_error_is_not_retried() {
        let source = object(100);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let initial = response(source.clone(), Some(10), io::ErrorKind::PermissionDenied, "\"v1\"");

        let mut reader = ResilientReader::new(
            Some(initial),
            GetInfo::new(0, Some(100), None),
            getter(source, 0, "\"v1\"", calls.clone()),
            ReaderOptions {
                max_retry_requests: 5,
            },
        );

        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(reader.tries_used(), 0);
    }

    #[tokio::test]
    async fn getter_failure_is_returned_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let failing: Getter = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(TransferError::temporary("connection refused")) })
        });

        let mut reader = ResilientReader::new(
            None,
            GetInfo::new(0, Some(10), None),
            failing,
            ReaderOptions {
                max_retry_requests: 5,
            },
        );

        let mut buf = [0u8; 10];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            TransferError::from_io(err),
            TransferError::Transport { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_range_reads_eof_without_request() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut reader = ResilientReader::new(
            None,
            GetInfo::new(40, Some(0), None),
            getter(object(64), 0, "\"v1\"", calls.clone()),
            ReaderOptions::default(),
        );

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let source = object(10);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut reader = ResilientReader::new(
            Some(response(source.clone(), None, io::ErrorKind::Other, "\"v1\"")),
            GetInfo::new(0, Some(10), None),
            getter(source, 0, "\"v1\"", calls),
            ReaderOptions::default(),
        );

        assert!(reader.close().is_ok());
        assert!(reader.close().is_ok());
        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn debug_shows_position() {
        let source = object(10);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let reader = ResilientReader::new(
            Some(response(source.clone(), None, io::ErrorKind::Other, "\"v1\"")),
            GetInfo::new(4, Some(6), None),
            getter(source, 0, "\"v1\"", calls),
            ReaderOptions::default(),
        );

        let shown = format!("{:?}", reader);
        assert!(shown.contains("offset: 4"), "{shown}");
        assert!(shown.contains("tries_used: 0"), "{shown}");
        assert!(shown.contains("v1"), "{shown}");
    }
}
