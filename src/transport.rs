//! Ranged request transport.
//!
//! The transfer engine only needs three things from a storage service: object
//! properties, a ranged GET and a ranged PUT. [`RangeTransport`] captures that
//! contract; [`HttpTransport`] implements it with `reqwest`, running every
//! request through the [`RetryPolicy`].

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::TryStreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_MATCH, RANGE};
use reqwest::StatusCode;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::context::{OpContext, TryScope};
use crate::error::TransferError;
use crate::progress::{progress_stream, ChunkProgress};
use crate::reader::{GetInfo, Getter};
use crate::retry::{BodyStream, RequestBody, RetryPolicy};
use crate::types::{ByteRange, ETag};

/// Size and version of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectProperties {
    pub content_length: u64,
    pub etag: Option<ETag>,
}

/// Successful response to a ranged GET: metadata plus a single-use body.
pub struct RangeResponse {
    pub content_length: Option<u64>,
    pub etag: Option<ETag>,
    pub body: BodyStream,
}

impl RangeResponse {
    pub fn new(body: BodyStream) -> Self {
        Self {
            content_length: None,
            etag: None,
            body,
        }
    }

    /// Response whose body is an in-memory buffer.
    pub fn from_bytes(data: Bytes) -> Self {
        let len = data.len() as u64;
        Self::new(Box::pin(io::Cursor::new(data))).with_content_length(len)
    }

    pub fn with_etag(mut self, etag: ETag) -> Self {
        self.etag = Some(etag);
        self
    }

    pub fn with_content_length(mut self, content_length: u64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.etag.as_ref()
    }
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("content_length", &self.content_length)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

/// Minimal ranged-request contract of a storage service.
#[async_trait]
pub trait RangeTransport: Send + Sync {
    /// Fetches the object's size and ETag.
    async fn properties(&self, ctx: &OpContext) -> Result<ObjectProperties, TransferError>;

    /// Opens `range`, optionally requiring the object to still match `etag`.
    async fn get_range(
        &self,
        ctx: &OpContext,
        range: ByteRange,
        etag: Option<&ETag>,
    ) -> Result<RangeResponse, TransferError>;

    /// Writes `data` at `offset`, reporting bytes sent to `progress`.
    async fn put_range(
        &self,
        ctx: &OpContext,
        offset: u64,
        data: Bytes,
        progress: Option<ChunkProgress>,
    ) -> Result<(), TransferError>;

    /// Called once before an upload writes any range.
    async fn prepare_upload(&self, _ctx: &OpContext, _size: u64) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Builds a [`Getter`] that re-opens ranges through `transport` under `ctx`.
pub fn range_getter(transport: Arc<dyn RangeTransport>, ctx: OpContext) -> Getter {
    Arc::new(move |info: GetInfo| {
        let transport = Arc::clone(&transport);
        let ctx = ctx.clone();
        Box::pin(async move {
            transport
                .get_range(&ctx, info.range(), info.etag.as_ref())
                .await
        }) as BoxFuture<'static, _>
    })
}

/// Body reader that keeps its request's [`TryScope`] alive and fails with
/// `TimedOut` once the scope expires.
pub struct ScopedBody<R> {
    inner: R,
    expired: BoxFuture<'static, ()>,
    _scope: TryScope,
}

impl<R> ScopedBody<R> {
    pub fn new(inner: R, scope: TryScope) -> Self {
        Self {
            inner,
            expired: scope.expired(),
            _scope: scope,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ScopedBody<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.expired.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(TransferError::Timeout.into_io()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Maps a mid-stream body failure to an I/O error the range reader can classify.
fn body_error(err: reqwest::Error) -> io::Error {
    let kind = if err.is_timeout() {
        io::ErrorKind::TimedOut
    } else {
        io::ErrorKind::ConnectionAborted
    };
    io::Error::new(kind, err)
}

fn header_etag(headers: &HeaderMap) -> Option<ETag> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ETag::new)
}

fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Rejects non-success responses. A failed `If-Match` means the object changed.
fn check_status(status: StatusCode, etag: Option<&ETag>) -> Result<(), TransferError> {
    if status.is_success() {
        return Ok(());
    }
    match (status, etag) {
        (StatusCode::PRECONDITION_FAILED, Some(expected)) => Err(TransferError::SourceChanged {
            expected: expected.clone(),
            actual: None,
        }),
        _ => Err(TransferError::Status {
            code: status.as_u16(),
        }),
    }
}

/// `Content-Range` value for writing `len` bytes at `offset`.
fn content_range(offset: u64, len: u64) -> String {
    format!("bytes {}-{}/*", offset, offset + len - 1)
}

/// `reqwest`-backed transport for a single object URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self::with_client(reqwest::Client::new(), url, retry)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            url: url.into(),
            retry,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RangeTransport for HttpTransport {
    async fn properties(&self, ctx: &OpContext) -> Result<ObjectProperties, TransferError> {
        info!("Retrieving properties of {}", self.url);
        self.retry
            .execute(ctx, |try_ctx| {
                let request = self.client.head(&self.url);
                async move {
                    let _scope = try_ctx;
                    let response = request.send().await?;
                    check_status(response.status(), None)?;
                    let content_length =
                        header_content_length(response.headers()).ok_or_else(|| {
                            TransferError::fatal("response carries no Content-Length header")
                        })?;
                    Ok(ObjectProperties {
                        content_length,
                        etag: header_etag(response.headers()),
                    })
                }
            })
            .await
    }

    async fn get_range(
        &self,
        ctx: &OpContext,
        range: ByteRange,
        etag: Option<&ETag>,
    ) -> Result<RangeResponse, TransferError> {
        debug!(url = %self.url, range = %range.to_header(), "GET range");
        self.retry
            .execute(ctx, |try_ctx| {
                let mut request = self.client.get(&self.url).header(RANGE, range.to_header());
                if let Some(etag) = etag {
                    request = request.header(IF_MATCH, etag.as_str());
                }
                async move {
                    let response = request.send().await?;
                    check_status(response.status(), etag)?;

                    let content_length = response.content_length();
                    let response_etag = header_etag(response.headers());
                    let stream = Box::pin(response.bytes_stream().map_err(body_error));
                    let body = ScopedBody::new(StreamReader::new(stream), try_ctx.into_scope());

                    let mut ranged = RangeResponse::new(Box::pin(body));
                    ranged.content_length = content_length;
                    ranged.etag = response_etag;
                    Ok(ranged)
                }
            })
            .await
    }

    async fn put_range(
        &self,
        ctx: &OpContext,
        offset: u64,
        data: Bytes,
        progress: Option<ChunkProgress>,
    ) -> Result<(), TransferError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        debug!(url = %self.url, offset, len, "PUT range");

        self.retry
            .execute_with_body(ctx, RequestBody::Bytes(data), |try_ctx, body| {
                let request = match body {
                    RequestBody::Bytes(data) => Ok(self
                        .client
                        .put(&self.url)
                        .header(CONTENT_RANGE, content_range(offset, len))
                        .header(CONTENT_LENGTH, len)
                        .body(reqwest::Body::wrap_stream(progress_stream(
                            data,
                            progress.clone(),
                        )))),
                    other => Err(TransferError::InvalidConfig(format!(
                        "unexpected upload body {other:?}"
                    ))),
                };
                async move {
                    let _scope = try_ctx;
                    let response = request?.send().await?;
                    check_status(response.status(), None)
                }
            })
            .await
    }
}
