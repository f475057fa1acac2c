//! Transport-level retry policy.
//!
//! Every logical request is executed as up to `max_tries` attempts. Before
//! each attempt the policy sleeps for a jittered backoff, rewinds the request
//! body and derives a per-try timeout that never outlives the caller's
//! deadline. Only errors that report themselves as temporary or timed out are
//! retried.

use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

use crate::context::{OpContext, TryContext, TryScope};
use crate::error::TransferError;

/// Backoff strategy between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyKind {
    /// `(2^(try-1) - 1) * retry_delay`.
    #[default]
    Exponential,
    /// No delay before the first try, `retry_delay` before every later one.
    Fixed,
}

/// Configures the retry policy's behavior.
///
/// Zero-valued fields mean "use the default" (see [`RetryOptions::with_defaults`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryOptions {
    pub policy: RetryPolicyKind,
    /// Maximum number of attempts, including the first one. 1 means no retries.
    pub max_tries: u32,
    /// Upper bound for any single attempt. When moving large payloads this
    /// should grow with the expected payload size.
    pub try_timeout: Duration,
    /// Base delay between attempts. Must be zero exactly when `max_retry_delay` is.
    pub retry_delay: Duration,
    /// Cap for the computed delay.
    pub max_retry_delay: Duration,
}

impl RetryOptions {
    /// Validates the options and fills in defaults for zero-valued fields.
    pub fn with_defaults(mut self) -> Result<Self, TransferError> {
        if self.retry_delay > self.max_retry_delay {
            return Err(TransferError::InvalidConfig(
                "retry_delay must be <= max_retry_delay".to_string(),
            ));
        }
        if self.retry_delay.is_zero() != self.max_retry_delay.is_zero() {
            return Err(TransferError::InvalidConfig(
                "retry_delay and max_retry_delay must both be zero or both be non-zero"
                    .to_string(),
            ));
        }

        if self.max_tries == 0 {
            self.max_tries = 4;
        }
        if self.try_timeout.is_zero() {
            self.try_timeout = Duration::from_secs(60);
        }
        if self.retry_delay.is_zero() {
            self.retry_delay = match self.policy {
                RetryPolicyKind::Exponential => Duration::from_secs(4),
                RetryPolicyKind::Fixed => Duration::from_secs(30),
            };
            self.max_retry_delay = Duration::from_secs(120);
        }
        Ok(self)
    }

    /// Delay before the given 1-based try, before jitter and clamping.
    pub(crate) fn base_delay(&self, try_number: u32) -> Duration {
        match self.policy {
            RetryPolicyKind::Exponential => {
                let factor = 2u64.saturating_pow(try_number.saturating_sub(1)) - 1;
                self.retry_delay
                    .saturating_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            }
            RetryPolicyKind::Fixed if try_number > 1 => self.retry_delay,
            RetryPolicyKind::Fixed => Duration::ZERO,
        }
    }

    /// Applies a jitter factor and clamps to `max_retry_delay`.
    pub(crate) fn jittered(&self, base: Duration, factor: f64) -> Duration {
        let delay = Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX);
        delay.min(self.max_retry_delay)
    }

    /// Delay to sleep before the given 1-based try.
    ///
    /// The base delay is scaled by a uniform random factor in `[0.8, 1.3)`.
    pub fn calc_delay(&self, try_number: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(0.8..1.3);
        self.jittered(self.base_delay(try_number), factor)
    }
}

/// Async readable body stream.
pub type BodyStream = Pin<Box<dyn AsyncRead + Send>>;

/// Request payload that the policy rewinds before every try.
pub enum RequestBody {
    Empty,
    /// In-memory payload; every try gets a cheap clone from the start.
    Bytes(Bytes),
    /// A one-shot stream. It can serve a single try only.
    Stream(Option<BodyStream>),
}

impl RequestBody {
    pub fn stream(stream: BodyStream) -> Self {
        RequestBody::Stream(Some(stream))
    }

    /// Produces the body for the next try, positioned at its start.
    ///
    /// Fails with a non-retryable error when a stream body was already consumed.
    pub fn rewind(&mut self) -> Result<RequestBody, TransferError> {
        match self {
            RequestBody::Empty => Ok(RequestBody::Empty),
            RequestBody::Bytes(data) => Ok(RequestBody::Bytes(data.clone())),
            RequestBody::Stream(stream) => stream.take().map(RequestBody::stream).ok_or_else(|| {
                TransferError::InvalidConfig(
                    "request body is not seekable and cannot be rewound for another try"
                        .to_string(),
                )
            }),
        }
    }

    /// Payload length when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(data) => Some(data.len() as u64),
            RequestBody::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(data) => write!(f, "Bytes({} bytes)", data.len()),
            RequestBody::Stream(stream) => write!(f, "Stream(consumed: {})", stream.is_none()),
        }
    }
}

/// Stateless retry decorator; safe to share across concurrent requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Result<Self, TransferError> {
        Ok(Self {
            options: options.with_defaults()?,
        })
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Time budget for the next try: `min(try_timeout, time until the context's deadline)`.
    pub fn try_timeout_for(&self, ctx: &OpContext) -> Duration {
        match ctx.remaining() {
            Some(remaining) => self.options.try_timeout.min(remaining),
            None => self.options.try_timeout,
        }
    }

    /// Runs `attempt` until it succeeds, fails permanently or tries run out.
    pub async fn execute<T, F, Fut>(&self, ctx: &OpContext, mut attempt: F) -> Result<T, TransferError>
    where
        F: FnMut(TryContext) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        self.execute_with_body(ctx, RequestBody::Empty, |try_ctx, _| attempt(try_ctx))
            .await
    }

    /// Like [`RetryPolicy::execute`], handing each try a freshly rewound copy of `body`.
    pub async fn execute_with_body<T, F, Fut>(
        &self,
        ctx: &OpContext,
        mut body: RequestBody,
        mut attempt: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut(TryContext, RequestBody) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let mut last_error = None;

        for try_number in 1..=self.options.max_tries {
            let delay = self.options.calc_delay(try_number);
            debug!(try_number, ?delay, "Starting try");
            if !delay.is_zero() {
                tokio::select! {
                    _ = ctx.done() => {
                        return Err(last_error.unwrap_or(TransferError::Cancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let try_body = body.rewind()?;

            let timeout = self.try_timeout_for(ctx);
            debug!(try_number, ?timeout, "Per-try timeout");
            let scope = TryScope::start(ctx, timeout);
            let expired = scope.expired();

            let result = tokio::select! {
                result = attempt(TryContext::new(try_number, timeout, scope), try_body) => result,
                _ = expired => Err(TransferError::Timeout),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if ctx.is_done() => {
                    debug!(try_number, "No retry: operation context is done");
                    return Err(e);
                }
                Err(e) if e.is_transient() && try_number < self.options.max_tries => {
                    warn!(
                        "Try {}/{} failed with a transient error, retrying: {}",
                        try_number, self.options.max_tries, e
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    debug!(try_number, "No retry: {}", e);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or(TransferError::Cancelled))
    }
}
