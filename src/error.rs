//! Error types for transfer operations.

use std::io;
use thiserror::Error;

use crate::types::ETag;

/// How a transport failure classifies itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The failure is expected to go away on its own (dropped connection, reset, DNS hiccup).
    Temporary,
    /// Retrying will not help.
    Fatal,
}

/// Errors that can occur during transfer operations.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Invalid options or an operation that cannot be repeated safely.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A single try ran out of time.
    #[error("Operation timed out")]
    Timeout,

    /// Network-level failure reported by a transport.
    #[error("Transport error: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    /// The service answered with a failure status.
    #[error("Request failed with HTTP {code}")]
    Status { code: u16 },

    /// The object was modified between two ranged reads.
    #[error("Source changed during read: expected ETag {expected}, got {}", .actual.as_ref().map(ETag::as_str).unwrap_or("<none>"))]
    SourceChanged {
        expected: ETag,
        actual: Option<ETag>,
    },

    /// The operation's context was cancelled or its deadline passed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A chunk task died without reporting a result.
    #[error("Transfer task failed: {0}")]
    TaskFailed(String),

    /// I/O error during stream or file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP client error.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl TransferError {
    /// Builds a temporary transport error.
    pub fn temporary(message: impl Into<String>) -> Self {
        TransferError::Transport {
            kind: TransportErrorKind::Temporary,
            message: message.into(),
        }
    }

    /// Builds a fatal transport error.
    pub fn fatal(message: impl Into<String>) -> Self {
        TransferError::Transport {
            kind: TransportErrorKind::Fatal,
            message: message.into(),
        }
    }

    /// Returns true when the failure reports itself as temporary or timed out.
    ///
    /// Only these errors are worth another attempt; everything else,
    /// including HTTP status failures and ETag mismatches, is surfaced as-is.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Timeout => true,
            TransferError::Transport { kind, .. } => *kind == TransportErrorKind::Temporary,
            TransferError::IoError(e) => is_transient_io(e),
            TransferError::ReqwestError(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            _ => false,
        }
    }

    /// Recovers a crate error from an `io::Error` produced by one of the stream adapters.
    pub fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<TransferError>())
        {
            match err.into_inner().map(|inner| inner.downcast::<TransferError>()) {
                Some(Ok(inner)) => *inner,
                Some(Err(other)) => TransferError::IoError(io::Error::other(other)),
                None => TransferError::TaskFailed("empty I/O error".to_string()),
            }
        } else {
            TransferError::IoError(err)
        }
    }

    /// Converts into an `io::Error` so the error can travel through `AsyncRead`.
    pub fn into_io(self) -> io::Error {
        match self {
            TransferError::IoError(e) => e,
            TransferError::Timeout => io::Error::new(io::ErrorKind::TimedOut, TransferError::Timeout),
            other => io::Error::other(other),
        }
    }
}

/// Transient classification for raw I/O errors surfaced by body streams.
pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<TransferError>()) {
        return inner.is_transient();
    }
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof
    )
}
