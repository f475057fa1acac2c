//! Data structures shared by the transfer components.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Largest range a single upload request may carry (4 MiB).
pub const MAX_UPLOAD_RANGE_BYTES: u64 = 4 * 1024 * 1024;

/// Largest object size accepted for uploads (1 TiB).
pub const MAX_OBJECT_SIZE: u64 = 1024 * 1024 * 1024 * 1024;

/// Number of chunk workers used when the caller does not choose one.
pub const DEFAULT_PARALLELISM: usize = 5;

/// Callback receiving the cumulative number of bytes transferred by a batch.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Opaque version token of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(String);

impl ETag {
    pub fn new(value: impl Into<String>) -> Self {
        ETag(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A byte range of a remote object.
///
/// `count == None` means "from `offset` to the end of the object".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub count: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }

    /// Value for an HTTP `Range` header, e.g. `bytes=0-1023` or `bytes=512-`.
    pub fn to_header(&self) -> String {
        match self.count {
            Some(count) if count > 0 => {
                format!("bytes={}-{}", self.offset, self.offset + count - 1)
            }
            _ => format!("bytes={}-", self.offset),
        }
    }
}

/// One unit of parallel work: `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkJob {
    pub offset: u64,
    pub length: u64,
}

/// Options for whole-object uploads and downloads.
///
/// # Example
///
/// ```
/// use rangesync::TransferOptions;
///
/// let options = TransferOptions {
///     range_size: 1024 * 1024,
///     parallelism: 8, // Use 8 parallel workers
///     ..TransferOptions::default()
/// };
/// ```
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Size of each ranged request in bytes (0 = [`MAX_UPLOAD_RANGE_BYTES`]).
    pub range_size: u64,
    /// Maximum number of ranges in flight (0 = [`DEFAULT_PARALLELISM`]).
    ///
    /// Transfers are I/O-bound, so this is limited by network bandwidth
    /// rather than by CPU cores.
    pub parallelism: usize,
    /// Extra GET requests each download range may issue to heal a broken stream.
    pub max_retry_requests_per_range: u32,
    /// Size of the windows a large source is paged in by (0 = 256 MiB).
    pub segment_size: u64,
    /// Receives the cumulative byte count as the transfer progresses.
    pub progress: Option<ProgressFn>,
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("range_size", &self.range_size)
            .field("parallelism", &self.parallelism)
            .field(
                "max_retry_requests_per_range",
                &self.max_retry_requests_per_range,
            )
            .field("segment_size", &self.segment_size)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Summary of a finished transfer, printed by the CLI.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    pub chunks: u64,
    pub elapsed_ms: u64,
    pub etag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_formats() {
        assert_eq!(ByteRange::new(0, Some(1024)).to_header(), "bytes=0-1023");
        assert_eq!(ByteRange::new(512, None).to_header(), "bytes=512-");
        assert_eq!(ByteRange::new(7, Some(1)).to_header(), "bytes=7-7");
    }
}
