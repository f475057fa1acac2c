//! Rangesync - resilient, parallel ranged transfers for HTTP file storage
//!
//! This library moves large objects to and from a storage service that
//! supports ranged reads and writes, splitting them into chunks that are
//! transferred concurrently and retried independently.
//!
//! # Features
//!
//! - **Parallel Chunks**: A fixed worker pool transfers ranges concurrently
//! - **Retry Policy**: Jittered fixed or exponential backoff with per-try timeouts
//! - **Resumable Reads**: Broken download bodies resume from the last byte read
//! - **Consistent Reads**: Downloads are pinned to the object's ETag
//! - **Bounded Memory**: Large files are paged in segment by segment
//! - **Progress Tracking**: Monotonic byte totals aggregated across chunks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rangesync::{download_to_file, HttpTransport, OpContext, RetryOptions, RetryPolicy, TransferOptions};
//!
//! # async fn example() -> Result<(), rangesync::TransferError> {
//! let retry = RetryPolicy::new(RetryOptions::default())?;
//! let transport = Arc::new(HttpTransport::new("https://example.com/share/object.bin", retry));
//!
//! let report = download_to_file(
//!     &OpContext::new(),
//!     transport,
//!     "object.bin",
//!     &TransferOptions::default(),
//! )
//! .await?;
//! println!("downloaded {} bytes", report.bytes);
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod progress;
pub mod reader;
pub mod retry;
pub mod segmented;
pub mod transfer;
pub mod transport;
pub mod types;

pub use batch::{chunk_count, chunk_jobs, run_batch, ChunkContext, ChunkOperation, TransferSpec};
pub use config::{RetryConfig, TransferConfig};
pub use context::{OpContext, TryContext, TryScope};
pub use error::{TransferError, TransportErrorKind};
pub use progress::{ChunkProgress, ProgressAccumulator, ProgressReader};
pub use reader::{GetInfo, Getter, ReaderOptions, ResilientReader};
pub use retry::{BodyStream, RequestBody, RetryOptions, RetryPolicy, RetryPolicyKind};
pub use segmented::{
    run_segmented, FileSegmentSource, SegmentSource, SegmentStats, SegmentedSpec,
    DEFAULT_SEGMENT_SIZE,
};
pub use transfer::{
    download_to_file, download_to_file_with_properties, download_to_vec, open_reader,
    upload_buffer, upload_file,
};
pub use transport::{range_getter, HttpTransport, ObjectProperties, RangeResponse, RangeTransport};
pub use types::{
    ByteRange, ChunkJob, ETag, ProgressFn, TransferOptions, TransferReport, DEFAULT_PARALLELISM,
    MAX_OBJECT_SIZE, MAX_UPLOAD_RANGE_BYTES,
};
