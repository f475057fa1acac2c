//! Segmented transfers for sources too large to hold in memory.
//!
//! The source is paged in one segment at a time. Each segment is split into
//! the same chunks [`run_batch`](crate::batch::run_batch) would use, and it is
//! evicted from the segment map as soon as its last chunk completes, so the
//! number of resident segments stays bounded by the worker pool rather than
//! by the size of the source.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

use crate::batch::{
    chunk_count, chunk_jobs, effective_parallelism, run_chunk, spawn_workers,
    validate_chunk_size, ChunkContext, ChunkFuture,
};
use crate::context::OpContext;
use crate::error::TransferError;
use crate::progress::ProgressAccumulator;
use crate::types::{ChunkJob, ProgressFn};

/// Segment size used when none is configured (256 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 256 * 1024 * 1024;

/// A source that can be paged into memory by byte range.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Total size of the source in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loads `[offset, offset + len)` into memory.
    async fn map(&self, offset: u64, len: u64) -> Result<Bytes, TransferError>;
}

#[async_trait]
impl SegmentSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    async fn map(&self, offset: u64, len: u64) -> Result<Bytes, TransferError> {
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= SegmentSource::len(self))
            .ok_or_else(|| {
                TransferError::InvalidConfig(format!(
                    "segment {}+{} is outside the source",
                    offset, len
                ))
            })?;
        Ok(self.slice(offset as usize..end as usize))
    }
}

/// File-backed source that reads each segment on demand.
#[derive(Debug, Clone)]
pub struct FileSegmentSource {
    path: PathBuf,
    len: u64,
}

impl FileSegmentSource {
    /// Opens `path` and records its current size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SegmentSource for FileSegmentSource {
    fn len(&self) -> u64 {
        self.len
    }

    async fn map(&self, offset: u64, len: u64) -> Result<Bytes, TransferError> {
        let size = usize::try_from(len).map_err(|_| {
            TransferError::InvalidConfig(format!("segment of {} bytes is too large", len))
        })?;
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// Per-chunk operation receiving the chunk's slice of its mapped segment.
pub type SegmentOperation =
    Arc<dyn Fn(ChunkJob, Bytes, ChunkContext) -> ChunkFuture + Send + Sync>;

/// Description of one segmented transfer.
#[derive(Clone)]
pub struct SegmentedSpec {
    pub chunk_size: u64,
    /// Window size; 0 means [`DEFAULT_SEGMENT_SIZE`].
    pub segment_size: u64,
    pub parallelism: usize,
    pub operation: SegmentOperation,
    pub on_progress: Option<ProgressFn>,
}

impl SegmentedSpec {
    pub fn new<F, Fut>(chunk_size: u64, operation: F) -> Self
    where
        F: Fn(ChunkJob, Bytes, ChunkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        Self {
            chunk_size,
            segment_size: 0,
            parallelism: 0,
            operation: Arc::new(
                move |job: ChunkJob, data: Bytes, ctx: ChunkContext| -> ChunkFuture {
                    Box::pin(operation(job, data, ctx))
                },
            ),
            on_progress: None,
        }
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }
}

/// Rounds the configured segment size up to a whole number of chunks.
pub fn effective_segment_size(segment_size: u64, chunk_size: u64) -> u64 {
    let segment_size = if segment_size == 0 {
        DEFAULT_SEGMENT_SIZE
    } else {
        segment_size
    };
    segment_size.div_ceil(chunk_size) * chunk_size
}

/// Bookkeeping reported after a segmented transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub segments_mapped: u64,
    /// Largest number of segments held in the map at once.
    pub peak_resident: usize,
    pub resident_at_end: usize,
}

struct SegmentEntry {
    region: Bytes,
    finished: u64,
    total: u64,
}

#[derive(Default)]
struct SegmentMap {
    entries: HashMap<u64, SegmentEntry>,
    mapped: u64,
    peak: usize,
}

impl SegmentMap {
    fn insert(&mut self, segment_id: u64, entry: SegmentEntry) {
        self.entries.insert(segment_id, entry);
        self.mapped += 1;
        self.peak = self.peak.max(self.entries.len());
    }

    /// Records one finished chunk; evicts the segment once all of them are done.
    fn finish_chunk(&mut self, segment_id: u64) {
        let Some(entry) = self.entries.get_mut(&segment_id) else {
            return;
        };
        entry.finished += 1;
        if entry.finished == entry.total {
            if let Some(evicted) = self.entries.remove(&segment_id) {
                trace!(segment_id, bytes = evicted.region.len(), "Segment evicted");
            }
        }
    }

    fn stats(&self) -> SegmentStats {
        SegmentStats {
            segments_mapped: self.mapped,
            peak_resident: self.peak,
            resident_at_end: self.entries.len(),
        }
    }
}

type SharedSegmentMap = Arc<Mutex<SegmentMap>>;

fn lock(map: &SharedSegmentMap) -> std::sync::MutexGuard<'_, SegmentMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SegmentJob {
    segment_id: u64,
    job: ChunkJob,
    data: Bytes,
}

struct SegmentResult {
    /// `None` when mapping a segment failed.
    segment_id: Option<u64>,
    result: Result<(), TransferError>,
}

/// Maps segments one at a time and enqueues their chunk jobs.
async fn produce_segments(
    ctx: OpContext,
    source: Arc<dyn SegmentSource>,
    chunk_size: u64,
    segment_size: u64,
    segments: SharedSegmentMap,
    jobs: mpsc::Sender<SegmentJob>,
    results: mpsc::Sender<SegmentResult>,
) {
    let total = source.len();
    for (segment_id, segment) in chunk_jobs(total, segment_size).enumerate() {
        let segment_id = segment_id as u64;
        if ctx.is_done() {
            return;
        }

        let region = tokio::select! {
            _ = ctx.done() => return,
            mapped = source.map(segment.offset, segment.length) => mapped,
        };
        let region = match region {
            Ok(region) => region,
            Err(e) => {
                error!("Failed to map segment {}: {}", segment_id, e);
                let _ = results
                    .send(SegmentResult {
                        segment_id: None,
                        result: Err(e),
                    })
                    .await;
                return;
            }
        };

        let chunks = chunk_count(segment.length, chunk_size);
        debug!(segment_id, offset = segment.offset, chunks, "Segment mapped");
        lock(&segments).insert(
            segment_id,
            SegmentEntry {
                region: region.clone(),
                finished: 0,
                total: chunks,
            },
        );

        for chunk in chunk_jobs(segment.length, chunk_size) {
            let start = chunk.offset as usize;
            let job = SegmentJob {
                segment_id,
                job: ChunkJob {
                    offset: segment.offset + chunk.offset,
                    length: chunk.length,
                },
                data: region.slice(start..start + chunk.length as usize),
            };
            tokio::select! {
                _ = ctx.done() => return,
                sent = jobs.send(job) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Transfers `source` chunk by chunk while paging it in segment by segment.
///
/// Cancellation and error reporting match [`run_batch`](crate::batch::run_batch):
/// the first failure, including a failure to map a segment, cancels the
/// transfer and is returned.
pub async fn run_segmented(
    ctx: &OpContext,
    source: Arc<dyn SegmentSource>,
    spec: SegmentedSpec,
) -> Result<SegmentStats, TransferError> {
    validate_chunk_size(spec.chunk_size)?;
    let total_size = source.len();
    if total_size == 0 {
        return Ok(SegmentStats::default());
    }

    let segment_size = effective_segment_size(spec.segment_size, spec.chunk_size);
    let total_chunks = chunk_count(total_size, spec.chunk_size);
    let parallelism = effective_parallelism(spec.parallelism);
    info!(
        "Transferring {} bytes in {} chunks across {} segments",
        total_size,
        total_chunks,
        chunk_count(total_size, segment_size)
    );

    let batch_ctx = ctx.child();
    let _cancel_on_return = batch_ctx.drop_guard();

    let progress = spec
        .on_progress
        .map(|sink| ProgressAccumulator::new(total_size, Some(sink)));
    let segments: SharedSegmentMap = Arc::default();

    // One extra slot for a mapping failure.
    let result_capacity = usize::try_from(total_chunks + 1).map_err(|_| {
        TransferError::InvalidConfig(format!("too many chunks: {}", total_chunks))
    })?;
    let (job_tx, job_rx) = mpsc::channel::<SegmentJob>(parallelism);
    let (result_tx, mut result_rx) = mpsc::channel::<SegmentResult>(result_capacity);

    let operation = spec.operation;
    let worker_ctx = batch_ctx.clone();
    spawn_workers(
        parallelism,
        job_rx,
        result_tx.clone(),
        move |job: SegmentJob| {
            let chunk_ctx = ChunkContext {
                ctx: worker_ctx.clone(),
                progress: progress.as_ref().map(|p| p.chunk()),
            };
            let operation = Arc::clone(&operation);
            Box::pin(async move {
                let segment_id = Some(job.segment_id);
                if chunk_ctx.ctx.is_done() {
                    return SegmentResult {
                        segment_id,
                        result: Err(TransferError::Cancelled),
                    };
                }
                let result = run_chunk(operation(job.job, job.data, chunk_ctx), job.job).await;
                SegmentResult { segment_id, result }
            }) as BoxFuture<'static, SegmentResult>
        },
    );

    tokio::spawn(produce_segments(
        batch_ctx.clone(),
        source,
        spec.chunk_size,
        segment_size,
        Arc::clone(&segments),
        job_tx,
        result_tx,
    ));

    let mut completed = 0u64;
    while completed < total_chunks {
        let result = tokio::select! {
            biased;
            result = result_rx.recv() => result,
            _ = batch_ctx.done() => None,
        };
        match result {
            Some(SegmentResult {
                segment_id: Some(segment_id),
                result: Ok(()),
            }) => {
                completed += 1;
                lock(&segments).finish_chunk(segment_id);
            }
            Some(SegmentResult { result, .. }) => {
                let e = result.err().unwrap_or(TransferError::Cancelled);
                error!("Segmented transfer failed: {}", e);
                batch_ctx.cancel();
                return Err(e);
            }
            None => return Err(TransferError::Cancelled),
        }
    }

    let stats = lock(&segments).stats();
    debug!(?stats, "Segmented transfer complete");
    Ok(stats)
}
