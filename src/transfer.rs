//! Whole-object uploads and downloads.
//!
//! These functions combine the pieces of the crate: the object is split into
//! ranges by the batch engine, every range goes through a [`RangeTransport`]
//! (whose requests are retried by the retry policy), and downloaded ranges
//! are read through a [`ResilientReader`] so broken bodies are healed.

use bytes::Bytes;
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::batch::{chunk_count, run_batch, ChunkContext, TransferSpec};
use crate::context::OpContext;
use crate::error::TransferError;
use crate::progress::{ChunkProgress, ProgressReader};
use crate::reader::{GetInfo, ReaderOptions, ResilientReader};
use crate::segmented::{run_segmented, FileSegmentSource, SegmentSource, SegmentedSpec};
use crate::transport::{range_getter, ObjectProperties, RangeTransport};
use crate::types::{
    ChunkJob, ETag, TransferOptions, TransferReport, MAX_OBJECT_SIZE, MAX_UPLOAD_RANGE_BYTES,
};

/// Range size for uploads: defaults to, and may not exceed, 4 MiB.
fn upload_range_size(options: &TransferOptions) -> Result<u64, TransferError> {
    match options.range_size {
        0 => Ok(MAX_UPLOAD_RANGE_BYTES),
        size if size > MAX_UPLOAD_RANGE_BYTES => Err(TransferError::InvalidConfig(format!(
            "range size {} exceeds the maximum of {} bytes",
            size, MAX_UPLOAD_RANGE_BYTES
        ))),
        size => Ok(size),
    }
}

fn download_range_size(options: &TransferOptions) -> u64 {
    match options.range_size {
        0 => MAX_UPLOAD_RANGE_BYTES,
        size => size,
    }
}

fn check_object_size(size: u64) -> Result<(), TransferError> {
    if size > MAX_OBJECT_SIZE {
        return Err(TransferError::InvalidConfig(format!(
            "object of {} bytes exceeds the maximum of {} bytes",
            size, MAX_OBJECT_SIZE
        )));
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn with_options(spec: TransferSpec, options: &TransferOptions) -> TransferSpec {
    let spec = spec.with_parallelism(options.parallelism);
    match &options.progress {
        Some(progress) => spec.with_progress(Arc::clone(progress)),
        None => spec,
    }
}

/// Uploads an in-memory buffer range by range.
///
/// # Arguments
///
/// * `ctx` - Operation context; cancelling it aborts the upload
/// * `transport` - Destination of the ranged writes
/// * `data` - Payload to upload
/// * `options` - Range size, parallelism and progress sink
///
/// # Returns
///
/// A report of the bytes and ranges written
pub async fn upload_buffer(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    data: Bytes,
    options: &TransferOptions,
) -> Result<TransferReport, TransferError> {
    let range_size = upload_range_size(options)?;
    let size = data.len() as u64;
    check_object_size(size)?;

    let started = Instant::now();
    info!("Uploading {} bytes in ranges of {} bytes", size, range_size);
    transport.prepare_upload(ctx, size).await?;

    let uploader = Arc::clone(&transport);
    let spec = TransferSpec::new(size, range_size, move |job: ChunkJob, chunk: ChunkContext| {
        let transport = Arc::clone(&uploader);
        let start = job.offset as usize;
        let range = data.slice(start..start + job.length as usize);
        async move {
            transport
                .put_range(&chunk.ctx, job.offset, range, chunk.progress)
                .await
        }
    });
    run_batch(ctx, with_options(spec, options)).await?;

    Ok(TransferReport {
        bytes: size,
        chunks: chunk_count(size, range_size),
        elapsed_ms: elapsed_ms(started),
        etag: None,
    })
}

/// Uploads a local file, paging it in segment by segment.
pub async fn upload_file(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    path: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<TransferReport, TransferError> {
    let range_size = upload_range_size(options)?;
    let source = FileSegmentSource::open(path.as_ref()).await?;
    let size = source.len();
    check_object_size(size)?;

    let started = Instant::now();
    info!("Uploading {} ({} bytes)", path.as_ref().display(), size);
    transport.prepare_upload(ctx, size).await?;

    let uploader = Arc::clone(&transport);
    let mut spec = SegmentedSpec::new(range_size, move |job: ChunkJob, data: Bytes, chunk: ChunkContext| {
        let transport = Arc::clone(&uploader);
        async move {
            transport
                .put_range(&chunk.ctx, job.offset, data, chunk.progress)
                .await
        }
    })
    .with_segment_size(options.segment_size)
    .with_parallelism(options.parallelism);
    if let Some(progress) = &options.progress {
        spec = spec.with_progress(Arc::clone(progress));
    }

    let stats = run_segmented(ctx, Arc::new(source), spec).await?;
    debug!(?stats, "File upload complete");

    Ok(TransferReport {
        bytes: size,
        chunks: chunk_count(size, range_size),
        elapsed_ms: elapsed_ms(started),
        etag: None,
    })
}

/// Opens a healing reader over `[offset, offset + count)`, or to the end when `count` is `None`.
///
/// The first request is issued immediately so that a missing object or an
/// unsatisfiable range is reported here rather than on the first read.
pub async fn open_reader(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    offset: u64,
    count: Option<u64>,
    etag: Option<ETag>,
    options: ReaderOptions,
) -> Result<ResilientReader, TransferError> {
    let getter = range_getter(transport, ctx.clone());
    let info = GetInfo::new(offset, count, etag);
    let initial = getter(info.clone()).await?;
    Ok(ResilientReader::new(Some(initial), info, getter, options))
}

/// Reads one chunk into memory through a [`ResilientReader`].
async fn read_chunk(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    job: ChunkJob,
    etag: Option<ETag>,
    retries: u32,
    progress: Option<ChunkProgress>,
) -> Result<Vec<u8>, TransferError> {
    let options = ReaderOptions {
        max_retry_requests: retries,
    };
    let mut reader = open_reader(ctx, transport, job.offset, Some(job.length), etag, options).await?;

    let len = usize::try_from(job.length).map_err(|_| {
        TransferError::InvalidConfig(format!("range of {} bytes is too large", job.length))
    })?;
    let mut buf = vec![0u8; len];
    let read = match progress {
        Some(progress) => {
            ProgressReader::new(&mut reader, progress)
                .read_exact(&mut buf)
                .await
        }
        None => reader.read_exact(&mut buf).await,
    };
    read.map_err(TransferError::from_io)?;
    reader.close()?;
    Ok(buf)
}

/// Downloads the whole object into memory.
pub async fn download_to_vec(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    options: &TransferOptions,
) -> Result<(Vec<u8>, TransferReport), TransferError> {
    let started = Instant::now();
    let properties = transport.properties(ctx).await?;
    let size = usize::try_from(properties.content_length).map_err(|_| {
        TransferError::InvalidConfig(format!(
            "object of {} bytes does not fit in memory",
            properties.content_length
        ))
    })?;

    let buffer = Arc::new(Mutex::new(vec![0u8; size]));
    let sink = Arc::clone(&buffer);
    let report = download_chunks(ctx, transport, &properties, options, move |job, data| {
        let sink = Arc::clone(&sink);
        async move {
            let start = job.offset as usize;
            let mut buffer = sink.lock().unwrap_or_else(PoisonError::into_inner);
            buffer[start..start + data.len()].copy_from_slice(&data);
            Ok(())
        }
    })
    .await?;

    let data = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
    Ok((data, TransferReport {
        elapsed_ms: elapsed_ms(started),
        ..report
    }))
}

/// Downloads the whole object into a local file.
pub async fn download_to_file(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    path: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<TransferReport, TransferError> {
    let properties = transport.properties(ctx).await?;
    download_to_file_with_properties(ctx, transport, path, &properties, options).await
}

/// Like [`download_to_file`], for callers that already fetched the object's properties.
///
/// The file is created (or truncated) and sized to the object before any
/// range is written, so ranges can land in any order.
pub async fn download_to_file_with_properties(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    path: impl AsRef<Path>,
    properties: &ObjectProperties,
    options: &TransferOptions,
) -> Result<TransferReport, TransferError> {
    let started = Instant::now();
    let path = path.as_ref().to_path_buf();
    info!(
        "Downloading {} bytes to {}",
        properties.content_length,
        path.display()
    );

    let file = File::create(&path).await?;
    file.set_len(properties.content_length).await?;
    drop(file);

    let report = download_chunks(ctx, transport, properties, options, move |job, data| {
        let path = path.clone();
        async move {
            let mut file = OpenOptions::new().write(true).open(&path).await?;
            file.seek(SeekFrom::Start(job.offset)).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            Ok(())
        }
    })
    .await?;
    Ok(TransferReport {
        elapsed_ms: elapsed_ms(started),
        ..report
    })
}

/// Runs a download batch, handing every chunk's bytes to `store`.
async fn download_chunks<F, Fut>(
    ctx: &OpContext,
    transport: Arc<dyn RangeTransport>,
    properties: &ObjectProperties,
    options: &TransferOptions,
    store: F,
) -> Result<TransferReport, TransferError>
where
    F: Fn(ChunkJob, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
{
    let range_size = download_range_size(options);
    let size = properties.content_length;
    let etag = properties.etag.clone();
    let retries = options.max_retry_requests_per_range;
    let store = Arc::new(store);

    let spec = TransferSpec::new(size, range_size, move |job: ChunkJob, chunk: ChunkContext| {
        let transport = Arc::clone(&transport);
        let etag = etag.clone();
        let store = Arc::clone(&store);
        async move {
            let data = read_chunk(&chunk.ctx, transport, job, etag, retries, chunk.progress).await?;
            store(job, data).await
        }
    });
    run_batch(ctx, with_options(spec, options)).await?;

    Ok(TransferReport {
        bytes: size,
        chunks: chunk_count(size, range_size),
        elapsed_ms: 0,
        etag: properties.etag.as_ref().map(|e| e.as_str().to_string()),
    })
}
