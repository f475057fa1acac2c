//! Chunked parallel transfer engine.
//!
//! [`run_batch`] splits `[0, total_size)` into fixed-size chunks and drives
//! them through a fixed pool of workers. The first failing chunk cancels the
//! batch context and is returned; chunks already written are not rolled back.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, trace};

use crate::context::OpContext;
use crate::error::TransferError;
use crate::progress::{ChunkProgress, ProgressAccumulator};
use crate::types::{ChunkJob, ProgressFn, DEFAULT_PARALLELISM};

/// What a chunk operation gets besides its range.
#[derive(Clone)]
pub struct ChunkContext {
    /// Batch context; cancelled as soon as any chunk fails.
    pub ctx: OpContext,
    /// Present when the caller asked for progress reports.
    pub progress: Option<ChunkProgress>,
}

/// Future returned by a chunk operation.
pub type ChunkFuture = BoxFuture<'static, Result<(), TransferError>>;

/// Per-chunk operation: transfer `job` and report its outcome.
pub type ChunkOperation = Arc<dyn Fn(ChunkJob, ChunkContext) -> ChunkFuture + Send + Sync>;

/// Description of one batch transfer.
#[derive(Clone)]
pub struct TransferSpec {
    pub total_size: u64,
    pub chunk_size: u64,
    /// Number of workers; 0 means [`DEFAULT_PARALLELISM`].
    pub parallelism: usize,
    pub operation: ChunkOperation,
    pub on_progress: Option<ProgressFn>,
}

impl TransferSpec {
    pub fn new<F, Fut>(total_size: u64, chunk_size: u64, operation: F) -> Self
    where
        F: Fn(ChunkJob, ChunkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TransferError>> + Send + 'static,
    {
        Self {
            total_size,
            chunk_size,
            parallelism: 0,
            operation: Arc::new(move |job: ChunkJob, ctx: ChunkContext| -> ChunkFuture {
                Box::pin(operation(job, ctx))
            }),
            on_progress: None,
        }
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

/// Number of chunks needed to cover `total_size`.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Chunks tiling `[0, total_size)`; the last one is truncated to the remainder.
pub fn chunk_jobs(total_size: u64, chunk_size: u64) -> impl Iterator<Item = ChunkJob> {
    (0..chunk_count(total_size, chunk_size)).map(move |index| {
        let offset = index * chunk_size;
        ChunkJob {
            offset,
            length: chunk_size.min(total_size - offset),
        }
    })
}

pub(crate) fn effective_parallelism(parallelism: usize) -> usize {
    if parallelism == 0 {
        DEFAULT_PARALLELISM
    } else {
        parallelism
    }
}

pub(crate) fn validate_chunk_size(chunk_size: u64) -> Result<(), TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidConfig(
            "chunk size must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Starts `parallelism` workers pulling jobs until the job channel closes.
///
/// Each result is pushed to `results`; callers size that channel to the job
/// count so a worker never blocks publishing after the driver stopped draining.
pub(crate) fn spawn_workers<J, R, F>(
    parallelism: usize,
    jobs: mpsc::Receiver<J>,
    results: mpsc::Sender<R>,
    run: F,
) where
    J: Send + 'static,
    R: Send + 'static,
    F: Fn(J) -> BoxFuture<'static, R> + Send + Sync + 'static,
{
    let jobs = Arc::new(Mutex::new(jobs));
    let run = Arc::new(run);

    for worker in 0..parallelism {
        let jobs = Arc::clone(&jobs);
        let results = results.clone();
        let run = Arc::clone(&run);

        tokio::spawn(async move {
            loop {
                let job = jobs.lock().await.recv().await;
                let Some(job) = job else { break };
                if results.send(run(job).await).await.is_err() {
                    break;
                }
            }
            trace!(worker, "Worker exiting");
        });
    }
}

/// Runs one chunk in its own task so a panic surfaces as an error instead of a lost result.
pub(crate) async fn run_chunk(
    operation: ChunkFuture,
    job: ChunkJob,
) -> Result<(), TransferError> {
    match tokio::spawn(operation).await {
        Ok(result) => result,
        Err(e) => Err(TransferError::TaskFailed(format!(
            "chunk at offset {} failed: {}",
            job.offset, e
        ))),
    }
}

/// Performs an entire multi-chunk transfer.
///
/// Returns the first error drained from the result queue, or `Ok(())` once
/// every chunk succeeded. An empty transfer succeeds without running any
/// chunk.
///
/// # Example
///
/// ```no_run
/// use rangesync::{run_batch, OpContext, TransferSpec};
///
/// # async fn example() -> Result<(), rangesync::TransferError> {
/// let spec = TransferSpec::new(10_000_000, 4_000_000, |job, _chunk| async move {
///     println!("transferring {} bytes at {}", job.length, job.offset);
///     Ok(())
/// })
/// .with_parallelism(3);
///
/// run_batch(&OpContext::new(), spec).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_batch(ctx: &OpContext, spec: TransferSpec) -> Result<(), TransferError> {
    validate_chunk_size(spec.chunk_size)?;
    if spec.total_size == 0 {
        return Ok(());
    }

    let total_chunks = chunk_count(spec.total_size, spec.chunk_size);
    let parallelism = effective_parallelism(spec.parallelism);
    debug!(
        total_size = spec.total_size,
        chunk_size = spec.chunk_size,
        total_chunks,
        parallelism,
        "Starting batch"
    );

    let batch_ctx = ctx.child();
    let _cancel_on_return = batch_ctx.drop_guard();

    let progress = spec
        .on_progress
        .map(|sink| ProgressAccumulator::new(spec.total_size, Some(sink)));

    let result_capacity = usize::try_from(total_chunks).map_err(|_| {
        TransferError::InvalidConfig(format!("too many chunks: {}", total_chunks))
    })?;
    let (job_tx, job_rx) = mpsc::channel::<ChunkJob>(parallelism);
    let (result_tx, mut result_rx) = mpsc::channel(result_capacity);

    let operation = spec.operation;
    let worker_ctx = batch_ctx.clone();
    spawn_workers(parallelism, job_rx, result_tx, move |job: ChunkJob| {
        let chunk_ctx = ChunkContext {
            ctx: worker_ctx.clone(),
            progress: progress.as_ref().map(|p| p.chunk()),
        };
        let operation = Arc::clone(&operation);
        Box::pin(async move {
            if chunk_ctx.ctx.is_done() {
                return Err(TransferError::Cancelled);
            }
            trace!(offset = job.offset, length = job.length, "Running chunk");
            run_chunk(operation(job, chunk_ctx), job).await
        }) as BoxFuture<'static, Result<(), TransferError>>
    });

    let producer_ctx = batch_ctx.clone();
    let (total_size, chunk_size) = (spec.total_size, spec.chunk_size);
    tokio::spawn(async move {
        for job in chunk_jobs(total_size, chunk_size) {
            tokio::select! {
                _ = producer_ctx.done() => break,
                sent = job_tx.send(job) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut completed = 0u64;
    while completed < total_chunks {
        let result = tokio::select! {
            biased;
            result = result_rx.recv() => result,
            _ = batch_ctx.done() => None,
        };
        match result {
            Some(Ok(())) => completed += 1,
            Some(Err(e)) => {
                error!("Chunk failed, cancelling batch: {}", e);
                batch_ctx.cancel();
                return Err(e);
            }
            None => return Err(TransferError::Cancelled),
        }
    }

    debug!(total_chunks, "Batch complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn chunks_tile_the_range() {
        for total in [0u64, 1, 7, 8, 9, 63, 64, 65, 1000] {
            for chunk in [1u64, 3, 8, 64, 2000] {
                let jobs: Vec<_> = chunk_jobs(total, chunk).collect();
                assert_eq!(jobs.len() as u64, chunk_count(total, chunk));

                let mut next = 0;
                for job in &jobs {
                    assert_eq!(job.offset, next);
                    assert!(job.length > 0 && job.length <= chunk);
                    next += job.length;
                }
                assert_eq!(next, total);

                if let Some(last) = jobs.last() {
                    let expected = if total % chunk == 0 { chunk } else { total % chunk };
                    assert_eq!(last.length, expected);
                }
            }
        }
    }

    #[tokio::test]
    async fn empty_transfer_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let spec = TransferSpec::new(0, 1024, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        run_batch(&OpContext::new(), spec).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected() {
        let spec = TransferSpec::new(10, 0, |_, _| async { Ok(()) });
        assert!(matches!(
            run_batch(&OpContext::new(), spec).await,
            Err(TransferError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn ten_megabytes_in_three_chunks() {
        let jobs = Arc::new(StdMutex::new(Vec::new()));
        let totals = Arc::new(StdMutex::new(Vec::new()));

        let seen_jobs = jobs.clone();
        let seen_totals = totals.clone();
        let spec = TransferSpec::new(10_000_000, 4_000_000, move |job, chunk: ChunkContext| {
            seen_jobs.lock().unwrap().push(job);
            async move {
                let progress = chunk.progress.expect("progress requested");
                progress.update(job.length / 2);
                tokio::task::yield_now().await;
                progress.update(job.length);
                Ok(())
            }
        })
        .with_parallelism(3)
        .with_progress(Arc::new(move |total| seen_totals.lock().unwrap().push(total)));

        run_batch(&OpContext::new(), spec).await.unwrap();

        let mut jobs = jobs.lock().unwrap().clone();
        jobs.sort_by_key(|job| job.offset);
        let lengths: Vec<u64> = jobs.iter().map(|job| job.length).collect();
        assert_eq!(lengths, vec![4_000_000, 4_000_000, 2_000_000]);

        let totals = totals.lock().unwrap();
        assert!(totals.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(totals.last(), Some(&10_000_000));
    }

    #[tokio::test]
    async fn first_failure_is_returned() {
        let spec = TransferSpec::new(100, 10, |job, _| async move {
            if job.offset == 40 {
                Err(TransferError::Status { code: 500 })
            } else {
                Ok(())
            }
        })
        .with_parallelism(4);

        let err = run_batch(&OpContext::new(), spec).await.unwrap_err();
        assert!(matches!(err, TransferError::Status { code: 500 }));
    }

    #[tokio::test]
    async fn failure_cancels_remaining_chunks() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let spec = TransferSpec::new(1000, 10, move |job, chunk: ChunkContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if job.offset == 0 {
                    return Err(TransferError::fatal("boom"));
                }
                chunk.ctx.done().await;
                Err(TransferError::Cancelled)
            }
        })
        .with_parallelism(2);

        let err = run_batch(&OpContext::new(), spec).await.unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn parallelism_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        let spec = TransferSpec::new(64, 1, move |_, _| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        run_batch(&OpContext::new(), spec).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= DEFAULT_PARALLELISM);
    }

    #[tokio::test]
    async fn panicking_chunk_fails_the_batch() {
        let spec = TransferSpec::new(30, 10, |job, _| async move {
            if job.offset == 10 {
                panic!("chunk exploded");
            }
            Ok(())
        });

        let err = run_batch(&OpContext::new(), spec).await.unwrap_err();
        assert!(matches!(err, TransferError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn cancelled_context_stops_the_batch() {
        let ctx = OpContext::new();
        ctx.cancel();
        let spec = TransferSpec::new(100, 10, |_, _| async { Ok(()) });
        assert!(matches!(
            run_batch(&ctx, spec).await,
            Err(TransferError::Cancelled)
        ));
    }
}
