//! Concurrent execution backends.
//!
//! The scheduler talks to every backend through the same narrow contract:
//! run the preprocessing phase to completion, submit a batch of tile tasks
//! without blocking, consume results in completion order, cancel what has
//! not started yet. Whether the work happens inline, on a bounded worker
//! pool or on some remote cluster is invisible above this module.
//!
//! # Example
//!
//! ```ignore
//! use tilecascade::executor::{for_concurrency, Executor};
//! use tilecascade::config::Concurrency;
//!
//! let executor = for_concurrency(Concurrency::WorkerPool { workers: 8 })?;
//! let mut stream = executor.submit_all(tasks);
//! for result in &mut stream {
//!     // results arrive in completion order, not submission order
//! }
//! ```

pub mod policy;

mod pool;
mod sequential;

pub use policy::RetryPolicy;
pub use pool::WorkerPoolExecutor;
pub use sequential::SequentialExecutor;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Concurrency;
use crate::task::{PreprocessingCache, PreprocessingTask, TaskError, TaskResult, TileTask};

/// A concurrency backend.
///
/// Implementations must surface backend-level transport failures (a worker
/// dying, a lost connection) as results with
/// [`TaskErrorKind::BackendTransport`](crate::task::TaskErrorKind::BackendTransport),
/// never conflated with user computation errors.
pub trait Executor: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Runs all preprocessing tasks to completion.
    ///
    /// Each key is computed at most once; results land in `cache` where any
    /// later task can retrieve them. Blocks until everything finished.
    fn preprocess(
        &self,
        tasks: Vec<PreprocessingTask>,
        cache: &Arc<PreprocessingCache>,
    ) -> Result<(), TaskError>;

    /// Submits a batch of tile tasks.
    ///
    /// Never blocks; consumption happens through the returned stream.
    fn submit_all(&self, tasks: Vec<TileTask>) -> TaskStream;
}

/// Handle over one submitted batch of tasks.
///
/// Iterating yields [`TaskResult`]s in completion order (not submission
/// order); the sequence is finite and ends when every submitted task has
/// either completed or been cancelled before starting.
pub struct TaskStream {
    inner: StreamInner,
    cancellation: CancellationToken,
}

enum StreamInner {
    /// Tasks run lazily, one per `next()` call, on the consuming thread.
    Inline(VecDeque<TileTask>),
    /// Results arrive from backend workers over a channel.
    Channel(mpsc::UnboundedReceiver<TaskResult>),
}

impl TaskStream {
    pub(crate) fn inline(tasks: Vec<TileTask>) -> Self {
        Self {
            inner: StreamInner::Inline(tasks.into()),
            cancellation: CancellationToken::new(),
        }
    }

    pub(crate) fn channel(
        rx: mpsc::UnboundedReceiver<TaskResult>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            inner: StreamInner::Channel(rx),
            cancellation,
        }
    }

    /// Requests cancellation of all tasks that have not started yet.
    ///
    /// Best-effort: tasks already running may still complete and deliver a
    /// result; the consumer decides whether to trust it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl Iterator for TaskStream {
    type Item = TaskResult;

    fn next(&mut self) -> Option<TaskResult> {
        match &mut self.inner {
            StreamInner::Inline(queue) => {
                if self.cancellation.is_cancelled() {
                    queue.clear();
                    return None;
                }
                queue.pop_front().map(|task| task.run())
            }
            StreamInner::Channel(rx) => rx.blocking_recv(),
        }
    }
}

/// Builds the executor selected by the batch configuration.
pub fn for_concurrency(concurrency: Concurrency) -> Result<Box<dyn Executor>, TaskError> {
    match concurrency {
        Concurrency::Sequential => Ok(Box::new(SequentialExecutor::new())),
        Concurrency::WorkerPool { workers } => Ok(Box::new(WorkerPoolExecutor::new(workers)?)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared builders for executor tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::Map;

    use crate::config::ProcessMode;
    use crate::executor::RetryPolicy;
    use crate::grid::{GridKind, Tile, TilePyramid};
    use crate::io::MemoryOutput;
    use crate::process::{ProcessContext, ProcessError, ProcessOutput, TileProcessor};
    use crate::raster::TileData;
    use crate::task::{PreprocessingCache, TileTask};

    /// Processor that counts invocations and optionally fails on one tile.
    pub struct CountingProcessor {
        pub started: AtomicUsize,
        pub fail_on: Option<(u8, u32, u32)>,
    }

    impl CountingProcessor {
        pub fn new() -> Self {
            Self {
                started: AtomicUsize::new(0),
                fail_on: None,
            }
        }

        pub fn failing_on(tile: &Tile) -> Self {
            Self {
                started: AtomicUsize::new(0),
                fail_on: Some(tile.id()),
            }
        }
    }

    impl TileProcessor for CountingProcessor {
        fn name(&self) -> &str {
            "counting"
        }

        fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(ctx.tile().id()) {
                return Err(ProcessError::new("deliberate failure"));
            }
            Ok(ProcessOutput::Data(TileData::filled(
                ctx.tile().output_shape(),
                1.0,
                -1.0,
            )))
        }
    }

    pub fn pyramid() -> TilePyramid {
        TilePyramid::new(GridKind::Geodetic)
    }

    pub fn make_tasks(
        tiles: Vec<Tile>,
        output: Arc<MemoryOutput>,
        processor: Arc<dyn TileProcessor>,
    ) -> Vec<TileTask> {
        let cache = Arc::new(PreprocessingCache::new());
        let params = Arc::new(Map::new());
        tiles
            .into_iter()
            .map(|tile| {
                TileTask::new(
                    tile,
                    Arc::new(Vec::new()),
                    output.clone(),
                    processor.clone(),
                    params.clone(),
                    RetryPolicy::None,
                    ProcessMode::Continue,
                    cache.clone(),
                )
            })
            .collect()
    }

    pub fn zoom_tiles(zoom: u8, count: usize) -> Vec<Tile> {
        let pyramid = pyramid();
        let mut tiles = Vec::new();
        'outer: for row in 0..pyramid.rows(zoom) {
            for col in 0..pyramid.columns(zoom) {
                if tiles.len() == count {
                    break 'outer;
                }
                tiles.push(pyramid.tile(zoom, row as u32, col as u32).unwrap());
            }
        }
        assert_eq!(tiles.len(), count, "zoom {zoom} has too few tiles");
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::task::TaskOutcome;
    use std::sync::Arc;

    #[test]
    fn test_for_concurrency_builds_backends() {
        assert_eq!(
            for_concurrency(Concurrency::Sequential).unwrap().name(),
            "sequential"
        );
        assert_eq!(
            for_concurrency(Concurrency::WorkerPool { workers: 2 })
                .unwrap()
                .name(),
            "worker-pool"
        );
    }

    #[test]
    fn test_worker_pool_rejects_zero_workers() {
        assert!(for_concurrency(Concurrency::WorkerPool { workers: 0 }).is_err());
    }

    #[test]
    fn test_inline_stream_runs_lazily() {
        let output = Arc::new(crate::io::MemoryOutput::new());
        let processor = Arc::new(CountingProcessor::new());
        let tasks = make_tasks(zoom_tiles(2, 4), output, processor.clone());

        let mut stream = TaskStream::inline(tasks);
        assert_eq!(
            processor.started.load(std::sync::atomic::Ordering::SeqCst),
            0
        );

        let first = stream.next().unwrap();
        assert_eq!(first.outcome(), TaskOutcome::Written);
        assert_eq!(
            processor.started.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn test_inline_stream_cancel_drops_pending() {
        let output = Arc::new(crate::io::MemoryOutput::new());
        let processor = Arc::new(CountingProcessor::new());
        let tasks = make_tasks(zoom_tiles(2, 4), output, processor.clone());

        let mut stream = TaskStream::inline(tasks);
        let _ = stream.next().unwrap();
        stream.cancel();

        assert!(stream.next().is_none());
        assert_eq!(
            processor.started.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
