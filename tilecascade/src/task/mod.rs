//! Tile tasks, task results and preprocessing tasks.
//!
//! A [`TileTask`] is the unit of work the executor runs: open the declared
//! inputs for one tile, invoke the user computation, classify the outcome
//! and hand data to the output collaborator. It owns everything it needs and
//! is never shared between workers.
//!
//! [`PreprocessingTask`]s are heavy one-off computations that run before any
//! tile task; their results are memoized in the process-wide
//! [`PreprocessingCache`] and visible to every task by key.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ProcessMode;
use crate::executor::RetryPolicy;
use crate::grid::{Bounds, Tile};
use crate::io::{with_retry, InputSource, OutputStore};
use crate::process::{OpenedInput, ProcessContext, ProcessOutput, TileProcessor};
use crate::raster::TileData;

// =============================================================================
// Errors
// =============================================================================

/// Classification of task failures.
///
/// Infrastructure failures ([`BackendTransport`](TaskErrorKind::BackendTransport))
/// are kept apart from user computation bugs so operators can tell them
/// apart at a glance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskErrorKind {
    /// A declared input or the output store failed even after retries.
    Io,
    /// The user computation returned an error or panicked.
    Computation,
    /// The batch configuration is inconsistent.
    Configuration,
    /// The concurrency backend failed to return a result.
    BackendTransport,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskErrorKind::Io => write!(f, "I/O error"),
            TaskErrorKind::Computation => write!(f, "computation error"),
            TaskErrorKind::Configuration => write!(f, "configuration error"),
            TaskErrorKind::BackendTransport => write!(f, "backend transport error"),
        }
    }
}

/// A failed task, tagged with the tile it belongs to.
#[derive(Debug)]
pub struct TaskError {
    kind: TaskErrorKind,
    tile: Option<(u8, u32, u32)>,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            tile: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Io, message)
    }

    pub fn computation(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Computation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Configuration, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::BackendTransport, message)
    }

    /// Attaches the underlying error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Tags the error with the tile it occurred on.
    pub fn with_tile(mut self, tile: &Tile) -> Self {
        self.tile = Some(tile.id());
        self
    }

    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    /// `(zoom, row, col)` of the offending tile, if tagged.
    pub fn tile_id(&self) -> Option<(u8, u32, u32)> {
        self.tile
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn prefixed(mut self, prefix: &str) -> Self {
        self.message = format!("{prefix}: {}", self.message);
        self
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tile {
            Some((zoom, row, col)) => {
                write!(
                    f,
                    "{} on tile {}/{}/{}: {}",
                    self.kind, zoom, row, col, self.message
                )
            }
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &_)
    }
}

// =============================================================================
// Task results
// =============================================================================

/// What became of one tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    /// Output was computed and written.
    Written,
    /// Output already existed; the tile was not recomputed.
    SkippedExisting,
    /// The computation signalled no data; nothing was written.
    Empty,
    /// The task failed; the error is attached to the result.
    Failed,
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Written => write!(f, "written"),
            TaskOutcome::SkippedExisting => write!(f, "skipped (exists)"),
            TaskOutcome::Empty => write!(f, "empty"),
            TaskOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// The result of one tile task, produced exactly once per execution.
#[derive(Debug)]
pub struct TaskResult {
    tile: Tile,
    outcome: TaskOutcome,
    process_time: Duration,
    write_time: Duration,
    error: Option<TaskError>,
}

impl TaskResult {
    pub fn written(tile: Tile, process_time: Duration, write_time: Duration) -> Self {
        Self {
            tile,
            outcome: TaskOutcome::Written,
            process_time,
            write_time,
            error: None,
        }
    }

    pub fn skipped_existing(tile: Tile) -> Self {
        Self {
            tile,
            outcome: TaskOutcome::SkippedExisting,
            process_time: Duration::ZERO,
            write_time: Duration::ZERO,
            error: None,
        }
    }

    pub fn empty(tile: Tile, process_time: Duration) -> Self {
        Self {
            tile,
            outcome: TaskOutcome::Empty,
            process_time,
            write_time: Duration::ZERO,
            error: None,
        }
    }

    pub fn failed(tile: Tile, error: TaskError) -> Self {
        let error = error.with_tile(&tile);
        Self {
            tile,
            outcome: TaskOutcome::Failed,
            process_time: Duration::ZERO,
            write_time: Duration::ZERO,
            error: Some(error),
        }
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn outcome(&self) -> TaskOutcome {
        self.outcome
    }

    pub fn process_time(&self) -> Duration {
        self.process_time
    }

    pub fn write_time(&self) -> Duration {
        self.write_time
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == TaskOutcome::Failed
    }

    /// Consumes the result, returning the error of a failed task.
    pub fn into_error(self) -> Option<TaskError> {
        self.error
    }
}

// =============================================================================
// Preprocessing
// =============================================================================

/// Type-erased memoized preprocessing value.
pub type PreprocessedValue = Arc<dyn Any + Send + Sync>;

/// A one-off computation run before any tile task.
pub struct PreprocessingTask {
    key: String,
    bounds: Option<Bounds>,
    compute: Box<dyn FnOnce() -> Result<PreprocessedValue, TaskError> + Send>,
}

impl PreprocessingTask {
    /// Creates a preprocessing task producing a value of type `T`.
    pub fn new<T, F>(key: impl Into<String>, compute: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        Self {
            key: key.into(),
            bounds: None,
            compute: Box::new(move || compute().map(|v| Arc::new(v) as PreprocessedValue)),
        }
    }

    /// Declares the geometry this computation depends on.
    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    /// Runs the computation; errors are prefixed with the task key.
    pub fn run(self) -> Result<PreprocessedValue, TaskError> {
        let key = self.key;
        (self.compute)().map_err(|err| err.prefixed(&format!("preprocessing task '{key}'")))
    }
}

impl fmt::Debug for PreprocessingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreprocessingTask")
            .field("key", &self.key)
            .field("bounds", &self.bounds)
            .finish()
    }
}

/// Process-wide store of memoized preprocessing results.
///
/// Read-only for tile tasks; populated once during the preprocessing phase
/// and dropped with the batch.
pub struct PreprocessingCache {
    values: DashMap<String, PreprocessedValue>,
}

impl PreprocessingCache {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: PreprocessedValue) {
        self.values.insert(key.into(), value);
    }

    /// Typed lookup; `None` if the key is absent or holds a different type.
    pub fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.values
            .get(key)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for PreprocessingCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tile task
// =============================================================================

/// The unit of work: one tile, one user computation invocation.
///
/// All shared state is reached through `Arc`s to read-only structures; the
/// task itself is owned exclusively by the worker executing it.
pub struct TileTask {
    tile: Tile,
    inputs: Arc<Vec<Arc<dyn InputSource>>>,
    output: Arc<dyn OutputStore>,
    processor: Arc<dyn TileProcessor>,
    params: Arc<Map<String, Value>>,
    retry: RetryPolicy,
    mode: ProcessMode,
    preprocessed: Arc<PreprocessingCache>,
}

impl TileTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tile: Tile,
        inputs: Arc<Vec<Arc<dyn InputSource>>>,
        output: Arc<dyn OutputStore>,
        processor: Arc<dyn TileProcessor>,
        params: Arc<Map<String, Value>>,
        retry: RetryPolicy,
        mode: ProcessMode,
        preprocessed: Arc<PreprocessingCache>,
    ) -> Self {
        Self {
            tile,
            inputs,
            output,
            processor,
            params,
            retry,
            mode,
            preprocessed,
        }
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    /// Executes the task and classifies the outcome.
    ///
    /// Never panics and never returns a bare error: every failure mode ends
    /// up as a [`TaskResult`] with outcome [`TaskOutcome::Failed`] tagged
    /// with this tile.
    pub fn run(&self) -> TaskResult {
        let started = Instant::now();

        // Open a scoped handle on every declared input.
        let mut opened = Vec::with_capacity(self.inputs.len());
        for source in self.inputs.iter() {
            match with_retry(&self.retry, source.name(), || source.open(&self.tile)) {
                Ok(handle) => opened.push(OpenedInput::new(
                    source.name().to_string(),
                    handle,
                    self.retry.clone(),
                )),
                Err(err) => {
                    return TaskResult::failed(
                        self.tile.clone(),
                        TaskError::io(format!(
                            "failed to open input '{}' after {} attempt(s)",
                            source.name(),
                            self.retry.max_attempts()
                        ))
                        .with_source(err),
                    );
                }
            }
        }

        let ctx = ProcessContext::new(&self.tile, &opened, &self.params, &self.preprocessed);
        let execution = catch_unwind(AssertUnwindSafe(|| self.processor.execute(&ctx)));
        let process_time = started.elapsed();

        match execution {
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                TaskResult::failed(
                    self.tile.clone(),
                    TaskError::computation(format!("process panicked: {message}")),
                )
            }
            Ok(Err(err)) => {
                let (kind, message, source) = err.into_parts();
                let mut error = TaskError::new(kind, message);
                if let Some(source) = source {
                    error.source = Some(source);
                }
                TaskResult::failed(self.tile.clone(), error)
            }
            Ok(Ok(ProcessOutput::Empty)) => {
                debug!(tile = %self.tile, "output empty, nothing written");
                TaskResult::empty(self.tile.clone(), process_time)
            }
            Ok(Ok(ProcessOutput::Data(data))) => {
                let write_started = Instant::now();
                match write_output(&*self.output, &self.tile, data, self.mode, &self.retry) {
                    Ok(WriteDisposition::Written) => {
                        let write_time = write_started.elapsed();
                        debug!(
                            tile = %self.tile,
                            write_ms = write_time.as_millis() as u64,
                            "output written"
                        );
                        TaskResult::written(self.tile.clone(), process_time, write_time)
                    }
                    Ok(WriteDisposition::SkippedExisting) => {
                        debug!(tile = %self.tile, "output exists, not overwritten");
                        TaskResult::skipped_existing(self.tile.clone())
                    }
                    Err(err) => TaskResult::failed(self.tile.clone(), err),
                }
            }
        }
    }
}

/// How a write attempt ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteDisposition {
    Written,
    SkippedExisting,
}

/// Shared output-write path.
///
/// Used both by regular tile tasks and by the overview aggregation, so
/// overview tiles are indistinguishable downstream from directly computed
/// tiles. Crops buffered process output to the tile's output shape,
/// validates it, honors continue-mode existence and persists with retries.
pub(crate) fn write_output(
    output: &dyn OutputStore,
    tile: &Tile,
    data: TileData,
    mode: ProcessMode,
    retry: &RetryPolicy,
) -> Result<WriteDisposition, TaskError> {
    let data = if data.shape() == tile.shape() && tile.pixelbuffer() > 0 {
        data.without_buffer(tile.pixelbuffer()).map_err(|err| {
            TaskError::computation("failed to strip pixel buffer from output").with_source(err)
        })?
    } else {
        data
    };

    if data.shape() != tile.output_shape() {
        return Err(TaskError::computation(format!(
            "output shape {} does not match tile shape {}",
            data.shape(),
            tile.output_shape()
        )));
    }
    if !output.output_valid(&data) {
        return Err(TaskError::computation("output failed validity check"));
    }

    // A concurrent or earlier run may have written the tile since the work
    // set was derived.
    if mode == ProcessMode::Continue {
        let exists = with_retry(retry, "tiles_exist", || output.tiles_exist(tile))
            .map_err(|err| TaskError::io("existence check failed").with_source(err))?;
        if exists {
            return Ok(WriteDisposition::SkippedExisting);
        }
    }

    with_retry(retry, "write", || output.write(tile, &data))
        .map_err(|err| TaskError::io("write failed").with_source(err))?;
    Ok(WriteDisposition::Written)
}
