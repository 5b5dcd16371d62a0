//! Batch scheduler.
//!
//! Single-threaded control logic walking the configured zoom levels in
//! dependency order, deriving the work set per zoom, dispatching tile tasks
//! to the executor and cascading finished baselevel tiles upward into
//! overview tiles.
//!
//! ```text
//!  Idle ──► Preprocessing ──► ProcessingZoom(max)
//!                                    │
//!                                    ▼
//!                          AggregatingOverview(max-1)
//!                                    │
//!                                    ▼
//!                                   ...
//!                                    │
//!                                    ▼
//!                            Done  /  Aborted
//! ```
//!
//! A zoom level is never entered until the zoom it aggregates from has
//! finished. The first fatal failure cancels outstanding work, discards
//! late results and surfaces the error with the offending tile attached.
//! Terminal states are final: restart safety comes from re-deriving the
//! work set through the output's existence check on the next invocation.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::area::ProcessArea;
use crate::config::{BatchConfig, ProcessMode};
use crate::executor::{for_concurrency, Executor, TaskStream};
use crate::grid::Tile;
use crate::io::{with_retry, InputSource, OutputStore};
use crate::mosaic;
use crate::process::TileProcessor;
use crate::task::{
    write_output, PreprocessingCache, TaskError, TaskOutcome, TaskResult, TileTask,
    WriteDisposition,
};

/// Scheduler states, in the order a successful batch passes through them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Preprocessing,
    ProcessingZoom(u8),
    AggregatingOverview(u8),
    Done,
    Aborted,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Idle => write!(f, "idle"),
            BatchState::Preprocessing => write!(f, "preprocessing"),
            BatchState::ProcessingZoom(zoom) => write!(f, "processing zoom {zoom}"),
            BatchState::AggregatingOverview(zoom) => write!(f, "aggregating overview {zoom}"),
            BatchState::Done => write!(f, "done"),
            BatchState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Errors ending a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Invalid or inconsistent configuration, detected before any task is
    /// submitted.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A preprocessing task failed.
    #[error("preprocessing failed")]
    Preprocessing {
        #[source]
        source: TaskError,
    },

    /// A tile task (or overview aggregation) failed fatally.
    #[error("tile {zoom}/{row}/{col} failed")]
    TileFailed {
        zoom: u8,
        row: u32,
        col: u32,
        #[source]
        source: TaskError,
    },

    /// The batch was cancelled from outside.
    #[error("batch cancelled")]
    Cancelled,
}

impl BatchError {
    fn tile_failed(tile: &Tile, source: TaskError) -> Self {
        BatchError::TileFailed {
            zoom: tile.zoom(),
            row: tile.row(),
            col: tile.col(),
            source,
        }
    }
}

/// Per-run outcome counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchSummary {
    pub written: usize,
    pub skipped_existing: usize,
    pub empty: usize,
    pub elapsed: Duration,
}

impl BatchSummary {
    /// Total number of tiles that reached a terminal outcome.
    pub fn tiles(&self) -> usize {
        self.written + self.skipped_existing + self.empty
    }

    fn record(&mut self, result: &TaskResult) {
        match result.outcome() {
            TaskOutcome::Written => self.written += 1,
            TaskOutcome::SkippedExisting => self.skipped_existing += 1,
            TaskOutcome::Empty => self.empty += 1,
            TaskOutcome::Failed => {}
        }
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} written, {} skipped (exist), {} empty in {:.1?}",
            self.written, self.skipped_existing, self.empty, self.elapsed
        )
    }
}

/// The batch orchestrator.
///
/// Owns the executor for exactly one batch invocation. Input cleanup and
/// output close are guaranteed on every exit path, abort included.
pub struct BatchScheduler {
    config: Arc<BatchConfig>,
    inputs: Vec<Arc<dyn InputSource>>,
    output: Arc<dyn OutputStore>,
    processor: Arc<dyn TileProcessor>,
    executor: Box<dyn Executor>,
    preprocessed: Arc<PreprocessingCache>,
    area: ProcessArea,
    state: BatchState,
    cancellation: CancellationToken,
}

impl BatchScheduler {
    /// Creates a scheduler for one batch invocation.
    pub fn new(
        config: BatchConfig,
        inputs: Vec<Arc<dyn InputSource>>,
        output: Arc<dyn OutputStore>,
        processor: Arc<dyn TileProcessor>,
    ) -> Result<Self, BatchError> {
        let executor = for_concurrency(config.concurrency)
            .map_err(|err| BatchError::Configuration(err.to_string()))?;

        // Coverage resolution stays lazy: the closure runs only if a zoom
        // is resolved without declared bounds.
        let coverage_inputs = inputs.clone();
        let extent = config.pyramid.extent();
        let coverage = Box::new(move || {
            coverage_inputs
                .iter()
                .map(|input| input.coverage().unwrap_or(extent))
                .collect()
        });
        let area = ProcessArea::new(
            config.pyramid.clone(),
            config.bounds,
            coverage,
            !inputs.is_empty(),
        );

        Ok(Self {
            config: Arc::new(config),
            inputs,
            output,
            processor,
            executor,
            preprocessed: Arc::new(PreprocessingCache::new()),
            area,
            state: BatchState::Idle,
            cancellation: CancellationToken::new(),
        })
    }

    /// Current scheduler state.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Token cancelling the batch from another thread (e.g. a SIGINT
    /// handler). The batch ends in `Aborted` with [`BatchError::Cancelled`].
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Memoized preprocessing results of this batch.
    pub fn preprocessing_cache(&self) -> &Arc<PreprocessingCache> {
        &self.preprocessed
    }

    /// Counts the tiles in the work area over all configured zoom levels.
    ///
    /// Existence checks are not consulted; this is the upper bound used for
    /// progress reporting.
    pub fn count_tiles(&self) -> Result<usize, BatchError> {
        let mut total = 0;
        for zoom in self.config.zoom_levels.descending() {
            let area = self.area.at_zoom(zoom);
            total += self
                .config
                .pyramid
                .count_tiles(zoom, &area)
                .map_err(|err| BatchError::Configuration(err.to_string()))?;
        }
        Ok(total)
    }

    /// Runs the batch to completion.
    pub fn run(&mut self) -> Result<BatchSummary, BatchError> {
        self.run_with(|_| {})
    }

    /// Runs the batch, handing every task result to `sink` as it arrives.
    pub fn run_with<F>(&mut self, mut sink: F) -> Result<BatchSummary, BatchError>
    where
        F: FnMut(&TaskResult),
    {
        if self.state != BatchState::Idle {
            return Err(BatchError::Configuration(format!(
                "batch already ran (state: {})",
                self.state
            )));
        }

        let outcome = self.run_inner(&mut sink);

        // Collaborator teardown on every exit path, abort included.
        for input in &self.inputs {
            debug!(input = input.name(), "running input cleanup");
            input.cleanup();
        }
        debug!("closing output");
        self.output.close();

        outcome
    }

    fn run_inner(
        &mut self,
        sink: &mut dyn FnMut(&TaskResult),
    ) -> Result<BatchSummary, BatchError> {
        let started = Instant::now();
        let mut summary = BatchSummary::default();

        self.transition(BatchState::Preprocessing);
        self.run_preprocessing()?;

        // Resolve every zoom's area up front: an empty run is a
        // configuration error unless explicitly allowed, raised before any
        // task is submitted.
        let mut any_work = false;
        for zoom in self.config.zoom_levels.descending() {
            if !self.area.at_zoom(zoom).is_empty() {
                any_work = true;
            }
        }
        if !any_work && !self.config.allow_empty_area {
            return self.abort(BatchError::Configuration(
                "resolved process area is empty".into(),
            ));
        }

        for zoom in self.config.zoom_levels.descending() {
            self.check_cancelled()?;
            let direct = self.config.overviews.is_none() || zoom == self.config.baselevel();
            if direct {
                self.process_zoom(zoom, sink, &mut summary)?;
            } else {
                self.aggregate_overview(zoom, sink, &mut summary)?;
            }
        }

        summary.elapsed = started.elapsed();
        self.transition(BatchState::Done);
        info!(%summary, "batch finished");
        Ok(summary)
    }

    fn run_preprocessing(&mut self) -> Result<(), BatchError> {
        let mut tasks = Vec::new();
        for input in &self.inputs {
            tasks.extend(input.preprocessing_tasks());
        }
        if tasks.is_empty() {
            return Ok(());
        }
        info!(count = tasks.len(), "running preprocessing tasks");
        match self.executor.preprocess(tasks, &self.preprocessed) {
            Ok(()) => Ok(()),
            Err(source) => self.abort(BatchError::Preprocessing { source }),
        }
    }

    fn process_zoom(
        &mut self,
        zoom: u8,
        sink: &mut dyn FnMut(&TaskResult),
        summary: &mut BatchSummary,
    ) -> Result<(), BatchError> {
        self.transition(BatchState::ProcessingZoom(zoom));

        let area = self.area.at_zoom(zoom);
        let retry = self.config.retry_policy();
        let shared_inputs = Arc::new(self.inputs.clone());
        let params = Arc::new(self.config.process_parameters.clone());

        // Derive the work set: tiles already satisfied never touch the
        // executor.
        let mut tasks = Vec::new();
        let tiles = self
            .config
            .pyramid
            .tiles_over(zoom, &area)
            .map_err(|err| BatchError::Configuration(err.to_string()))?
            .collect::<Vec<_>>();
        for tile in tiles {
            if self.config.mode == ProcessMode::Continue {
                let exists = with_retry(&retry, "tiles_exist", || self.output.tiles_exist(&tile));
                match exists {
                    Ok(true) => {
                        let result = TaskResult::skipped_existing(tile);
                        summary.record(&result);
                        sink(&result);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        let source =
                            TaskError::io("existence check failed").with_source(err).with_tile(&tile);
                        return self.abort(BatchError::tile_failed(&tile, source));
                    }
                }
            }
            tasks.push(TileTask::new(
                tile,
                shared_inputs.clone(),
                self.output.clone(),
                self.processor.clone(),
                params.clone(),
                retry.clone(),
                self.config.mode,
                self.preprocessed.clone(),
            ));
        }

        info!(
            zoom,
            tasks = tasks.len(),
            skipped = summary.skipped_existing,
            executor = self.executor.name(),
            "processing zoom level"
        );

        let mut stream = self.executor.submit_all(tasks);
        while let Some(result) = stream.next() {
            if self.cancellation.is_cancelled() {
                stream.cancel();
                Self::drain_discarded(&mut stream);
                return self.abort(BatchError::Cancelled);
            }
            if result.is_failed() {
                stream.cancel();
                Self::drain_discarded(&mut stream);
                let tile = result.tile().clone();
                let source = result
                    .into_error()
                    .expect("failed result carries its error");
                error!(tile = %tile, error = %source, "tile failed, aborting batch");
                return self.abort(BatchError::tile_failed(&tile, source));
            }
            debug!(tile = %result.tile(), outcome = %result.outcome(), "task finished");
            summary.record(&result);
            sink(&result);
        }
        Ok(())
    }

    fn aggregate_overview(
        &mut self,
        zoom: u8,
        sink: &mut dyn FnMut(&TaskResult),
        summary: &mut BatchSummary,
    ) -> Result<(), BatchError> {
        self.transition(BatchState::AggregatingOverview(zoom));

        let options = self
            .config
            .overviews
            .expect("overview zoom requires overview options");
        let retry = self.config.retry_policy();
        let area = self.area.at_zoom(zoom);
        let parents = self
            .config
            .pyramid
            .tiles_over(zoom, &area)
            .map_err(|err| BatchError::Configuration(err.to_string()))?
            .collect::<Vec<_>>();

        info!(zoom, parents = parents.len(), "aggregating overview level");

        for parent in parents {
            self.check_cancelled()?;

            if self.config.mode == ProcessMode::Continue {
                match with_retry(&retry, "tiles_exist", || self.output.tiles_exist(&parent)) {
                    Ok(true) => {
                        let result = TaskResult::skipped_existing(parent);
                        summary.record(&result);
                        sink(&result);
                        continue;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        let source = TaskError::io("existence check failed")
                            .with_source(err)
                            .with_tile(&parent);
                        return self.abort(BatchError::tile_failed(&parent, source));
                    }
                }
            }

            let started = Instant::now();
            let result = match self.aggregate_parent(&parent, options.resampling, &retry, started)
            {
                Ok(result) => result,
                Err(source) => {
                    error!(tile = %parent, error = %source, "overview aggregation failed, aborting batch");
                    return self.abort(BatchError::tile_failed(&parent, source));
                }
            };
            debug!(tile = %result.tile(), outcome = %result.outcome(), "overview tile finished");
            summary.record(&result);
            sink(&result);
        }
        Ok(())
    }

    /// Aggregates one parent from its children's persisted outputs.
    ///
    /// A child that exists in the output store is trusted regardless of
    /// whether this run wrote it or skipped it as pre-existing; a child
    /// without output contributes nodata.
    fn aggregate_parent(
        &self,
        parent: &Tile,
        resampling: crate::raster::ResamplingMethod,
        retry: &crate::executor::RetryPolicy,
        started: Instant,
    ) -> Result<TaskResult, TaskError> {
        let children = self.config.pyramid.children(parent);
        let mut child_data = Vec::with_capacity(children.len());
        for child in children {
            let exists = with_retry(retry, "tiles_exist", || self.output.tiles_exist(&child))
                .map_err(|err| {
                    TaskError::io("existence check failed")
                        .with_source(err)
                        .with_tile(&child)
                })?;
            let data = if exists {
                with_retry(retry, "read", || self.output.read(&child)).map_err(|err| {
                    TaskError::io("reading child tile failed")
                        .with_source(err)
                        .with_tile(&child)
                })?
            } else {
                None
            };
            child_data.push((child, data));
        }

        let merged = mosaic::aggregate(&self.config.pyramid, parent, &child_data, resampling)
            .map_err(|err| {
                TaskError::computation("mosaic aggregation failed")
                    .with_source(err)
                    .with_tile(parent)
            })?;
        let process_time = started.elapsed();

        match merged {
            None => Ok(TaskResult::empty(parent.clone(), process_time)),
            Some(data) => {
                // Same output-write path as a regular tile task, so
                // overview tiles are indistinguishable downstream.
                let write_started = Instant::now();
                match write_output(&*self.output, parent, data, self.config.mode, retry)? {
                    WriteDisposition::Written => Ok(TaskResult::written(
                        parent.clone(),
                        process_time,
                        write_started.elapsed(),
                    )),
                    WriteDisposition::SkippedExisting => {
                        Ok(TaskResult::skipped_existing(parent.clone()))
                    }
                }
            }
        }
    }

    fn drain_discarded(stream: &mut TaskStream) {
        for late in stream {
            warn!(
                tile = %late.tile(),
                outcome = %late.outcome(),
                "discarding result received after abort"
            );
        }
    }

    fn check_cancelled(&mut self) -> Result<(), BatchError> {
        if self.cancellation.is_cancelled() {
            self.abort(BatchError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn abort<T>(&mut self, err: BatchError) -> Result<T, BatchError> {
        self.transition(BatchState::Aborted);
        Err(err)
    }

    fn transition(&mut self, state: BatchState) {
        debug!(from = %self.state, to = %state, "batch state transition");
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverviewOptions, ZoomLevels};
    use crate::grid::{Bounds, GridKind, TilePyramid};
    use crate::io::{MemoryOutput, SourceError};
    use crate::process::{ProcessContext, ProcessError, ProcessOutput};
    use crate::raster::TileData;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn pyramid() -> TilePyramid {
        TilePyramid::new(GridKind::Geodetic)
    }

    struct ConstProcessor;

    impl TileProcessor for ConstProcessor {
        fn name(&self) -> &str {
            "const"
        }
        fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
            Ok(ProcessOutput::Data(TileData::filled(
                ctx.tile().output_shape(),
                1.0,
                -1.0,
            )))
        }
    }

    fn config(zooms: ZoomLevels) -> BatchConfig {
        BatchConfig::builder(pyramid(), zooms)
            .sequential()
            .build()
            .unwrap()
    }

    #[test]
    fn test_flat_batch_writes_all_tiles() {
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler = BatchScheduler::new(
            config(ZoomLevels::new(0, 1).unwrap()),
            vec![],
            output.clone(),
            Arc::new(ConstProcessor),
        )
        .unwrap();

        let summary = scheduler.run().unwrap();
        // 2 tiles at zoom 0 + 8 at zoom 1.
        assert_eq!(summary.written, 10);
        assert_eq!(output.write_count(), 10);
        assert_eq!(scheduler.state(), BatchState::Done);
        assert!(output.is_closed());
    }

    #[test]
    fn test_batch_cannot_run_twice() {
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler = BatchScheduler::new(
            config(ZoomLevels::single(0).unwrap()),
            vec![],
            output,
            Arc::new(ConstProcessor),
        )
        .unwrap();

        scheduler.run().unwrap();
        assert!(matches!(
            scheduler.run(),
            Err(BatchError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_area_is_configuration_error() {
        let cfg = BatchConfig::builder(pyramid(), ZoomLevels::single(2).unwrap())
            .bounds(Bounds::new(500.0, 0.0, 600.0, 10.0))
            .sequential()
            .build()
            .unwrap();
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler =
            BatchScheduler::new(cfg, vec![], output.clone(), Arc::new(ConstProcessor)).unwrap();

        assert!(matches!(
            scheduler.run(),
            Err(BatchError::Configuration(_))
        ));
        assert_eq!(scheduler.state(), BatchState::Aborted);
        // Teardown still ran.
        assert!(output.is_closed());
    }

    #[test]
    fn test_empty_area_allowed_when_requested() {
        let cfg = BatchConfig::builder(pyramid(), ZoomLevels::single(2).unwrap())
            .bounds(Bounds::new(500.0, 0.0, 600.0, 10.0))
            .allow_empty_area(true)
            .sequential()
            .build()
            .unwrap();
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler =
            BatchScheduler::new(cfg, vec![], output, Arc::new(ConstProcessor)).unwrap();

        let summary = scheduler.run().unwrap();
        assert_eq!(summary.tiles(), 0);
        assert_eq!(scheduler.state(), BatchState::Done);
    }

    #[test]
    fn test_abort_carries_tile_identity() {
        struct FailOnTile {
            id: (u8, u32, u32),
        }
        impl TileProcessor for FailOnTile {
            fn name(&self) -> &str {
                "fail-on-tile"
            }
            fn execute(&self, ctx: &ProcessContext<'_>) -> Result<ProcessOutput, ProcessError> {
                if ctx.tile().id() == self.id {
                    return Err(ProcessError::new("deliberate failure"));
                }
                Ok(ProcessOutput::Data(TileData::filled(
                    ctx.tile().output_shape(),
                    1.0,
                    -1.0,
                )))
            }
        }

        let output = Arc::new(MemoryOutput::new());
        let mut scheduler = BatchScheduler::new(
            config(ZoomLevels::single(1).unwrap()),
            vec![],
            output.clone(),
            Arc::new(FailOnTile { id: (1, 1, 2) }),
        )
        .unwrap();

        let err = scheduler.run().unwrap_err();
        match err {
            BatchError::TileFailed {
                zoom, row, col, ..
            } => {
                assert_eq!((zoom, row, col), (1, 1, 2));
            }
            other => panic!("expected TileFailed, got {other:?}"),
        }
        assert_eq!(scheduler.state(), BatchState::Aborted);
        assert!(output.is_closed());
    }

    #[test]
    fn test_external_cancellation_aborts() {
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler = BatchScheduler::new(
            config(ZoomLevels::new(0, 3).unwrap()),
            vec![],
            output,
            Arc::new(ConstProcessor),
        )
        .unwrap();

        scheduler.cancellation().cancel();
        assert!(matches!(scheduler.run(), Err(BatchError::Cancelled)));
        assert_eq!(scheduler.state(), BatchState::Aborted);
    }

    #[test]
    fn test_overview_batch_aggregates_upward() {
        let cfg = BatchConfig::builder(pyramid(), ZoomLevels::new(0, 2).unwrap())
            .overviews(OverviewOptions::default())
            .sequential()
            .build()
            .unwrap();
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler =
            BatchScheduler::new(cfg, vec![], output.clone(), Arc::new(ConstProcessor)).unwrap();

        let summary = scheduler.run().unwrap();
        // Everything written: 32 baselevel tiles + 8 + 2 overview tiles.
        assert_eq!(summary.written, 42);

        // Overview tiles hold the aggregated constant.
        let root = pyramid().tile(0, 0, 0).unwrap();
        let data = output.read(&root).unwrap().unwrap();
        assert_eq!(data.get(0, 0), Some(1.0));
    }

    #[test]
    fn test_input_cleanup_runs_on_abort() {
        struct TrackedInput {
            cleaned: Arc<AtomicBool>,
        }
        impl InputSource for TrackedInput {
            fn name(&self) -> &str {
                "tracked"
            }
            fn coverage(&self) -> Option<Bounds> {
                None
            }
            fn open(
                &self,
                _tile: &Tile,
            ) -> Result<Box<dyn crate::io::InputTile>, SourceError> {
                Err(SourceError::InvalidData("always broken".into()))
            }
            fn cleanup(&self) {
                self.cleaned.store(true, Ordering::SeqCst);
            }
        }

        let cleaned = Arc::new(AtomicBool::new(false));
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler = BatchScheduler::new(
            config(ZoomLevels::single(0).unwrap()),
            vec![Arc::new(TrackedInput {
                cleaned: cleaned.clone(),
            }) as Arc<dyn InputSource>],
            output.clone(),
            Arc::new(ConstProcessor),
        )
        .unwrap();

        assert!(scheduler.run().is_err());
        assert!(cleaned.load(Ordering::SeqCst));
        assert!(output.is_closed());
    }

    #[test]
    fn test_count_tiles_spans_all_zooms() {
        let scheduler = BatchScheduler::new(
            config(ZoomLevels::new(0, 1).unwrap()),
            vec![],
            Arc::new(MemoryOutput::new()),
            Arc::new(ConstProcessor),
        )
        .unwrap();
        assert_eq!(scheduler.count_tiles().unwrap(), 10);
    }

    #[test]
    fn test_results_flow_through_sink() {
        let output = Arc::new(MemoryOutput::new());
        let mut scheduler = BatchScheduler::new(
            config(ZoomLevels::single(1).unwrap()),
            vec![],
            output,
            Arc::new(ConstProcessor),
        )
        .unwrap();

        let seen = AtomicUsize::new(0);
        scheduler
            .run_with(|result| {
                assert_eq!(result.outcome(), TaskOutcome::Written);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }
}
